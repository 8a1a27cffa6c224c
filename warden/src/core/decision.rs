//! Cycle decisions: what to do given the observed revisions and process status.

use super::types::{HealthSignal, ProcessStatus, Revision, UpdateOutcome};

/// Literal status string the supervisor reports for a healthy process.
pub const ONLINE: &str = "online";

/// Actions to take after the pull phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateActions {
    pub install: bool,
    pub restart: bool,
}

/// Actions to take after querying the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthActions {
    pub signal: HealthSignal,
    pub relaunch: bool,
}

pub fn revision_changed(before: &Revision, after: &Revision) -> bool {
    before != after
}

/// Build the pull outcome from the revisions seen before and after `git pull`.
pub fn update_outcome(before: Revision, after: Revision) -> UpdateOutcome {
    if revision_changed(&before, &after) {
        UpdateOutcome::Updated {
            from: before,
            to: after,
        }
    } else {
        UpdateOutcome::Unchanged { revision: after }
    }
}

/// Only the exact string `online` (surrounding whitespace ignored) counts as online.
pub fn classify_status(raw: &str) -> ProcessStatus {
    let trimmed = raw.trim();
    if trimmed == ONLINE {
        ProcessStatus::Online
    } else {
        ProcessStatus::NotOnline(trimmed.to_string())
    }
}

pub fn health_signal(status: &ProcessStatus) -> HealthSignal {
    if status.is_online() {
        HealthSignal::Success
    } else {
        HealthSignal::Failure
    }
}

pub fn plan_update(outcome: &UpdateOutcome) -> UpdateActions {
    match outcome {
        UpdateOutcome::Updated { .. } => UpdateActions {
            install: true,
            restart: true,
        },
        UpdateOutcome::Unchanged { .. } | UpdateOutcome::PullFailed { .. } => UpdateActions {
            install: false,
            restart: false,
        },
    }
}

pub fn plan_health(status: &ProcessStatus) -> HealthActions {
    let signal = health_signal(status);
    HealthActions {
        signal,
        relaunch: signal == HealthSignal::Failure,
    }
}
