//! Shared deterministic types for warden core logic.
//!
//! These types define stable contracts between the cycle orchestration and the
//! I/O adapters. They must not depend on external state.

use serde::{Deserialize, Serialize};

/// Opaque commit identifier as printed by `git rev-parse HEAD`.
///
/// Revisions are only ever compared for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `len` characters, for log lines and chat messages.
    pub fn short(&self, len: usize) -> &str {
        match self.0.char_indices().nth(len) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of the managed process as reported by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "raw", rename_all = "snake_case")]
pub enum ProcessStatus {
    Online,
    /// Anything other than the literal `online` (`stopped`, `errored`, `missing`, ...).
    NotOnline(String),
}

impl ProcessStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, ProcessStatus::Online)
    }

    pub fn label(&self) -> &str {
        match self {
            ProcessStatus::Online => "online",
            ProcessStatus::NotOnline(raw) => raw,
        }
    }
}

/// Which health-check endpoint a cycle reports to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthSignal {
    Success,
    Failure,
}

/// Result of the pull phase of a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateOutcome {
    Unchanged { revision: Revision },
    Updated { from: Revision, to: Revision },
    PullFailed { reason: String },
}

/// Outcome of running the configured test command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Pass,
    Fail,
    TimedOut,
}

impl TestOutcome {
    pub fn passed(self) -> bool {
        self == TestOutcome::Pass
    }
}
