//! Orchestration for a single watch cycle.
//!
//! A cycle pulls the checkout, reinstalls and restarts the process when the
//! revision moved, then asks the supervisor for the process status, reports it
//! to the health-check endpoint and relaunches the process if it is not online.
//!
//! Failures of external steps are recorded in the report and never abort the
//! cycle. Only state/history persistence errors propagate.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::decision::{classify_status, plan_health, plan_update, update_outcome};
use crate::core::launch::validate_process_name;
use crate::core::types::{HealthSignal, ProcessStatus, TestOutcome, UpdateOutcome};
use crate::io::config::WardenConfig;
use crate::io::git::Git;
use crate::io::health::HealthPinger;
use crate::io::history::{HISTORY_FILE, append_report};
use crate::io::notify::Notifier;
use crate::io::process::CommandSpec;
use crate::io::state::{STATE_FILE, load_state, write_state};
use crate::io::supervisor::Supervisor;
use crate::io::test_gate::{TestRequest, TestRunner};

/// Status label recorded when the supervisor could not be queried.
pub const UNAVAILABLE_STATUS: &str = "unavailable";

/// External collaborators a cycle talks to.
pub struct CycleDeps<'a, S, H, N, T> {
    pub supervisor: &'a S,
    pub pinger: &'a H,
    pub notifier: &'a N,
    pub tests: &'a T,
}

/// Everything that happened during one cycle (one line of `history.jsonl`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Cycle number for this process (1-indexed, monotonically increasing).
    pub cycle: u64,
    pub process: String,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
    pub update: UpdateOutcome,
    /// Dependency installer ran successfully.
    pub installed: bool,
    /// Test gate outcome, when the gate ran before a restart.
    pub tests: Option<TestOutcome>,
    pub restarted: bool,
    pub status: Option<ProcessStatus>,
    pub signal: Option<HealthSignal>,
    /// A health-check URL was actually contacted.
    pub pinged: bool,
    pub relaunched: bool,
    /// Non-fatal errors, in the order they happened.
    pub errors: Vec<String>,
}

impl CycleReport {
    pub fn is_online(&self) -> bool {
        self.status.as_ref().is_some_and(ProcessStatus::is_online)
    }

    /// One-line summary for terminals and logs.
    pub fn summary(&self) -> String {
        let update = match &self.update {
            UpdateOutcome::Unchanged { revision } => format!("unchanged@{}", revision.short(7)),
            UpdateOutcome::Updated { from, to } => {
                format!("updated {}..{}", from.short(7), to.short(7))
            }
            UpdateOutcome::PullFailed { .. } => "pull-failed".to_string(),
        };
        let status = self
            .status
            .as_ref()
            .map(|s| s.label().to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "cycle={} process={} update={} restarted={} status={} relaunched={} errors={}",
            self.cycle,
            self.process,
            update,
            self.restarted,
            status,
            self.relaunched,
            self.errors.len()
        )
    }
}

/// Execute one cycle for `process` using `cfg`.
#[instrument(skip_all, fields(process))]
pub fn run_cycle<S, H, N, T>(
    process: &str,
    cfg: &WardenConfig,
    deps: &CycleDeps<'_, S, H, N, T>,
) -> Result<CycleReport>
where
    S: Supervisor,
    H: HealthPinger,
    N: Notifier,
    T: TestRunner,
{
    validate_process_name(process)?;
    let state_dir = cfg.state_path();
    let state_path = state_dir.join(STATE_FILE);
    let mut state = load_state(&state_path)?.for_process(process);
    let cycle = state.cycles + 1;

    let started_at = Utc::now();
    let clock = Instant::now();
    info!(cycle, "cycle started");

    let mut run = CycleRun {
        process,
        cfg,
        notifier: deps.notifier,
        errors: Vec::new(),
    };

    let git = Git::new(&cfg.repo_dir).with_timeout(cfg.command_timeout());
    let update = run.pull(&git);
    let actions = plan_update(&update);

    let mut installed = false;
    let mut tests = None;
    let mut restarted = false;
    if actions.install {
        let mut proceed = run.install();
        installed = proceed && !cfg.install.command.is_empty();
        if proceed && cfg.update.test_before_restart {
            let outcome = run.test_gate(deps.tests);
            proceed = outcome.is_some_and(TestOutcome::passed);
            tests = outcome;
        }
        if proceed && actions.restart {
            restarted = run.restart(deps.supervisor);
        }
        if restarted
            && cfg.notify.on_update
            && let UpdateOutcome::Updated { from, to } = &update
        {
            run.notify(&format!(
                "{process} updated {}..{} and restarted",
                from.short(7),
                to.short(7)
            ));
        }
    }

    let status = run.query_status(deps.supervisor);
    let health = plan_health(&status);
    let pinged = run.ping(deps.pinger, health.signal);
    let relaunched = if health.relaunch {
        run.relaunch(deps.supervisor, &status)
    } else {
        false
    };

    let ended_at = Utc::now();
    let report = CycleReport {
        cycle,
        process: process.to_string(),
        started_at: started_at.to_rfc3339(),
        ended_at: ended_at.to_rfc3339(),
        duration_ms: duration_ms(clock.elapsed()),
        installed,
        tests,
        restarted,
        status: Some(status.clone()),
        signal: Some(health.signal),
        pinged,
        relaunched,
        errors: run.errors,
        update,
    };

    state.cycles = cycle;
    if let UpdateOutcome::Unchanged { revision } | UpdateOutcome::Updated { to: revision, .. } =
        &report.update
    {
        state.last_revision = Some(revision.clone());
    }
    state.last_status = Some(status.label().to_string());
    state.last_cycle_at = Some(report.ended_at.clone());
    if restarted {
        state.restarts += 1;
    }
    if relaunched {
        state.relaunches += 1;
    }
    write_state(&state_path, &state).context("persist watch state")?;
    append_report(&state_dir.join(HISTORY_FILE), &report).context("append cycle history")?;

    info!(
        cycle,
        status = %status.label(),
        restarted,
        relaunched,
        errors = report.errors.len(),
        "cycle finished"
    );
    Ok(report)
}

/// Mutable per-cycle bookkeeping shared by the phases.
struct CycleRun<'a, N> {
    process: &'a str,
    cfg: &'a WardenConfig,
    notifier: &'a N,
    errors: Vec<String>,
}

impl<N: Notifier> CycleRun<'_, N> {
    fn record(&mut self, phase: &str, err: &anyhow::Error) {
        warn!(phase, err = %format!("{err:#}"), "cycle step failed");
        self.errors.push(format!("{phase}: {err:#}"));
    }

    fn notify(&mut self, message: &str) {
        if let Err(err) = self.notifier.send(message) {
            self.record("notify", &err);
        }
    }

    fn notify_failure(&mut self, message: &str) {
        if self.cfg.notify.on_failure {
            self.notify(message);
        }
    }

    fn pull(&mut self, git: &Git) -> UpdateOutcome {
        let attempt = || -> Result<UpdateOutcome> {
            let before = git.head_revision().context("read revision before pull")?;
            if self.cfg.git.require_clean {
                git.ensure_clean()?;
            }
            git.pull(&self.cfg.git.remote, &self.cfg.git.branch)?;
            let after = git.head_revision().context("read revision after pull")?;
            Ok(update_outcome(before, after))
        };
        match attempt() {
            Ok(outcome) => {
                debug!(outcome = ?outcome, "pull finished");
                outcome
            }
            Err(err) => {
                self.record("pull", &err);
                self.notify_failure(&format!("{}: git pull failed: {err:#}", self.process));
                UpdateOutcome::PullFailed {
                    reason: format!("{err:#}"),
                }
            }
        }
    }

    /// Returns whether the cycle may go on to restart the process.
    fn install(&mut self) -> bool {
        if self.cfg.install.command.is_empty() {
            debug!("no install command configured");
            return true;
        }
        let spec = CommandSpec::new(self.cfg.install.command.clone()).workdir(&self.cfg.repo_dir);
        info!(command = %spec.display(), "installing dependencies");
        match spec.run_checked(self.cfg.command_timeout(), self.cfg.output_limit_bytes) {
            Ok(_) => true,
            Err(err) => {
                self.record("install", &err);
                self.notify_failure(&format!(
                    "{}: dependency install failed, keeping the running version: {err:#}",
                    self.process
                ));
                false
            }
        }
    }

    fn test_gate<T: TestRunner>(&mut self, runner: &T) -> Option<TestOutcome> {
        let request = TestRequest::from_config(self.cfg);
        match runner.run(&request) {
            Ok(outcome) => {
                if !outcome.passed() {
                    let message = format!(
                        "{}: tests {:?} after update, restart skipped",
                        self.process, outcome
                    );
                    self.errors.push(format!("tests: {outcome:?}"));
                    self.notify_failure(&message);
                }
                Some(outcome)
            }
            Err(err) => {
                self.record("tests", &err);
                self.notify_failure(&format!(
                    "{}: test gate could not run, restart skipped: {err:#}",
                    self.process
                ));
                None
            }
        }
    }

    fn restart<S: Supervisor>(&mut self, supervisor: &S) -> bool {
        match supervisor.restart(self.process) {
            Ok(()) => true,
            Err(err) => {
                self.record("restart", &err);
                self.notify_failure(&format!("{}: restart failed: {err:#}", self.process));
                false
            }
        }
    }

    fn query_status<S: Supervisor>(&mut self, supervisor: &S) -> ProcessStatus {
        match supervisor.status(self.process) {
            Ok(raw) => classify_status(&raw),
            Err(err) => {
                self.record("status", &err);
                ProcessStatus::NotOnline(UNAVAILABLE_STATUS.to_string())
            }
        }
    }

    fn ping<H: HealthPinger>(&mut self, pinger: &H, signal: HealthSignal) -> bool {
        match pinger.ping(signal) {
            Ok(sent) => sent,
            Err(err) => {
                self.record("health", &err);
                false
            }
        }
    }

    fn relaunch<S: Supervisor>(&mut self, supervisor: &S, status: &ProcessStatus) -> bool {
        let spec = self.cfg.launch_spec();
        match supervisor.launch(self.process, &spec) {
            Ok(()) => {
                self.notify_failure(&format!(
                    "{} was {}, relaunched",
                    self.process,
                    status.label()
                ));
                true
            }
            Err(err) => {
                self.record("relaunch", &err);
                self.notify_failure(&format!(
                    "{} was {} and relaunch failed: {err:#}",
                    self.process,
                    status.label()
                ));
                false
            }
        }
    }
}

fn duration_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
