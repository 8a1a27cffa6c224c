//! Deploy execution: run plan steps, notify the chat webhook, write the record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use warden::io::git::Git;
use warden::io::notify::Notifier;
use warden::io::process::{CommandOutput, CommandSpec};

use crate::config::{DeployConfig, resolve_target};
use crate::plan::{DeployPlan, PlanStep, build_plan};
use crate::record::{
    DeployOutcome, DeployRecord, file_sha256, record_id, short_sha, unique_record_id, write_record,
};

/// Keep this much stderr per step in records and failure messages.
const STDERR_TAIL_BYTES: usize = 2_000;

/// Runs a single plan step. Tests substitute scripted runners.
pub trait StepRunner {
    fn run_step(&self, step: &PlanStep) -> Result<CommandOutput>;
}

/// Runs steps as local subprocesses with a timeout.
#[derive(Debug, Clone)]
pub struct CommandStepRunner {
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl CommandStepRunner {
    pub fn from_config(cfg: &DeployConfig) -> Self {
        Self {
            workdir: cfg.source_dir.clone(),
            timeout: cfg.command_timeout(),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }
}

impl StepRunner for CommandStepRunner {
    fn run_step(&self, step: &PlanStep) -> Result<CommandOutput> {
        CommandSpec::new(step.argv.clone())
            .workdir(&self.workdir)
            .run(self.timeout, self.output_limit_bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub label: String,
    pub command: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    /// Tail of stderr, or the spawn error when the command never ran.
    pub stderr: String,
}

impl StepResult {
    /// One-line reason for failure messages.
    pub fn failure_reason(&self) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        let last_line = self.stderr.lines().rev().find(|l| !l.trim().is_empty());
        match (self.exit_code, last_line) {
            (Some(code), Some(line)) => format!("exit {code}: {}", line.trim()),
            (Some(code), None) => format!("exit {code}"),
            (None, Some(line)) => line.trim().to_string(),
            (None, None) => "killed".to_string(),
        }
    }
}

/// Run steps in order, stopping after the first failure.
#[instrument(skip_all, fields(steps = plan.steps.len()))]
pub fn execute_plan<R: StepRunner>(plan: &DeployPlan, runner: &R) -> Vec<StepResult> {
    let mut results = Vec::with_capacity(plan.steps.len());
    for step in &plan.steps {
        info!(step = %step.label, "running deploy step");
        debug!(command = %step.display(), "step command");
        let started = Instant::now();
        let result = match runner.run_step(step) {
            Ok(output) => StepResult {
                label: step.label.clone(),
                command: step.display(),
                success: output.success(),
                exit_code: output.status.code(),
                timed_out: output.timed_out,
                duration_ms: duration_ms(started.elapsed()),
                stderr: tail(&output.stderr_lossy(), STDERR_TAIL_BYTES),
            },
            Err(err) => StepResult {
                label: step.label.clone(),
                command: step.display(),
                success: false,
                exit_code: None,
                timed_out: false,
                duration_ms: duration_ms(started.elapsed()),
                stderr: format!("{err:#}"),
            },
        };
        let failed = !result.success;
        if failed {
            warn!(step = %result.label, reason = %result.failure_reason(), "deploy step failed");
        }
        results.push(result);
        if failed {
            break;
        }
    }
    results
}

/// Inputs from the invoking environment.
#[derive(Debug, Clone)]
pub struct DeployContext<'a> {
    pub config_path: &'a Path,
    /// Environment variables (CI secrets).
    pub env: &'a BTreeMap<String, String>,
}

/// Resolve the target, execute the plan, notify, and persist a record.
///
/// A failed step does not make this return `Err`; the record carries the
/// outcome. `Err` means the deploy could not be attempted or recorded.
#[instrument(skip_all)]
pub fn run_deploy<R, N>(
    cfg: &DeployConfig,
    ctx: &DeployContext<'_>,
    runner: &R,
    notifier: &N,
) -> Result<DeployRecord>
where
    R: StepRunner,
    N: Notifier + ?Sized,
{
    let target = resolve_target(&cfg.target, ctx.env)?;
    let plan = build_plan(cfg, &target);

    let started_at = Utc::now();
    let started = Instant::now();
    let mut errors = Vec::new();

    let revision = match Git::new(&cfg.source_dir).head_revision() {
        Ok(rev) => Some(rev.as_str().to_string()),
        Err(err) => {
            errors.push(format!("revision: {err:#}"));
            None
        }
    };
    let config_hash = if ctx.config_path.exists() {
        match file_sha256(ctx.config_path) {
            Ok(hash) => Some(hash),
            Err(err) => {
                errors.push(format!("config hash: {err:#}"));
                None
            }
        }
    } else {
        None
    };
    let id = unique_record_id(&cfg.records_path(), record_id(started_at, revision.as_deref()));
    info!(id = %id, destination = %plan.destination, "deploy started");

    let steps = execute_plan(&plan, runner);
    let failed = steps.iter().find(|s| !s.success);
    let outcome = if failed.is_some() {
        DeployOutcome::Failed
    } else {
        DeployOutcome::Success
    };

    let vars = MessageVars {
        sha: revision.as_deref().unwrap_or("unknown"),
        destination: &plan.destination,
        id: &id,
        step: failed.map(|s| s.label.as_str()).unwrap_or(""),
        error: &failed.map(StepResult::failure_reason).unwrap_or_default(),
    };
    let template = match outcome {
        DeployOutcome::Success => &cfg.notify.success_template,
        DeployOutcome::Failed => &cfg.notify.failure_template,
    };
    let message = render_message(template, &vars);
    let notified = match notifier.send(&message) {
        Ok(()) => true,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "deploy notification failed");
            errors.push(format!("notify: {err:#}"));
            false
        }
    };

    let failed_step = failed.map(|s| s.label.clone());
    let record = DeployRecord {
        id,
        revision,
        destination: plan.destination.clone(),
        config_hash,
        outcome,
        failed_step,
        steps,
        notified,
        start_time: started_at.to_rfc3339(),
        end_time: Utc::now().to_rfc3339(),
        duration_secs: started.elapsed().as_millis() as f64 / 1000.0,
        errors,
    };
    let path = write_record(&cfg.records_path(), &record).context("write deploy record")?;
    info!(outcome = ?record.outcome, record = %path.display(), "deploy finished");
    Ok(record)
}

/// Values substituted into notification templates.
#[derive(Debug)]
pub struct MessageVars<'a> {
    pub sha: &'a str,
    pub destination: &'a str,
    pub id: &'a str,
    pub step: &'a str,
    pub error: &'a str,
}

/// Fill `{name}` placeholders in one pass; substituted text is never rescanned.
/// Unknown placeholders are left as written.
pub fn render_message(template: &str, vars: &MessageVars<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after.find('}').and_then(|close| {
            let value = match &after[..close] {
                "short_sha" => short_sha(vars.sha),
                "sha" => vars.sha,
                "destination" => vars.destination,
                "id" => vars.id,
                "step" => vars.step,
                "error" => vars.error,
                _ => return None,
            };
            Some((value, close))
        });
        match value {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn tail(text: &str, max_bytes: usize) -> String {
    let trimmed = text.trim_end();
    if trimmed.len() <= max_bytes {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - max_bytes;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

fn duration_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::process::Command;

    use anyhow::bail;
    use tempfile::tempdir;
    use warden::test_support::{RecordingNotifier, TestRepo};

    use super::*;
    use crate::config::TargetConfig;
    use crate::record::load_records;

    /// Succeeds for every step except those whose label starts with `fail_on`.
    struct ScriptedRunner {
        fail_on: Option<&'static str>,
        spawn_error: bool,
        seen: RefCell<Vec<String>>,
    }

    impl ScriptedRunner {
        fn ok() -> Self {
            Self {
                fail_on: None,
                spawn_error: false,
                seen: RefCell::new(Vec::new()),
            }
        }

        fn failing(label: &'static str) -> Self {
            Self {
                fail_on: Some(label),
                ..Self::ok()
            }
        }

        fn seen(&self) -> Vec<String> {
            self.seen.borrow().clone()
        }
    }

    impl StepRunner for ScriptedRunner {
        fn run_step(&self, step: &PlanStep) -> Result<CommandOutput> {
            self.seen.borrow_mut().push(step.label.clone());
            let fail = self.fail_on.is_some_and(|l| step.label.starts_with(l));
            if fail && self.spawn_error {
                bail!("spawn {}: No such file or directory", step.argv[0]);
            }
            let script = if fail {
                "echo 'Permission denied (publickey).' >&2; exit 255"
            } else {
                "exit 0"
            };
            CommandSpec::new(["sh", "-c", script]).run(Duration::from_secs(10), 10_000)
        }
    }

    fn env() -> BTreeMap<String, String> {
        [("DEPLOY_HOST", "10.0.0.5"), ("DEPLOY_USER", "ci")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn cfg(source_dir: &Path) -> DeployConfig {
        DeployConfig {
            source_dir: source_dir.to_path_buf(),
            paths: vec!["neurons".to_string(), "setup.py".to_string()],
            remote_commands: vec!["pm2 restart validator".to_string()],
            target: TargetConfig {
                key_env: String::new(),
                ..TargetConfig::default()
            },
            ..DeployConfig::default()
        }
    }

    fn plan(labels: &[&str]) -> DeployPlan {
        DeployPlan {
            destination: "ci@h:22:app".to_string(),
            steps: labels
                .iter()
                .map(|l| PlanStep {
                    label: l.to_string(),
                    argv: vec!["true".to_string()],
                })
                .collect(),
        }
    }

    #[test]
    fn execute_runs_every_step_on_success() {
        let runner = ScriptedRunner::ok();
        let results = execute_plan(&plan(&["a", "b", "c"]), &runner);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(runner.seen(), vec!["a", "b", "c"]);
    }

    #[test]
    fn execute_stops_at_first_failure() {
        let runner = ScriptedRunner::failing("b");
        let results = execute_plan(&plan(&["a", "b", "c"]), &runner);
        assert_eq!(runner.seen(), vec!["a", "b"]);
        assert_eq!(results.len(), 2);
        assert!(!results[1].success);
        assert_eq!(results[1].exit_code, Some(255));
        assert_eq!(
            results[1].failure_reason(),
            "exit 255: Permission denied (publickey)."
        );
    }

    #[test]
    fn spawn_errors_fail_the_step() {
        let runner = ScriptedRunner {
            spawn_error: true,
            ..ScriptedRunner::failing("a")
        };
        let results = execute_plan(&plan(&["a", "b"]), &runner);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].exit_code, None);
        assert!(results[0].failure_reason().contains("No such file"));
    }

    #[test]
    fn real_commands_run_in_source_dir() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join("marker"), "x").expect("write");
        let runner = CommandStepRunner {
            workdir: temp.path().to_path_buf(),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
        };
        let step = PlanStep {
            label: "check".to_string(),
            argv: vec!["test".to_string(), "-f".to_string(), "marker".to_string()],
        };
        let output = runner.run_step(&step).expect("run");
        assert!(output.success());
    }

    #[test]
    fn successful_deploy_notifies_and_records() {
        let repo = TestRepo::new().expect("repo");
        let cfg = cfg(repo.path());
        let sha = head(repo.path());
        let runner = ScriptedRunner::ok();
        let notifier = RecordingNotifier::default();
        let env = env();
        let ctx = DeployContext {
            config_path: &repo.path().join("deploy.toml"),
            env: &env,
        };

        let record = run_deploy(&cfg, &ctx, &runner, &notifier).expect("deploy");
        assert_eq!(record.outcome, DeployOutcome::Success);
        assert_eq!(record.revision.as_deref(), Some(sha.as_str()));
        assert_eq!(record.steps.len(), 4);
        assert!(record.notified);
        assert_eq!(record.config_hash, None);
        assert_eq!(
            notifier.messages(),
            vec![format!("Deployed {} to ci@10.0.0.5:22:validator", &sha[..7])]
        );

        let (records, _) = load_records(&cfg.records_path()).expect("records");
        assert_eq!(records, vec![record]);
    }

    #[test]
    fn failed_deploy_names_step_in_message() {
        let repo = TestRepo::new().expect("repo");
        let cfg = cfg(repo.path());
        let runner = ScriptedRunner::failing("copy setup.py");
        let notifier = RecordingNotifier::default();
        let env = env();
        let ctx = DeployContext {
            config_path: &repo.path().join("deploy.toml"),
            env: &env,
        };

        let record = run_deploy(&cfg, &ctx, &runner, &notifier).expect("deploy");
        assert_eq!(record.outcome, DeployOutcome::Failed);
        assert_eq!(record.failed_step.as_deref(), Some("copy setup.py"));
        assert_eq!(record.steps.len(), 3);
        let messages = notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(
            messages[0].ends_with(
                "failed at copy setup.py: exit 255: Permission denied (publickey)."
            ),
            "{}",
            messages[0]
        );
    }

    #[test]
    fn missing_secrets_abort_before_any_step() {
        let temp = tempdir().expect("tempdir");
        let cfg = cfg(temp.path());
        let runner = ScriptedRunner::ok();
        let notifier = RecordingNotifier::default();
        let env = BTreeMap::new();
        let ctx = DeployContext {
            config_path: &temp.path().join("deploy.toml"),
            env: &env,
        };

        let err = run_deploy(&cfg, &ctx, &runner, &notifier).expect_err("no secrets");
        assert!(err.to_string().contains("DEPLOY_HOST"), "{err}");
        assert!(runner.seen().is_empty());
        assert!(notifier.messages().is_empty());
    }

    #[test]
    fn outside_git_records_error_and_unknown_sha() {
        let temp = tempdir().expect("tempdir");
        let mut cfg = cfg(temp.path());
        cfg.notify.success_template = "{id} {sha}".to_string();
        let runner = ScriptedRunner::ok();
        let notifier = RecordingNotifier::default();
        let env = env();
        let ctx = DeployContext {
            config_path: &temp.path().join("deploy.toml"),
            env: &env,
        };

        let record = run_deploy(&cfg, &ctx, &runner, &notifier).expect("deploy");
        assert_eq!(record.revision, None);
        assert!(record.id.ends_with("-nogit"));
        assert!(record.errors[0].starts_with("revision:"), "{:?}", record.errors);
        assert_eq!(notifier.messages(), vec![format!("{} unknown", record.id)]);
    }

    #[test]
    fn renders_all_placeholders() {
        let vars = MessageVars {
            sha: "0123456789abcdef",
            destination: "ci@h:22:app",
            id: "deploy-1",
            step: "copy neurons",
            error: "exit 1",
        };
        assert_eq!(
            render_message("{id} {short_sha} {sha} {destination} {step} {error}", &vars),
            "deploy-1 0123456 0123456789abcdef ci@h:22:app copy neurons exit 1"
        );
    }

    #[test]
    fn substituted_values_are_not_expanded_again() {
        let vars = MessageVars {
            sha: "0123456789abcdef",
            destination: "ci@h:22:app",
            id: "deploy-1",
            step: "run echo {error}",
            error: "exit 1: {sha}",
        };
        assert_eq!(
            render_message("failed at {step}: {error} {unknown} {", &vars),
            "failed at run echo {error}: exit 1: {sha} {unknown} {"
        );
    }

    #[test]
    fn tail_keeps_end_of_output() {
        assert_eq!(tail("abcdef\n", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
    }

    fn head(dir: &Path) -> String {
        let out = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(dir)
            .output()
            .expect("rev-parse");
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }
}
