//! Test gate: runs the project's configured test command.
//!
//! The command gets the configured environment injected, one ignore flag per
//! ignored path, and a wall-clock timeout. A timeout never passes the gate.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::types::TestOutcome;
use crate::io::config::WardenConfig;
use crate::io::process::CommandSpec;

pub const TEST_LOG_FILE: &str = "test.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRequest {
    pub workdir: PathBuf,
    pub command: Vec<String>,
    pub ignore: Vec<String>,
    pub ignore_flag: String,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    pub log_path: PathBuf,
    pub output_limit_bytes: usize,
}

impl TestRequest {
    pub fn from_config(cfg: &WardenConfig) -> Self {
        Self {
            workdir: cfg.repo_dir.clone(),
            command: cfg.tests.command.clone(),
            ignore: cfg.tests.ignore.clone(),
            ignore_flag: cfg.tests.ignore_flag.clone(),
            env: cfg.tests.env.clone(),
            timeout: Duration::from_secs(cfg.tests.timeout_secs),
            log_path: cfg.state_path().join(TEST_LOG_FILE),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }

    /// Full argv: the configured command followed by `<flag>=<path>` per ignored path.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.command.clone();
        argv.extend(
            self.ignore
                .iter()
                .map(|path| format!("{}={}", self.ignore_flag, path)),
        );
        argv
    }

    fn command_spec(&self) -> CommandSpec {
        let mut spec = CommandSpec::new(self.argv()).workdir(&self.workdir);
        for (key, value) in &self.env {
            spec = spec.env(key, value);
        }
        spec
    }
}

pub trait TestRunner {
    fn run(&self, request: &TestRequest) -> Result<TestOutcome>;
}

/// Runs the test command as a child process.
pub struct CommandTestRunner;

impl TestRunner for CommandTestRunner {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &TestRequest) -> Result<TestOutcome> {
        let spec = request.command_spec();
        info!(command = %spec.display(), "running tests");
        let output = spec
            .run(request.timeout, request.output_limit_bytes)
            .context("run test command")?;
        write_test_log(
            &request.log_path,
            &output.render_log(),
            request.output_limit_bytes,
        )?;

        let outcome = if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "tests timed out");
            TestOutcome::TimedOut
        } else if output.status.success() {
            TestOutcome::Pass
        } else {
            warn!(exit_code = ?output.status.code(), "tests failed");
            TestOutcome::Fail
        };
        info!(outcome = ?outcome, log = %request.log_path.display(), "tests finished");
        Ok(outcome)
    }
}

fn write_test_log(path: &Path, body: &str, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create test log dir {}", parent.display()))?;
    }
    // Two streams are captured, each bounded by the limit.
    let limit = output_limit.saturating_mul(2);
    if body.len() > limit {
        let mut cut = limit;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        let truncated = format!("{}\n[truncated {} bytes]\n", &body[..cut], body.len() - cut);
        fs::write(path, truncated).with_context(|| format!("write test log {}", path.display()))?;
        return Ok(());
    }
    fs::write(path, body).with_context(|| format!("write test log {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(temp: &Path, command: &[&str]) -> TestRequest {
        TestRequest {
            workdir: temp.to_path_buf(),
            command: command.iter().map(|s| s.to_string()).collect(),
            ignore: Vec::new(),
            ignore_flag: "--ignore".to_string(),
            env: BTreeMap::new(),
            timeout: Duration::from_secs(10),
            log_path: temp.join(".warden").join(TEST_LOG_FILE),
            output_limit_bytes: 10_000,
        }
    }

    #[test]
    fn argv_appends_ignore_flags() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(temp.path(), &["pytest", "-q"]);
        req.ignore = vec!["tests/slow".to_string(), "sandbox".to_string()];
        assert_eq!(
            req.argv(),
            vec!["pytest", "-q", "--ignore=tests/slow", "--ignore=sandbox"]
        );
    }

    #[test]
    fn from_config_uses_tests_section() {
        let mut cfg = WardenConfig::default();
        cfg.repo_dir = PathBuf::from("/srv/app");
        cfg.tests.timeout_secs = 42;
        cfg.tests.env.insert("USE_TORCH".to_string(), "1".to_string());
        let req = TestRequest::from_config(&cfg);
        assert_eq!(req.timeout, Duration::from_secs(42));
        assert_eq!(req.env.get("USE_TORCH").map(String::as_str), Some("1"));
        assert_eq!(req.log_path, PathBuf::from("/srv/app/.warden/test.log"));
    }

    #[cfg(unix)]
    #[test]
    fn passing_command_passes_and_writes_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(temp.path(), &["sh", "-c", "echo env=$GATE_ENV"]);
        req.env.insert("GATE_ENV".to_string(), "injected".to_string());
        let outcome = CommandTestRunner.run(&req).expect("run");
        assert_eq!(outcome, TestOutcome::Pass);
        let log = fs::read_to_string(&req.log_path).expect("log");
        assert!(log.contains("env=injected"), "{log}");
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(temp.path(), &["sh", "-c", "exit 1"]);
        assert_eq!(CommandTestRunner.run(&req).expect("run"), TestOutcome::Fail);
    }

    #[cfg(unix)]
    #[test]
    fn slow_command_times_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(temp.path(), &["sleep", "5"]);
        req.timeout = Duration::from_millis(100);
        assert_eq!(
            CommandTestRunner.run(&req).expect("run"),
            TestOutcome::TimedOut
        );
    }

    #[test]
    fn log_is_truncated_to_limit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("test.log");
        write_test_log(&path, &"x".repeat(100), 10).expect("write");
        let log = fs::read_to_string(&path).expect("read");
        assert!(log.starts_with(&"x".repeat(20)));
        assert!(log.contains("[truncated 80 bytes]"));
    }
}
