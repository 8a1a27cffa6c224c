//! Process supervisor adapter.
//!
//! The managed process is owned by an external supervisor (pm2). Warden only
//! asks it three things: what is the status, restart, and start from scratch.
//! Tests use scripted supervisors that never spawn processes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::core::launch::{LaunchSpec, launch_args, restart_args, validate_process_name};
use crate::io::process::CommandSpec;

/// Raw status reported for a process the supervisor does not know about.
pub const MISSING_STATUS: &str = "missing";

/// Abstraction over process supervisors.
pub trait Supervisor {
    /// Raw status string for `name` (`online`, `stopped`, `errored`, `missing`, ...).
    fn status(&self, name: &str) -> Result<String>;
    /// Restart an existing process so it picks up new code.
    fn restart(&self, name: &str) -> Result<()>;
    /// Start the process from its launch spec (used when it is not online).
    fn launch(&self, name: &str, spec: &LaunchSpec) -> Result<()>;
}

/// Supervisor backed by the `pm2` CLI.
#[derive(Debug, Clone)]
pub struct Pm2Supervisor {
    program: String,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl Pm2Supervisor {
    pub fn new(
        program: impl Into<String>,
        workdir: impl Into<PathBuf>,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            program: program.into(),
            workdir: workdir.into(),
            timeout,
            output_limit_bytes,
        }
    }

    fn command(&self, args: Vec<String>) -> CommandSpec {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(self.program.clone());
        argv.extend(args);
        CommandSpec::new(argv).workdir(&self.workdir)
    }
}

impl Supervisor for Pm2Supervisor {
    #[instrument(skip_all, fields(name))]
    fn status(&self, name: &str) -> Result<String> {
        validate_process_name(name)?;
        let output = self
            .command(vec!["jlist".to_string()])
            .run_checked(self.timeout, self.output_limit_bytes)
            .context("query pm2 process list")?;
        if output.stdout_truncated > 0 {
            warn!(
                truncated = output.stdout_truncated,
                "pm2 jlist output truncated"
            );
        }
        let status = status_from_jlist(&output.stdout_lossy(), name)?;
        debug!(name, status = %status, "supervisor status");
        Ok(status)
    }

    #[instrument(skip_all, fields(name))]
    fn restart(&self, name: &str) -> Result<()> {
        info!(name, "restarting process");
        self.command(restart_args(name)?)
            .run_checked(self.timeout, self.output_limit_bytes)
            .with_context(|| format!("restart {name}"))?;
        Ok(())
    }

    #[instrument(skip_all, fields(name))]
    fn launch(&self, name: &str, spec: &LaunchSpec) -> Result<()> {
        // A stale errored/stopped entry would make `start` collide with the name.
        if let Err(err) = self
            .command(vec!["delete".to_string(), name.to_string()])
            .run(self.timeout, self.output_limit_bytes)
        {
            debug!(err = %err, "pm2 delete before start failed");
        }
        info!(name, script = %spec.script, "launching process");
        self.command(launch_args(name, spec)?)
            .run_checked(self.timeout, self.output_limit_bytes)
            .with_context(|| format!("launch {name}"))?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct JlistEntry {
    name: String,
    #[serde(default)]
    pm2_env: Option<JlistEnv>,
}

#[derive(Debug, Deserialize)]
struct JlistEnv {
    #[serde(default)]
    status: Option<String>,
}

/// Extract the status of `name` from `pm2 jlist` output.
///
/// pm2 may print banner lines (themselves starting with `[PM2]`) before the JSON
/// array, so every `[` is tried as the start of the array.
pub fn status_from_jlist(raw: &str, name: &str) -> Result<String> {
    let entries = parse_jlist(raw)?;
    let status = entries
        .into_iter()
        .find(|entry| entry.name == name)
        .map(|entry| {
            entry
                .pm2_env
                .and_then(|env| env.status)
                .unwrap_or_else(|| "unknown".to_string())
        })
        .unwrap_or_else(|| MISSING_STATUS.to_string());
    Ok(status)
}

fn parse_jlist(raw: &str) -> Result<Vec<JlistEntry>> {
    let mut last_err = None;
    for (idx, _) in raw.match_indices('[') {
        match serde_json::from_str::<Vec<JlistEntry>>(raw[idx..].trim()) {
            Ok(entries) => return Ok(entries),
            Err(err) => last_err = Some(err),
        }
    }
    match last_err {
        Some(err) => Err(err).context("parse pm2 jlist output"),
        None => Err(anyhow!("pm2 jlist output contains no JSON array")),
    }
}
