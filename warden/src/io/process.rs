//! Helpers for running child processes with timeouts and bounded output.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// Render stdout and stderr as a single log body.
    pub fn render_log(&self) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stdout));
        if self.stdout_truncated > 0 {
            buf.push_str(&format!(
                "\n[stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.stderr_truncated > 0 {
            buf.push_str(&format!(
                "\n[stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        if self.timed_out {
            buf.push_str("\n[timed out]\n");
        }
        buf
    }
}

/// An external command described as data: argv, environment, working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            workdir: None,
        }
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn display(&self) -> String {
        self.argv.join(" ")
    }

    fn to_command(&self) -> Result<Command> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("command must be a non-empty array"))?;
        if program.trim().is_empty() {
            bail!("command program must be non-empty");
        }
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.envs(&self.env);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }

    /// Run and capture output. Non-zero exit is not an error here.
    pub fn run(&self, timeout: Duration, output_limit_bytes: usize) -> Result<CommandOutput> {
        let cmd = self.to_command()?;
        wait_with_timeout(cmd, timeout, output_limit_bytes)
            .with_context(|| format!("run {}", self.display()))
    }

    /// Run and fail on timeout or non-zero exit, quoting stderr in the error.
    #[instrument(skip_all, fields(command = %self.display()))]
    pub fn run_checked(
        &self,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Result<CommandOutput> {
        let output = self.run(timeout, output_limit_bytes)?;
        if output.timed_out {
            bail!("{} timed out after {:?}", self.display(), timeout);
        }
        if !output.status.success() {
            bail!(
                "{} failed with status {:?}: {}",
                self.display(),
                output.status.code(),
                output.stderr_lossy().trim()
            );
        }
        Ok(output)
    }
}

/// Spawn `cmd`, kill it after `timeout`, and capture at most `output_limit_bytes`
/// of each stream.
///
/// Both pipes are drained on their own threads while the child runs, so a chatty
/// child cannot block on a full pipe. Bytes past the limit are counted and dropped.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
fn wait_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().context("spawn command")?;
    debug!(pid = child.id(), "child spawned");

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        bail!("child pipes were not captured");
    };
    let stdout_reader = thread::spawn(move || drain_limited(stdout, output_limit_bytes));
    let stderr_reader = thread::spawn(move || drain_limited(stderr, output_limit_bytes));

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            child.kill().context("kill command")?;
            (child.wait().context("reap killed command")?, true)
        }
    };

    let (stdout, stdout_truncated) = join_reader(stdout_reader).context("read stdout")?;
    let (stderr, stderr_truncated) = join_reader(stderr_reader).context("read stderr")?;
    if stdout_truncated > 0 || stderr_truncated > 0 {
        debug!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

type Drained = Result<(Vec<u8>, usize)>;

fn join_reader(handle: thread::JoinHandle<Drained>) -> Drained {
    handle
        .join()
        .unwrap_or_else(|_| Err(anyhow!("output reader thread panicked")))
}

/// Keep the first `limit` bytes, discard the rest, return `(kept, discarded)`.
fn drain_limited<R: Read>(reader: R, limit: usize) -> Drained {
    let mut head = reader.take(limit as u64);
    let mut kept = Vec::new();
    head.read_to_end(&mut kept).context("read output")?;
    let discarded = io::copy(&mut head.into_inner(), &mut io::sink()).context("drain output")?;
    Ok((kept, usize::try_from(discarded).unwrap_or(usize::MAX)))
}
