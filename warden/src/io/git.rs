//! Git adapter for the watched checkout.
//!
//! Warden reads HEAD and fast-forwards from the remote; nothing else. Every
//! call runs under a timeout so a hung remote cannot stall the loop.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, instrument, warn};

use crate::core::types::Revision;
use crate::io::process::{CommandOutput, CommandSpec};

const GIT_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;
const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// `git` subprocess calls against one checkout.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: DEFAULT_GIT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Full revision checked out at HEAD.
    pub fn head_revision(&self) -> Result<Revision> {
        let output = self.git(&["rev-parse", "HEAD"])?;
        let sha = output.stdout_lossy();
        if sha.trim().is_empty() {
            bail!("git rev-parse HEAD printed nothing");
        }
        Ok(Revision::new(sha))
    }

    /// Name of the checked-out branch. Errors on a detached HEAD.
    pub fn current_branch(&self) -> Result<String> {
        let output = self.git(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = output.stdout_lossy().trim().to_string();
        if name == "HEAD" {
            bail!("detached HEAD has no branch to pull");
        }
        Ok(name)
    }

    /// Fast-forward from `remote`. An empty `branch` pulls the configured upstream.
    #[instrument(skip_all, fields(remote, branch))]
    pub fn pull(&self, remote: &str, branch: &str) -> Result<()> {
        let mut args = vec!["pull", "--ff-only"];
        if !remote.is_empty() {
            args.push(remote);
            if !branch.is_empty() {
                args.push(branch);
            }
        }
        let target = if branch.is_empty() {
            match self.current_branch() {
                Ok(name) => name,
                Err(err) => {
                    debug!(err = %err, "current branch unknown");
                    "HEAD".to_string()
                }
            }
        } else {
            branch.to_string()
        };
        let remote = if remote.is_empty() { "upstream" } else { remote };
        debug!(?args, branch = %target, "pulling");
        self.git(&args)
            .with_context(|| format!("pull {target} from {remote}"))?;
        Ok(())
    }

    /// Fail when tracked files have local modifications. Untracked files never
    /// block a fast-forward and are ignored.
    pub fn ensure_clean(&self) -> Result<()> {
        let output = self.git(&["status", "--porcelain=v1", "--untracked-files=no"])?;
        let modified = modified_paths(&output.stdout_lossy());
        if modified.is_empty() {
            return Ok(());
        }
        warn!(count = modified.len(), "checkout has local modifications");
        bail!(
            "checkout has local modifications: {}",
            modified.join(", ")
        );
    }

    fn git(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut argv = vec!["git"];
        argv.extend_from_slice(args);
        // Never block on a credential prompt inside the loop.
        let spec = CommandSpec::new(argv)
            .env("GIT_TERMINAL_PROMPT", "0")
            .workdir(&self.workdir);
        let output = spec.run(self.timeout, GIT_OUTPUT_LIMIT_BYTES)?;
        if output.timed_out {
            bail!("{} timed out after {:?}", spec.display(), self.timeout);
        }
        if !output.success() {
            bail!("{} failed: {}", spec.display(), output.stderr_lossy().trim());
        }
        Ok(output)
    }
}

/// Paths from `git status --porcelain=v1` output; renames report the new path.
fn modified_paths(porcelain: &str) -> Vec<String> {
    porcelain
        .lines()
        .filter_map(|line| line.get(3..))
        .map(|path| match path.split_once(" -> ") {
            Some((_, new)) => new.trim().to_string(),
            None => path.trim().to_string(),
        })
        .filter(|path| !path.is_empty())
        .collect()
}
