//! Watch state storage for cycle bookkeeping.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::Revision;

pub const STATE_FILE: &str = "state.json";

/// Persisted bookkeeping for the watched process (`.warden/state.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchState {
    /// Name of the supervised process the counters belong to.
    pub process: Option<String>,
    /// Revision checked out after the last cycle.
    pub last_revision: Option<Revision>,
    /// Raw supervisor status seen in the last cycle.
    pub last_status: Option<String>,
    /// Completed cycles (monotonically increasing).
    pub cycles: u64,
    /// Restarts triggered by a revision change.
    pub restarts: u64,
    /// Relaunches triggered by a non-online status.
    pub relaunches: u64,
    /// RFC 3339 timestamp of the last completed cycle.
    pub last_cycle_at: Option<String>,
}

impl WatchState {
    /// Counters are per process; switching process names starts over.
    pub fn for_process(self, name: &str) -> Self {
        if self.process.as_deref() == Some(name) {
            return self;
        }
        Self {
            process: Some(name.to_string()),
            ..Self::default()
        }
    }
}

/// Load watch state from disk. A missing file yields the default state.
pub fn load_state(path: &Path) -> Result<WatchState> {
    if !path.exists() {
        debug!(path = %path.display(), "no watch state yet");
        return Ok(WatchState::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read watch state {}", path.display()))?;
    let state: WatchState = serde_json::from_str(&contents)
        .with_context(|| format!("parse watch state {}", path.display()))?;
    debug!(process = ?state.process, cycles = state.cycles, "watch state loaded");
    Ok(state)
}

/// Atomically write watch state to disk (temp file + rename).
pub fn write_state(path: &Path, state: &WatchState) -> Result<()> {
    debug!(path = %path.display(), cycles = state.cycles, "writing watch state");
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("watch state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp watch state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace watch state {}", path.display()))?;
    Ok(())
}
