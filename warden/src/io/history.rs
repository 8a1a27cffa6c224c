//! Cycle history log (`.warden/history.jsonl`), one JSON report per line.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::cycle::CycleReport;

pub const HISTORY_FILE: &str = "history.jsonl";

pub fn append_report(path: &Path, report: &CycleReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create history dir {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(report).context("serialize cycle report")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open history {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append history {}", path.display()))?;
    Ok(())
}

/// Last `limit` reports, oldest first. A missing log is empty.
pub fn read_recent(path: &Path, limit: usize) -> Result<Vec<CycleReport>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read history {}", path.display()))?;
    let lines: Vec<(usize, &str)> = contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .collect();
    let skip = lines.len().saturating_sub(limit);
    lines
        .into_iter()
        .skip(skip)
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse history {} line {}", path.display(), idx + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Revision, UpdateOutcome};

    fn report(cycle: u64) -> CycleReport {
        CycleReport {
            cycle,
            process: "validator".to_string(),
            started_at: "2026-10-19T00:00:00+00:00".to_string(),
            ended_at: "2026-10-19T00:00:01+00:00".to_string(),
            duration_ms: 1000,
            update: UpdateOutcome::Unchanged {
                revision: Revision::new("abc"),
            },
            installed: false,
            tests: None,
            restarted: false,
            status: None,
            signal: None,
            pinged: false,
            relaunched: false,
            errors: Vec::new(),
        }
    }

    #[test]
    fn appends_and_reads_most_recent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".warden").join(HISTORY_FILE);
        for cycle in 1..=5 {
            append_report(&path, &report(cycle)).expect("append");
        }
        let recent = read_recent(&path, 2).expect("read");
        let cycles: Vec<u64> = recent.iter().map(|r| r.cycle).collect();
        assert_eq!(cycles, vec![4, 5]);
    }

    #[test]
    fn missing_history_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let recent = read_recent(&temp.path().join(HISTORY_FILE), 10).expect("read");
        assert!(recent.is_empty());
    }

    #[test]
    fn corrupt_line_names_line_number() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(HISTORY_FILE);
        append_report(&path, &report(1)).expect("append");
        let mut file = OpenOptions::new().append(true).open(&path).expect("open");
        file.write_all(b"{not json}\n").expect("write");
        let err = read_recent(&path, 10).expect_err("corrupt");
        assert!(format!("{err:#}").contains("line 2"), "{err:#}");
    }
}
