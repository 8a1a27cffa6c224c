//! Deployment records under `.deploy/records/<id>.json`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::run::StepResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployOutcome {
    Success,
    Failed,
}

/// Everything known about one deploy, persisted for `deploy history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployRecord {
    pub id: String,
    /// Deployed commit; `None` when the source dir is not a git checkout.
    pub revision: Option<String>,
    pub destination: String,
    /// SHA-256 of the config file, when one exists.
    pub config_hash: Option<String>,
    pub outcome: DeployOutcome,
    pub failed_step: Option<String>,
    pub steps: Vec<StepResult>,
    pub notified: bool,
    pub start_time: String,
    pub end_time: String,
    pub duration_secs: f64,
    /// Non-fatal errors (revision lookup, notification).
    pub errors: Vec<String>,
}

impl DeployRecord {
    pub fn summary(&self) -> String {
        format!(
            "deploy={} outcome={:?} revision={} destination={} steps={}{}",
            self.id,
            self.outcome,
            self.revision.as_deref().map(short_sha).unwrap_or("-"),
            self.destination,
            self.steps.len(),
            self.failed_step
                .as_deref()
                .map(|s| format!(" failed_step={s:?}"))
                .unwrap_or_default()
        )
    }
}

/// Sortable id: `deploy-<utc timestamp, ms>-<short sha>`.
pub fn record_id(started_at: DateTime<Utc>, revision: Option<&str>) -> String {
    format!(
        "deploy-{}-{}",
        started_at.format("%Y%m%d_%H%M%S_%3f"),
        revision.map(short_sha).unwrap_or("nogit")
    )
}

/// `id`, or `id-<n>` when a record with that id is already on disk.
pub fn unique_record_id(records_dir: &Path, id: String) -> String {
    if !record_path(records_dir, &id).exists() {
        return id;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{id}-{n}");
        if !record_path(records_dir, &candidate).exists() {
            return candidate;
        }
        n += 1;
    }
}

pub fn short_sha(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}

pub fn record_path(records_dir: &Path, id: &str) -> PathBuf {
    records_dir.join(format!("{id}.json"))
}

pub fn write_record(records_dir: &Path, record: &DeployRecord) -> Result<PathBuf> {
    fs::create_dir_all(records_dir)
        .with_context(|| format!("create records dir {}", records_dir.display()))?;
    let path = record_path(records_dir, &record.id);
    let contents = serde_json::to_string_pretty(record).context("serialize deploy record")?;
    fs::write(&path, format!("{contents}\n"))
        .with_context(|| format!("write record {}", path.display()))?;
    Ok(path)
}

/// Load all records, oldest first. Unreadable files are skipped with a warning.
pub fn load_records(records_dir: &Path) -> Result<(Vec<DeployRecord>, Vec<String>)> {
    if !records_dir.exists() {
        return Ok((Vec::new(), Vec::new()));
    }
    let mut paths = Vec::new();
    for entry in
        fs::read_dir(records_dir).with_context(|| format!("read {}", records_dir.display()))?
    {
        let entry = entry.context("read entry")?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut records = Vec::new();
    let mut warnings = Vec::new();
    for path in paths {
        match fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))
            .and_then(|contents| serde_json::from_str(&contents).context("parse record"))
        {
            Ok(record) => records.push(record),
            Err(err) => warnings.push(format!("skip {}: {err:#}", path.display())),
        }
    }
    // Suffixed ids sort before their base file name; start time decides.
    records.sort_by(|a: &DeployRecord, b: &DeployRecord| a.start_time.cmp(&b.start_time));
    Ok((records, warnings))
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(contents);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn record(id: &str, outcome: DeployOutcome) -> DeployRecord {
        DeployRecord {
            id: id.to_string(),
            revision: Some("0123456789abcdef".to_string()),
            destination: "ci@host:22:validator".to_string(),
            config_hash: None,
            outcome,
            failed_step: None,
            steps: Vec::new(),
            notified: false,
            start_time: "2026-01-01T00:00:00+00:00".to_string(),
            end_time: "2026-01-01T00:00:01+00:00".to_string(),
            duration_secs: 1.0,
            errors: Vec::new(),
        }
    }

    #[test]
    fn record_id_is_sortable_and_tagged() {
        let at = Utc
            .with_ymd_and_hms(2026, 3, 4, 5, 6, 7)
            .single()
            .expect("time")
            + chrono::Duration::milliseconds(89);
        assert_eq!(
            record_id(at, Some("0123456789abcdef")),
            "deploy-20260304_050607_089-0123456"
        );
        assert_eq!(record_id(at, None), "deploy-20260304_050607_089-nogit");
    }

    #[test]
    fn same_id_twice_gets_a_suffix() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().join("records");
        let id = "deploy-20260304_050607_089-0123456".to_string();
        assert_eq!(unique_record_id(&dir, id.clone()), id);

        write_record(&dir, &record(&id, DeployOutcome::Success)).expect("write");
        let second = unique_record_id(&dir, id.clone());
        assert_eq!(second, format!("{id}-2"));
        let mut later = record(&second, DeployOutcome::Failed);
        later.start_time = "2026-01-01T00:00:05+00:00".to_string();
        write_record(&dir, &later).expect("write");
        assert_eq!(unique_record_id(&dir, id.clone()), format!("{id}-3"));

        let (records, _) = load_records(&dir).expect("load");
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![id.as_str(), second.as_str()]);
    }

    #[test]
    fn load_returns_oldest_first_and_skips_garbage() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().join("records");
        write_record(&dir, &record("deploy-2", DeployOutcome::Failed)).expect("write");
        write_record(&dir, &record("deploy-1", DeployOutcome::Success)).expect("write");
        fs::write(dir.join("broken.json"), "{").expect("write garbage");
        fs::write(dir.join("notes.txt"), "ignored").expect("write txt");

        let (records, warnings) = load_records(&dir).expect("load");
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["deploy-1", "deploy-2"]);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("broken.json"));
    }

    #[test]
    fn missing_dir_has_no_records() {
        let temp = tempdir().expect("tempdir");
        let (records, warnings) = load_records(&temp.path().join("none")).expect("load");
        assert!(records.is_empty());
        assert!(warnings.is_empty());
    }

    #[test]
    fn summary_mentions_failed_step() {
        let mut rec = record("deploy-1", DeployOutcome::Failed);
        rec.failed_step = Some("copy neurons".to_string());
        assert_eq!(
            rec.summary(),
            "deploy=deploy-1 outcome=Failed revision=0123456 destination=ci@host:22:validator steps=0 failed_step=\"copy neurons\""
        );
    }

    #[test]
    fn hashes_file_contents() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("deploy.toml");
        fs::write(&path, "abc").expect("write");
        assert_eq!(
            file_sha256(&path).expect("hash"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
