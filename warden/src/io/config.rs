//! Warden configuration stored in `warden.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::launch::LaunchSpec;

pub const DEFAULT_CONFIG_FILE: &str = "warden.toml";

/// Warden configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields fall back to a
/// five minute interval, pm2 and `pip install -e .`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WardenConfig {
    /// Seconds to wait between cycles.
    pub interval_secs: u64,

    /// Checkout to pull and run commands in. Relative paths resolve against the config file.
    pub repo_dir: PathBuf,

    /// Per-command wall-clock limit (git, installer, supervisor).
    pub command_timeout_secs: u64,

    /// Truncate captured command output beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Where state, history and test logs are written, relative to `repo_dir`.
    pub state_dir: PathBuf,

    pub git: GitConfig,
    pub install: InstallConfig,
    pub supervisor: SupervisorConfig,
    pub health: HealthConfig,
    pub notify: NotifyConfig,
    pub update: UpdateConfig,
    pub tests: TestsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    pub remote: String,
    /// Empty: pull the checkout's upstream.
    pub branch: String,
    /// Refuse to pull over local modifications to tracked files.
    pub require_clean: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InstallConfig {
    /// Dependency installer run after the revision changes. Empty disables the step.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Supervisor binary (`pm2`).
    pub program: String,
    /// Entry point started when the process has to be relaunched.
    pub script: String,
    pub interpreter: Option<String>,
    /// Extra `start` arguments; everything after `--` goes to the process.
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthConfig {
    /// Pinged when the process reports `online`. Empty disables the ping.
    pub success_url: String,
    /// Pinged when the process reports anything else. Empty disables the ping.
    pub failure_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifyConfig {
    /// Chat webhook. Empty disables notifications.
    pub webhook_url: String,
    /// JSON field carrying the message (`content` for Discord, `text` for Slack).
    pub message_field: String,
    pub on_update: bool,
    pub on_failure: bool,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpdateConfig {
    /// Run the test gate after installing and skip the restart if it fails.
    pub test_before_restart: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestsConfig {
    pub command: Vec<String>,
    /// Paths the test runner must skip.
    pub ignore: Vec<String>,
    /// Flag used to pass each ignored path (`--ignore=<path>`).
    pub ignore_flag: String,
    pub timeout_secs: u64,
    /// Environment injected into the test process.
    pub env: BTreeMap<String, String>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            branch: String::new(),
            require_clean: false,
        }
    }
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "pip".to_string(),
                "install".to_string(),
                "-e".to_string(),
                ".".to_string(),
            ],
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            program: "pm2".to_string(),
            script: "neurons/validator.py".to_string(),
            interpreter: Some("python3".to_string()),
            args: vec!["--".to_string(), "--netuid".to_string(), "6".to_string()],
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            success_url: String::new(),
            failure_url: String::new(),
            timeout_secs: 10,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            message_field: "content".to_string(),
            on_update: true,
            on_failure: true,
            timeout_secs: 10,
        }
    }
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            command: vec!["pytest".to_string()],
            ignore: Vec::new(),
            ignore_flag: "--ignore".to_string(),
            timeout_secs: 10 * 60,
            env: BTreeMap::new(),
        }
    }
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5 * 60,
            repo_dir: PathBuf::from("."),
            command_timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
            state_dir: PathBuf::from(".warden"),
            git: GitConfig::default(),
            install: InstallConfig::default(),
            supervisor: SupervisorConfig::default(),
            health: HealthConfig::default(),
            notify: NotifyConfig::default(),
            update: UpdateConfig::default(),
            tests: TestsConfig::default(),
        }
    }
}

impl WardenConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(anyhow!("interval_secs must be > 0"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.supervisor.program.trim().is_empty() {
            return Err(anyhow!("supervisor.program must be non-empty"));
        }
        if self.supervisor.script.trim().is_empty() {
            return Err(anyhow!("supervisor.script must be non-empty"));
        }
        if !self.install.command.is_empty() && self.install.command[0].trim().is_empty() {
            return Err(anyhow!("install.command must start with a program"));
        }
        if self.health.timeout_secs == 0 {
            return Err(anyhow!("health.timeout_secs must be > 0"));
        }
        validate_url("health.success_url", &self.health.success_url)?;
        validate_url("health.failure_url", &self.health.failure_url)?;
        validate_url("notify.webhook_url", &self.notify.webhook_url)?;
        if self.notify.message_field.trim().is_empty() {
            return Err(anyhow!("notify.message_field must be non-empty"));
        }
        if self.tests.command.is_empty() || self.tests.command[0].trim().is_empty() {
            return Err(anyhow!("tests.command must be a non-empty array"));
        }
        if self.tests.timeout_secs == 0 {
            return Err(anyhow!("tests.timeout_secs must be > 0"));
        }
        if !self.tests.ignore.is_empty() && self.tests.ignore_flag.trim().is_empty() {
            return Err(anyhow!("tests.ignore_flag must be set when tests.ignore is used"));
        }
        for key in self.tests.env.keys() {
            if key.trim().is_empty() || key.contains('=') {
                return Err(anyhow!("tests.env has invalid key '{key}'"));
            }
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            script: self.supervisor.script.clone(),
            interpreter: self.supervisor.interpreter.clone(),
            args: self.supervisor.args.clone(),
        }
    }

    /// Resolve `repo_dir` against the directory holding the config file.
    pub fn resolve_repo_dir(&mut self, base: &Path) {
        if self.repo_dir.is_relative() {
            self.repo_dir = base.join(&self.repo_dir);
        }
    }

    pub fn state_path(&self) -> PathBuf {
        if self.state_dir.is_absolute() {
            self.state_dir.clone()
        } else {
            self.repo_dir.join(&self.state_dir)
        }
    }
}

fn validate_url(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Ok(());
    }
    if !(value.starts_with("http://") || value.starts_with("https://")) {
        return Err(anyhow!("{field} must be an http(s) URL, got '{value}'"));
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `WardenConfig::default()`. `repo_dir` is
/// resolved against the config file's directory in both cases.
pub fn load_config(path: &Path) -> Result<WardenConfig> {
    let base = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut cfg = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str::<WardenConfig>(&contents)
            .with_context(|| format!("parse {}", path.display()))?
    } else {
        WardenConfig::default()
    };
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    cfg.resolve_repo_dir(&base);
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &WardenConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
