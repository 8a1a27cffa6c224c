//! Deployment configuration stored in `deploy.toml`.
//!
//! Connection secrets never live in the file. The file names the environment
//! variables that hold them, the way CI exposes repository secrets.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "deploy.toml";
pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeployConfig {
    /// Local tree the sync paths are relative to. Resolved against the config file.
    pub source_dir: PathBuf,

    /// Directory on the remote host, relative to the login directory unless absolute.
    pub remote_dir: String,

    /// Files and directories copied recursively into `remote_dir`.
    pub paths: Vec<String>,

    /// Shell commands run on the remote host inside `remote_dir`, in order.
    pub remote_commands: Vec<String>,

    pub command_timeout_secs: u64,
    pub output_limit_bytes: usize,

    /// Where deployment records are written, relative to `source_dir`.
    pub records_dir: PathBuf,

    pub target: TargetConfig,
    pub notify: DeployNotifyConfig,
}

/// Names of the environment variables holding connection secrets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TargetConfig {
    pub host_env: String,
    pub user_env: String,
    /// Empty or unset variable: port 22.
    pub port_env: String,
    /// Empty name: rely on the ssh agent or default identity.
    pub key_env: String,
    pub ssh_program: String,
    pub scp_program: String,
    /// Extra options passed to both ssh and scp.
    pub ssh_options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeployNotifyConfig {
    /// Variable holding the chat webhook URL. Unset: no notification.
    pub webhook_env: String,
    pub message_field: String,
    /// Placeholders: `{sha}`, `{short_sha}`, `{destination}`, `{id}`.
    pub success_template: String,
    /// Placeholders as above plus `{step}` and `{error}`.
    pub failure_template: String,
    pub timeout_secs: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host_env: "DEPLOY_HOST".to_string(),
            user_env: "DEPLOY_USER".to_string(),
            port_env: "DEPLOY_PORT".to_string(),
            key_env: "DEPLOY_KEY_PATH".to_string(),
            ssh_program: "ssh".to_string(),
            scp_program: "scp".to_string(),
            ssh_options: vec![
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                "StrictHostKeyChecking=accept-new".to_string(),
            ],
        }
    }
}

impl Default for DeployNotifyConfig {
    fn default() -> Self {
        Self {
            webhook_env: "DEPLOY_WEBHOOK_URL".to_string(),
            message_field: "content".to_string(),
            success_template: "Deployed {short_sha} to {destination}".to_string(),
            failure_template: "Deploy of {short_sha} to {destination} failed at {step}: {error}"
                .to_string(),
            timeout_secs: 10,
        }
    }
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("."),
            remote_dir: "validator".to_string(),
            paths: vec![
                "neurons".to_string(),
                "infinite_games".to_string(),
                "setup.py".to_string(),
                "requirements.txt".to_string(),
            ],
            remote_commands: Vec::new(),
            command_timeout_secs: 600,
            output_limit_bytes: 100_000,
            records_dir: PathBuf::from(".deploy/records"),
            target: TargetConfig::default(),
            notify: DeployNotifyConfig::default(),
        }
    }
}

impl DeployConfig {
    pub fn validate(&self) -> Result<()> {
        if self.remote_dir.trim().is_empty() {
            bail!("remote_dir must be non-empty");
        }
        if let Some(bad) = self
            .remote_dir
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || "._-/~".contains(*c)))
        {
            bail!("remote_dir contains unsupported character {bad:?}");
        }
        if self.paths.is_empty() {
            bail!("paths must list at least one file or directory");
        }
        for path in &self.paths {
            validate_sync_path(path)?;
        }
        if self.remote_commands.iter().any(|c| c.trim().is_empty()) {
            bail!("remote_commands must not contain empty commands");
        }
        if self.command_timeout_secs == 0 {
            bail!("command_timeout_secs must be > 0");
        }
        if self.output_limit_bytes == 0 {
            bail!("output_limit_bytes must be > 0");
        }
        for (field, value) in [
            ("target.host_env", &self.target.host_env),
            ("target.user_env", &self.target.user_env),
            ("target.ssh_program", &self.target.ssh_program),
            ("target.scp_program", &self.target.scp_program),
            ("notify.message_field", &self.notify.message_field),
        ] {
            if value.trim().is_empty() {
                bail!("{field} must be non-empty");
            }
        }
        if self.notify.timeout_secs == 0 {
            bail!("notify.timeout_secs must be > 0");
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn records_path(&self) -> PathBuf {
        if self.records_dir.is_absolute() {
            self.records_dir.clone()
        } else {
            self.source_dir.join(&self.records_dir)
        }
    }
}

fn validate_sync_path(path: &str) -> Result<()> {
    let p = Path::new(path);
    if path.trim().is_empty() {
        bail!("paths must not contain empty entries");
    }
    if p.is_absolute() {
        bail!("sync path '{path}' must be relative to source_dir");
    }
    if p.components().any(|c| matches!(c, Component::ParentDir)) {
        bail!("sync path '{path}' must stay inside source_dir");
    }
    // `scp -r .` would also ship `.git` and build output.
    match p.components().find(|c| !matches!(c, Component::CurDir)) {
        None => bail!("sync path '{path}' names source_dir itself; list its entries instead"),
        Some(Component::Normal(first)) if first == ".git" => {
            bail!("sync path '{path}' is inside .git")
        }
        Some(_) => {}
    }
    Ok(())
}

/// Connection details resolved from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: Option<PathBuf>,
}

impl Target {
    /// `user@host`, as ssh and scp expect it.
    pub fn login(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Resolve connection secrets from `env`.
///
/// Every missing variable is reported in one error so a misconfigured CI job
/// can be fixed in a single round.
pub fn resolve_target(cfg: &TargetConfig, env: &BTreeMap<String, String>) -> Result<Target> {
    let lookup = |name: &str| {
        env.get(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let mut missing = Vec::new();
    let host = lookup(&cfg.host_env);
    if host.is_none() {
        missing.push(cfg.host_env.as_str());
    }
    let user = lookup(&cfg.user_env);
    if user.is_none() {
        missing.push(cfg.user_env.as_str());
    }
    let key_path = if cfg.key_env.trim().is_empty() {
        None
    } else {
        let key = lookup(&cfg.key_env);
        if key.is_none() {
            missing.push(cfg.key_env.as_str());
        }
        key.map(PathBuf::from)
    };

    let (Some(host), Some(user)) = (host, user) else {
        return Err(anyhow!("missing deploy secrets: {}", missing.join(", ")));
    };
    if !missing.is_empty() {
        bail!("missing deploy secrets: {}", missing.join(", "));
    }

    let port = match (!cfg.port_env.trim().is_empty())
        .then(|| lookup(&cfg.port_env))
        .flatten()
    {
        Some(raw) => raw
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| anyhow!("{} must be a port number, got '{raw}'", cfg.port_env))?,
        None => DEFAULT_SSH_PORT,
    };

    Ok(Target {
        host,
        port,
        user,
        key_path,
    })
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `DeployConfig::default()`. `source_dir` is
/// resolved against the config file's directory in both cases.
pub fn load_config(path: &Path) -> Result<DeployConfig> {
    let base = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut cfg = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str::<DeployConfig>(&contents)
            .with_context(|| format!("parse {}", path.display()))?
    } else {
        DeployConfig::default()
    };
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    if cfg.source_dir.is_relative() {
        cfg.source_dir = base.join(&cfg.source_dir);
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn resolves_full_target() {
        let target = resolve_target(
            &TargetConfig::default(),
            &env(&[
                ("DEPLOY_HOST", "10.0.0.5"),
                ("DEPLOY_USER", "ubuntu"),
                ("DEPLOY_PORT", "2222"),
                ("DEPLOY_KEY_PATH", "/home/ci/.ssh/id_ed25519"),
            ]),
        )
        .expect("target");
        assert_eq!(target.login(), "ubuntu@10.0.0.5");
        assert_eq!(target.port, 2222);
        assert_eq!(
            target.key_path,
            Some(PathBuf::from("/home/ci/.ssh/id_ed25519"))
        );
    }

    #[test]
    fn port_defaults_to_22() {
        let target = resolve_target(
            &TargetConfig::default(),
            &env(&[
                ("DEPLOY_HOST", "example.org"),
                ("DEPLOY_USER", "ci"),
                ("DEPLOY_KEY_PATH", "/k"),
                ("DEPLOY_PORT", "  "),
            ]),
        )
        .expect("target");
        assert_eq!(target.port, DEFAULT_SSH_PORT);
    }

    #[test]
    fn names_every_missing_secret() {
        let err = resolve_target(&TargetConfig::default(), &env(&[])).expect_err("missing");
        assert_eq!(
            err.to_string(),
            "missing deploy secrets: DEPLOY_HOST, DEPLOY_USER, DEPLOY_KEY_PATH"
        );

        let err = resolve_target(
            &TargetConfig::default(),
            &env(&[("DEPLOY_HOST", "h"), ("DEPLOY_USER", "u")]),
        )
        .expect_err("missing key");
        assert_eq!(err.to_string(), "missing deploy secrets: DEPLOY_KEY_PATH");
    }

    #[test]
    fn empty_key_env_uses_agent() {
        let cfg = TargetConfig {
            key_env: String::new(),
            ..TargetConfig::default()
        };
        let target = resolve_target(&cfg, &env(&[("DEPLOY_HOST", "h"), ("DEPLOY_USER", "u")]))
            .expect("target");
        assert_eq!(target.key_path, None);
    }

    #[test]
    fn rejects_invalid_port() {
        let err = resolve_target(
            &TargetConfig::default(),
            &env(&[
                ("DEPLOY_HOST", "h"),
                ("DEPLOY_USER", "u"),
                ("DEPLOY_KEY_PATH", "/k"),
                ("DEPLOY_PORT", "ssh"),
            ]),
        )
        .expect_err("bad port");
        assert!(err.to_string().contains("DEPLOY_PORT"), "{err}");
    }

    #[test]
    fn rejects_paths_escaping_source_dir() {
        let mut cfg = DeployConfig::default();
        cfg.paths = vec!["../secrets".to_string()];
        assert!(cfg.validate().is_err());
        cfg.paths = vec!["/etc".to_string()];
        assert!(cfg.validate().is_err());
        cfg.paths = vec!["neurons".to_string(), "setup.py".to_string()];
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_whole_checkout_and_git_dir() {
        let mut cfg = DeployConfig::default();
        for bad in [".", "./", "./.", ".git", "./.git/config"] {
            cfg.paths = vec![bad.to_string()];
            let err = cfg.validate().expect_err(bad);
            assert!(err.to_string().contains(bad), "{err}");
        }
        cfg.paths = vec!["./neurons".to_string(), ".github".to_string()];
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_remote_dir_needing_quotes() {
        let mut cfg = DeployConfig::default();
        cfg.remote_dir = "my app".to_string();
        assert!(cfg.validate().is_err());
        cfg.remote_dir = "~/apps/validator-6".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn load_partial_file_fills_defaults() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join(DEFAULT_CONFIG_FILE);
        fs::write(
            &path,
            "remote_dir = \"/srv/validator\"\nremote_commands = [\"pm2 restart validator\"]\n\n[target]\nkey_env = \"\"\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.remote_dir, "/srv/validator");
        assert_eq!(cfg.remote_commands, vec!["pm2 restart validator"]);
        assert_eq!(cfg.target.key_env, "");
        assert_eq!(cfg.target.host_env, "DEPLOY_HOST");
        assert_eq!(cfg.source_dir, temp.path().join("."));
        assert_eq!(
            cfg.records_path(),
            temp.path().join(".").join(".deploy/records")
        );
    }

    #[test]
    fn missing_file_uses_defaults() {
        let temp = tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("absent.toml")).expect("load");
        assert_eq!(
            cfg.paths,
            vec!["neurons", "infinite_games", "setup.py", "requirements.txt"]
        );
        assert_eq!(cfg.notify.webhook_env, "DEPLOY_WEBHOOK_URL");
    }
}
