//! Deployment plan: the ordered ssh/scp invocations for one deploy.
//!
//! Building a plan is pure so it can be printed, tested and recorded without
//! touching the network.

use serde::{Deserialize, Serialize};

use crate::config::{DeployConfig, Target};

/// One external command in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Short human label used in logs, records and failure messages.
    pub label: String,
    pub argv: Vec<String>,
}

impl PlanStep {
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployPlan {
    /// `user@host:port:remote_dir`, for messages.
    pub destination: String,
    pub steps: Vec<PlanStep>,
}

/// Build the plan: create the remote dir, copy every path, run remote commands.
pub fn build_plan(cfg: &DeployConfig, target: &Target) -> DeployPlan {
    let login = target.login();
    let mut steps = Vec::with_capacity(cfg.paths.len() + cfg.remote_commands.len() + 1);

    steps.push(PlanStep {
        label: "prepare remote dir".to_string(),
        argv: ssh_argv(cfg, target, &format!("mkdir -p {}", cfg.remote_dir)),
    });

    for path in &cfg.paths {
        let mut argv = vec![cfg.target.scp_program.clone()];
        argv.extend(cfg.target.ssh_options.iter().cloned());
        argv.push("-P".to_string());
        argv.push(target.port.to_string());
        push_identity(&mut argv, target);
        argv.push("-r".to_string());
        argv.push(cfg.source_dir.join(path).display().to_string());
        argv.push(format!("{login}:{}/", cfg.remote_dir));
        steps.push(PlanStep {
            label: format!("copy {path}"),
            argv,
        });
    }

    for command in &cfg.remote_commands {
        steps.push(PlanStep {
            label: format!("run {command}"),
            argv: ssh_argv(cfg, target, &format!("cd {} && {command}", cfg.remote_dir)),
        });
    }

    DeployPlan {
        destination: format!("{login}:{}:{}", target.port, cfg.remote_dir),
        steps,
    }
}

fn ssh_argv(cfg: &DeployConfig, target: &Target, remote_command: &str) -> Vec<String> {
    let mut argv = vec![cfg.target.ssh_program.clone()];
    argv.extend(cfg.target.ssh_options.iter().cloned());
    argv.push("-p".to_string());
    argv.push(target.port.to_string());
    push_identity(&mut argv, target);
    argv.push(target.login());
    argv.push(remote_command.to_string());
    argv
}

fn push_identity(argv: &mut Vec<String>, target: &Target) {
    if let Some(key) = &target.key_path {
        argv.push("-i".to_string());
        argv.push(key.display().to_string());
    }
}
