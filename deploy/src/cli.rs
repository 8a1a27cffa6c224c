//! CLI command implementations.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::debug;

use warden::io::notify::notifier_from_url;

use crate::config::{DeployConfig, Target, load_config, resolve_target};
use crate::plan::{DeployPlan, build_plan};
use crate::record::{DeployOutcome, load_records};
use crate::run::{CommandStepRunner, DeployContext, run_deploy};

/// Deploy now, or print the resolved plan with `dry_run`.
pub fn run(config_path: &Path, dry_run: bool) -> Result<()> {
    let cfg = load_config(config_path)?;
    let env: BTreeMap<String, String> = std::env::vars().collect();

    if dry_run {
        let target = resolve_target(&cfg.target, &env)?;
        print_plan(&build_plan(&cfg, &target));
        return Ok(());
    }

    let webhook_url = env.get(&cfg.notify.webhook_env).cloned().unwrap_or_default();
    if webhook_url.trim().is_empty() {
        debug!(var = %cfg.notify.webhook_env, "no webhook configured");
    }
    let notifier = notifier_from_url(
        &webhook_url,
        &cfg.notify.message_field,
        Duration::from_secs(cfg.notify.timeout_secs),
    )?;
    let runner = CommandStepRunner::from_config(&cfg);
    let ctx = DeployContext {
        config_path,
        env: &env,
    };
    let record = run_deploy(&cfg, &ctx, &runner, &notifier)?;
    println!("{}", record.summary());
    for err in &record.errors {
        eprintln!("warning: {err}");
    }
    if record.outcome == DeployOutcome::Failed {
        bail!(
            "deploy failed at {}",
            record.failed_step.as_deref().unwrap_or("unknown step")
        );
    }
    Ok(())
}

/// Print the plan with environment variable names in place of secrets.
pub fn plan(config_path: &Path) -> Result<()> {
    let cfg = load_config(config_path)?;
    print_plan(&build_plan(&cfg, &placeholder_target(&cfg)));
    Ok(())
}

/// Show the most recent deployment records.
pub fn history(config_path: &Path, last: usize) -> Result<()> {
    let cfg = load_config(config_path)?;
    let (records, warnings) = load_records(&cfg.records_path())?;
    let skip = records.len().saturating_sub(last);
    for record in records.iter().skip(skip) {
        println!("{} {}", record.end_time, record.summary());
    }
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
    Ok(())
}

fn print_plan(plan: &DeployPlan) {
    println!("destination: {}", plan.destination);
    for (i, step) in plan.steps.iter().enumerate() {
        println!("{}. {}: {}", i + 1, step.label, step.display());
    }
}

fn placeholder_target(cfg: &DeployConfig) -> Target {
    let var = |name: &str| format!("${name}");
    Target {
        host: var(&cfg.target.host_env),
        port: crate::config::DEFAULT_SSH_PORT,
        user: var(&cfg.target.user_env),
        key_path: (!cfg.target.key_env.trim().is_empty()).then(|| var(&cfg.target.key_env).into()),
    }
}
