//! Process watchdog CLI.
//!
//! `warden watch <process>` keeps a supervisor-managed process on the latest
//! revision of its checkout and reports its liveness to health-check URLs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use warden::core::types::TestOutcome;
use warden::cycle::{CycleDeps, run_cycle};
use warden::exit_codes;
use warden::io::config::{DEFAULT_CONFIG_FILE, WardenConfig, load_config, write_config};
use warden::io::health::HttpHealthPinger;
use warden::io::history::{HISTORY_FILE, read_recent};
use warden::io::notify::{Notifier, notifier_from_url};
use warden::io::state::{STATE_FILE, load_state};
use warden::io::supervisor::Pm2Supervisor;
use warden::io::test_gate::{CommandTestRunner, TestRequest, TestRunner};
use warden::logging;
use warden::watch::{WatchOptions, run_watch};

#[derive(Parser)]
#[command(
    name = "warden",
    version,
    about = "Keep a supervised process updated from git and report its health"
)]
struct Cli {
    /// Path to the config file.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull, restart on change, check health; every interval, forever.
    Watch {
        /// Supervisor name of the managed process.
        process: String,
        /// Run the first cycle immediately instead of after one interval.
        #[arg(long)]
        immediate: bool,
        /// Stop after this many cycles.
        #[arg(long)]
        max_cycles: Option<u64>,
    },
    /// Run exactly one cycle now.
    Cycle {
        /// Supervisor name of the managed process.
        process: String,
    },
    /// Show persisted watch state and the most recent cycles.
    Status {
        /// Number of history entries to show.
        #[arg(short = 'n', long, default_value_t = 5)]
        last: usize,
    },
    /// Run the configured test command (env, ignores and timeout from `[tests]`).
    Test,
    /// Post a message to the configured chat webhook.
    Notify { message: String },
    /// Write a default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let default_directive = match cli.command {
        Command::Watch { .. } | Command::Cycle { .. } => "info",
        _ => "warn",
    };
    logging::init(default_directive);

    match cli.command {
        Command::Watch {
            process,
            immediate,
            max_cycles,
        } => cmd_watch(
            &cli.config,
            &process,
            WatchOptions {
                immediate,
                max_cycles,
            },
        ),
        Command::Cycle { process } => cmd_cycle(&cli.config, &process),
        Command::Status { last } => cmd_status(&cli.config, last),
        Command::Test => cmd_test(&cli.config),
        Command::Notify { message } => cmd_notify(&cli.config, &message),
        Command::Init { force } => cmd_init(&cli.config, force),
    }
}

type LiveCycleDeps<'a> =
    CycleDeps<'a, Pm2Supervisor, HttpHealthPinger, Box<dyn Notifier>, CommandTestRunner>;

/// Production collaborators built from config.
struct LiveDeps {
    supervisor: Pm2Supervisor,
    pinger: HttpHealthPinger,
    notifier: Box<dyn Notifier>,
    tests: CommandTestRunner,
}

impl LiveDeps {
    fn from_config(cfg: &WardenConfig) -> Result<Self> {
        Ok(Self {
            supervisor: Pm2Supervisor::new(
                cfg.supervisor.program.clone(),
                cfg.repo_dir.clone(),
                cfg.command_timeout(),
                cfg.output_limit_bytes,
            ),
            pinger: HttpHealthPinger::new(
                &cfg.health.success_url,
                &cfg.health.failure_url,
                std::time::Duration::from_secs(cfg.health.timeout_secs),
            )?,
            notifier: build_notifier(cfg)?,
            tests: CommandTestRunner,
        })
    }

    fn deps(&self) -> LiveCycleDeps<'_> {
        CycleDeps {
            supervisor: &self.supervisor,
            pinger: &self.pinger,
            notifier: &self.notifier,
            tests: &self.tests,
        }
    }
}

fn build_notifier(cfg: &WardenConfig) -> Result<Box<dyn Notifier>> {
    notifier_from_url(
        &cfg.notify.webhook_url,
        &cfg.notify.message_field,
        std::time::Duration::from_secs(cfg.notify.timeout_secs),
    )
}

fn cmd_watch(config_path: &Path, process: &str, opts: WatchOptions) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let live = LiveDeps::from_config(&cfg)?;
    let outcome = run_watch(
        process,
        &cfg,
        &live.deps(),
        opts,
        std::thread::sleep,
        |report| println!("{}", report.summary()),
    )?;
    info!(
        cycles = outcome.cycles_run,
        restarts = outcome.restarts,
        relaunches = outcome.relaunches,
        "watch stopped"
    );
    Ok(exit_codes::OK)
}

fn cmd_cycle(config_path: &Path, process: &str) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let live = LiveDeps::from_config(&cfg)?;
    let report = run_cycle(process, &cfg, &live.deps())?;
    println!("{}", report.summary());
    for err in &report.errors {
        eprintln!("warning: {err}");
    }
    if report.is_online() {
        Ok(exit_codes::OK)
    } else {
        Ok(exit_codes::NOT_ONLINE)
    }
}

fn cmd_status(config_path: &Path, last: usize) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let state_dir = cfg.state_path();
    let state = load_state(&state_dir.join(STATE_FILE))?;
    println!(
        "process: {}",
        state.process.as_deref().unwrap_or("(never watched)")
    );
    println!(
        "revision: {}",
        state
            .last_revision
            .as_ref()
            .map(|r| r.as_str())
            .unwrap_or("-")
    );
    println!("status: {}", state.last_status.as_deref().unwrap_or("-"));
    println!(
        "cycles: {} restarts: {} relaunches: {}",
        state.cycles, state.restarts, state.relaunches
    );
    println!(
        "last cycle: {}",
        state.last_cycle_at.as_deref().unwrap_or("-")
    );
    for report in read_recent(&state_dir.join(HISTORY_FILE), last)? {
        println!("{} {}", report.ended_at, report.summary());
    }
    Ok(exit_codes::OK)
}

fn cmd_test(config_path: &Path) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let request = TestRequest::from_config(&cfg);
    let outcome = CommandTestRunner.run(&request)?;
    println!(
        "tests: {:?} (log: {})",
        outcome,
        request.log_path.display()
    );
    match outcome {
        TestOutcome::Pass => Ok(exit_codes::OK),
        TestOutcome::Fail | TestOutcome::TimedOut => Ok(exit_codes::TESTS_FAILED),
    }
}

fn cmd_notify(config_path: &Path, message: &str) -> Result<i32> {
    let cfg = load_config(config_path)?;
    if cfg.notify.webhook_url.trim().is_empty() {
        bail!("notify.webhook_url is not configured");
    }
    build_notifier(&cfg)?
        .send(message)
        .context("send notification")?;
    Ok(exit_codes::OK)
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    write_config(config_path, &WardenConfig::default())
        .with_context(|| format!("write {}", config_path.display()))?;
    println!("wrote {}", config_path.display());
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_watch_positional_process() {
        let cli = Cli::parse_from(["warden", "watch", "validator"]);
        match cli.command {
            Command::Watch {
                process,
                immediate,
                max_cycles,
            } => {
                assert_eq!(process, "validator");
                assert!(!immediate);
                assert_eq!(max_cycles, None);
            }
            _ => panic!("expected watch"),
        }
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn parse_watch_flags_and_global_config() {
        let cli = Cli::parse_from([
            "warden",
            "watch",
            "validator",
            "--immediate",
            "--max-cycles",
            "3",
            "--config",
            "/etc/warden.toml",
        ]);
        assert!(matches!(
            cli.command,
            Command::Watch {
                immediate: true,
                max_cycles: Some(3),
                ..
            }
        ));
        assert_eq!(cli.config, PathBuf::from("/etc/warden.toml"));
    }

    #[test]
    fn watch_requires_process() {
        assert!(Cli::try_parse_from(["warden", "watch"]).is_err());
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["warden", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }
}
