//! Push deployer: copy the checkout to a remote host over ssh, run remote
//! commands, and report the result to a chat webhook.

mod cli;
mod config;
mod plan;
mod record;
mod run;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::DEFAULT_CONFIG_FILE;

#[derive(Parser)]
#[command(
    name = "deploy",
    version,
    about = "Copy a checkout to a remote host and notify a chat webhook"
)]
struct Cli {
    /// Path to the deploy config file.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy using secrets from the environment.
    Run {
        /// Resolve secrets and print the plan without running it.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the plan with variable names in place of secrets.
    Plan,
    /// Show recent deployment records.
    History {
        #[arg(short = 'n', long, default_value_t = 10)]
        last: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    warden::logging::init("info");
    match cli.command {
        Command::Run { dry_run } => cli::run(&cli.config, dry_run),
        Command::Plan => cli::plan(&cli.config),
        Command::History { last } => cli::history(&cli.config, last),
    }
}
