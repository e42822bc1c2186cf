//! fleetd - Fleet master journal tool
//!
//! Inspects the change and action journals of a master process and closes
//! out records left open by a crash. Every command prints pretty JSON.

use anyhow::Context;
use clap::Parser;
use fleet_master::{execute, init_tracing, Command, MasterConfig};
use std::path::PathBuf;

/// fleetd CLI
#[derive(Parser)]
#[command(name = "fleetd")]
#[command(about = "Fleet master - journal inspection and recovery", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "FLEET_CONFIG")]
    config: Option<String>,

    /// Journal root directory, overrides the configuration
    #[arg(long, env = "FLEET_JOURNAL_ROOT")]
    journal_root: Option<PathBuf>,

    /// Log level, overrides the configuration
    #[arg(long, env = "FLEET_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "FLEET_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = MasterConfig::load(cli.config.as_deref()).context("loading configuration")?;

    // Override with CLI args
    if let Some(root) = cli.journal_root {
        config.journal.root = root;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.json {
        config.logging.json = true;
    }

    init_tracing(&config.logging.level, config.logging.json)?;

    let output = execute(cli.command, &config).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
