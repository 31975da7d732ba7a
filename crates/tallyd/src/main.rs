//! tallyd - VPN traffic accounting daemon

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tally_common::config::{TallyConfig, CONFIG_PATH};
use tallyd::{Engine, Scheduler};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tallyd", version, about = "VPN traffic accounting daemon")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Run one poll and sync cycle, then exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    info!("tallyd v{} starting", env!("CARGO_PKG_VERSION"));

    let (config, timing) = match TallyConfig::load_validated(&cli.config) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e).context("refusing to start with an invalid configuration");
        }
    };

    let engine = Engine::from_config(&config, &timing)
        .with_context(|| format!("failed to open ledger {}", config.storage.database.display()))?;
    info!("Ledger at {}", config.storage.database.display());

    let scheduler = Scheduler::new(engine, timing);
    if cli.once {
        scheduler.run_once().await?;
        info!("Single cycle complete");
        return Ok(());
    }

    scheduler
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    info!("Shutting down gracefully");
    Ok(())
}
