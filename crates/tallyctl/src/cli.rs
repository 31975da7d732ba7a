//! CLI - Command-line argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tally_common::config::CONFIG_PATH;

/// Read-only console over the traffic ledger
#[derive(Parser)]
#[command(name = "tallyctl")]
#[command(about = "Tally - VPN traffic accounting console", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = CONFIG_PATH)]
    pub config: PathBuf,

    /// Output JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Per-entity traffic for one day
    Daily {
        /// Date as YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<String>,
    },

    /// Per-client totals for a month and the month before it
    Monthly {
        /// Month as YYYY-MM (default: current month)
        #[arg(long)]
        month: Option<String>,
    },

    /// Recent client sessions, newest first
    History {
        /// Maximum rows to show
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Daemon phase, last poll and stored error state
    Status,

    /// Validate the configuration file and exit
    CheckConfig,
}
