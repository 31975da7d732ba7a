//! tallyctl - console for the tally traffic ledger
//!
//! Reads the last committed aggregates; never triggers collection.

mod cli;
mod display;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::Parser;
use cli::{Cli, Commands};
use display::StatusView;
use serde::Serialize;
use std::path::Path;
use tally_common::clock::WallClock;
use tally_common::config::TallyConfig;
use tally_common::ledger::{
    META_CONFIG_ERROR, META_LAST_ERROR, META_LAST_POLL, META_LAST_ROLLOVER, META_PHASE,
};
use tally_common::{Ledger, MonthKey, SourceKind};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.config.display().to_string();
    let (config, timing) = TallyConfig::load_validated(&cli.config)
        .with_context(|| format!("invalid configuration {}", path))?;
    let zone = timing.zone;
    let db = &config.storage.database;

    match cli.command {
        Commands::CheckConfig => {
            if cli.json {
                print_json(&config)?;
            } else {
                display::print_config(&path, &config, &timing);
            }
        }
        Commands::Daily { date } => {
            let ledger = open_ledger(db)?;
            let date = match date {
                Some(s) => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                    .with_context(|| format!("invalid date '{}', expected YYYY-MM-DD", s))?,
                None => zone.date_of(Utc::now()),
            };
            let buckets = ledger.daily_buckets(date)?;
            if cli.json {
                print_json(&buckets)?;
            } else {
                display::print_daily(date, &buckets);
            }
        }
        Commands::Monthly { month } => {
            let ledger = open_ledger(db)?;
            let month = match month {
                Some(s) => MonthKey::parse(&s)
                    .with_context(|| format!("invalid month '{}', expected YYYY-MM", s))?,
                None => MonthKey::of(zone.date_of(Utc::now())),
            };
            let reports = ledger.monthly_report(month)?;
            if cli.json {
                print_json(&reports)?;
            } else {
                display::print_monthly(month, &reports, &zone);
            }
        }
        Commands::History { limit } => {
            let ledger = open_ledger(db)?;
            let entries = ledger.connection_history(limit)?;
            if cli.json {
                print_json(&entries)?;
            } else {
                display::print_history(&entries, &zone);
            }
        }
        Commands::Status => {
            let ledger = open_ledger(db)?;
            let status = StatusView {
                database: db.display().to_string(),
                phase: ledger.get_meta(META_PHASE)?,
                current_period: ledger.current_period()?,
                last_rollover: ledger.get_meta(META_LAST_ROLLOVER)?,
                last_poll: ledger.get_meta(META_LAST_POLL)?,
                last_error: ledger.get_meta(META_LAST_ERROR)?,
                config_error: ledger.get_meta(META_CONFIG_ERROR)?,
                peers: ledger.baselines(Some(SourceKind::WireGuard))?.len(),
                sessions: ledger.baselines(Some(SourceKind::OpenVpn))?.len(),
                history_rows: ledger.connection_count()?,
            };
            if cli.json {
                print_json(&status)?;
            } else {
                display::print_status(&status);
            }
        }
    }

    Ok(())
}

fn open_ledger(db: &Path) -> Result<Ledger> {
    if !db.exists() {
        bail!("no ledger at {} (has tallyd run yet?)", db.display());
    }
    Ledger::open_readonly(db).with_context(|| format!("failed to open ledger {}", db.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
