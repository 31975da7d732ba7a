//! Terminal rendering - plain ASCII tables with colored headers

use chrono::{DateTime, NaiveDate, Utc};
use owo_colors::OwoColorize;
use serde::Serialize;
use tally_common::clock::{WallClock, ZoneSetting};
use tally_common::config::{TallyConfig, Timing};
use tally_common::units::ByteCount;
use tally_common::views::MonthlyReport;
use tally_common::{ConnectionLogEntry, DailyBucket, EntityKey, MonthKey, MonthlyBucket};

const SEPARATOR: &str = "------------------------------------------------------------------------";

/// Daemon state as stored in the ledger
#[derive(Debug, Serialize)]
pub struct StatusView {
    pub database: String,
    pub phase: Option<String>,
    pub current_period: Option<NaiveDate>,
    pub last_rollover: Option<String>,
    pub last_poll: Option<String>,
    pub last_error: Option<String>,
    pub config_error: Option<String>,
    pub peers: usize,
    pub sessions: usize,
    pub history_rows: u64,
}

fn bytes(n: u64) -> String {
    ByteCount(n).display_binary()
}

fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", SEPARATOR.dimmed());
}

fn local_time(zone: &ZoneSetting, at: DateTime<Utc>) -> String {
    zone.local(at).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn entity_label(key: &EntityKey) -> String {
    match key {
        EntityKey::Peer {
            interface,
            public_key,
        } => {
            // Keys are long; the prefix is enough to tell peers apart
            let short: String = public_key.chars().take(12).collect();
            format!("{} {}", interface, short)
        }
        EntityKey::Session {
            protocol, local_ip, ..
        } => format!("{} {}", protocol, local_ip),
    }
}

pub fn print_daily(date: NaiveDate, buckets: &[DailyBucket]) {
    header(&format!("Daily traffic for {}", date));
    if buckets.is_empty() {
        println!("  {}", "No traffic recorded".dimmed());
        return;
    }

    println!(
        "  {:<20} {:<24} {:>14} {:>14}",
        "CLIENT".cyan(),
        "ENTITY".cyan(),
        "RECEIVED".cyan(),
        "SENT".cyan()
    );
    let (mut rx, mut tx) = (0u64, 0u64);
    for b in buckets {
        println!(
            "  {:<20} {:<24} {:>14} {:>14}",
            b.client,
            entity_label(&b.key),
            bytes(b.received),
            bytes(b.sent)
        );
        rx = rx.saturating_add(b.received);
        tx = tx.saturating_add(b.sent);
    }
    println!("{}", SEPARATOR.dimmed());
    println!(
        "  {:<20} {:<24} {:>14} {:>14}",
        "TOTAL".bold(),
        "",
        bytes(rx),
        bytes(tx)
    );
}

fn month_cell(bucket: Option<&MonthlyBucket>) -> String {
    match bucket {
        Some(b) => format!("{} / {}", bytes(b.total_received), bytes(b.total_sent)),
        None => "-".to_string(),
    }
}

pub fn print_monthly(current: MonthKey, reports: &[MonthlyReport], zone: &ZoneSetting) {
    header(&format!(
        "Monthly traffic: {} (previous {})",
        current.label(),
        current.previous().label()
    ));
    if reports.is_empty() {
        println!("  {}", "No traffic recorded".dimmed());
        return;
    }

    println!(
        "  {:<10} {:<20} {:>28} {:>28} {:>20}",
        "TYPE".cyan(),
        "CLIENT".cyan(),
        "CURRENT (RX / TX)".cyan(),
        "PREVIOUS (RX / TX)".cyan(),
        "LAST CONNECTED".cyan()
    );
    for r in reports {
        let last = r
            .current
            .as_ref()
            .or(r.previous.as_ref())
            .map(|b| local_time(zone, b.last_connected))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<10} {:<20} {:>28} {:>28} {:>20}",
            r.kind.as_str(),
            r.client,
            month_cell(r.current.as_ref()),
            month_cell(r.previous.as_ref()),
            last
        );
    }
}

pub fn print_history(entries: &[ConnectionLogEntry], zone: &ZoneSetting) {
    header("Recent connections");
    if entries.is_empty() {
        println!("  {}", "No sessions recorded".dimmed());
        return;
    }

    println!(
        "  {:<20} {:<6} {:<16} {:<22} {:<20} {:>12} {:>12}",
        "CLIENT".cyan(),
        "PROTO".cyan(),
        "LOCAL IP".cyan(),
        "REAL IP".cyan(),
        "CONNECTED SINCE".cyan(),
        "RECEIVED".cyan(),
        "SENT".cyan()
    );
    for e in entries {
        println!(
            "  {:<20} {:<6} {:<16} {:<22} {:<20} {:>12} {:>12}",
            e.client,
            e.protocol,
            e.local_ip,
            e.real_ip,
            local_time(zone, e.connected_since),
            bytes(e.received),
            bytes(e.sent)
        );
    }
}

fn field(label: &str, value: Option<&str>) {
    println!("  {:<16} {}", label, value.unwrap_or("-"));
}

pub fn print_status(status: &StatusView) {
    header("Tally status");
    field("Database", Some(status.database.as_str()));

    let phase = status.phase.as_deref().unwrap_or("unknown");
    let phase = if phase == "polling" {
        phase.bright_green().to_string()
    } else {
        phase.yellow().to_string()
    };
    field("Phase", Some(phase.as_str()));

    let period = status.current_period.map(|d| d.to_string());
    field("Period", period.as_deref());
    field("Last rollover", status.last_rollover.as_deref());
    field("Last poll", status.last_poll.as_deref());
    println!("  {:<16} {} peers, {} sessions", "Baselines", status.peers, status.sessions);
    println!("  {:<16} {}", "History rows", status.history_rows);

    if let Some(err) = &status.config_error {
        println!();
        println!("[ERROR] {}", err.bright_red());
    }
    if let Some(err) = &status.last_error {
        println!();
        println!("[WARNING] {}", err.yellow());
    }
}

pub fn print_config(path: &str, config: &TallyConfig, timing: &Timing) {
    header(&format!("Configuration {}", path));
    println!("  {:<16} {}", "Database", config.storage.database.display());
    println!("  {:<16} {}", "Zone", timing.zone);
    println!(
        "  {:<16} every {}s, sync every {}s",
        "Polling",
        timing.poll_interval.as_secs(),
        timing.sync_interval.as_secs()
    );
    println!(
        "  {:<16} fix {} / resume {}",
        "Day boundary",
        timing.fix_time.format("%H:%M"),
        timing.resume_time.format("%H:%M")
    );
    println!(
        "  {:<16} {} days daily, {} sessions",
        "Retention", config.retention.daily_days, config.retention.history_cap
    );
    println!(
        "  {:<16} {} ({} client configs)",
        "WireGuard",
        config.wireguard.command.display(),
        config.wireguard.client_configs.len()
    );
    for log in &config.openvpn.logs {
        println!("  {:<16} {} {}", "OpenVPN log", log.protocol, log.path.display());
    }
    println!();
    println!("{}", "[OK] Configuration is valid".bright_green());
}
