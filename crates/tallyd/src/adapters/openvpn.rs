//! Parser for OpenVPN status logs (status-version 2)
//!
//! Only `CLIENT_LIST` rows are accounted:
//!
//! ```text
//! CLIENT_LIST,<name>,<real addr>,<virtual addr>,<virtual v6>,<rx>,<tx>,<since>,<since time_t>,...
//! ```
//!
//! `<since>` is "YYYY-MM-DD HH:MM:SS" in server local time.

use super::SourceOutput;
use chrono::{DateTime, NaiveDateTime, Utc};
use tally_common::clock::WallClock;
use tally_common::{ConnectionLogEntry, EntityKey, RawSnapshot, Result, TallyError};
use tracing::debug;

/// Literal tag of a session row
pub const SESSION_TAG: &str = "CLIENT_LIST";

const SINCE_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// One connected client session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub protocol: String,
    pub client: String,
    pub real_ip: String,
    pub local_ip: String,
    pub received: u64,
    pub sent: u64,
    pub connected_since: DateTime<Utc>,
}

impl SessionRecord {
    pub fn key(&self) -> EntityKey {
        EntityKey::session(&self.protocol, &self.client, &self.local_ip)
    }

    pub fn to_snapshot(&self, now: DateTime<Utc>) -> RawSnapshot {
        RawSnapshot {
            key: self.key(),
            client: self.client.clone(),
            received: self.received,
            sent: self.sent,
            observed_at: now,
            session_start: Some(self.connected_since),
            last_handshake: None,
            online: true,
        }
    }

    pub fn to_log_entry(&self) -> ConnectionLogEntry {
        ConnectionLogEntry {
            client: self.client.clone(),
            local_ip: self.local_ip.clone(),
            real_ip: self.real_ip.clone(),
            connected_since: self.connected_since,
            received: self.received,
            sent: self.sent,
            protocol: self.protocol.clone(),
        }
    }
}

/// Strip the provisioning prefix from a client name
pub fn clean_client_name<'a>(name: &'a str, prefix: &str) -> &'a str {
    if prefix.is_empty() {
        return name;
    }
    name.strip_prefix(prefix).unwrap_or(name)
}

/// Session identity of a row, readable even when later fields are garbage
fn row_key(fields: &[&str], protocol: &str, prefix: &str) -> Option<EntityKey> {
    let client = clean_client_name(fields.get(1)?.trim(), prefix);
    let local_ip = fields.get(3)?.trim();
    if client.is_empty() || local_ip.is_empty() {
        return None;
    }
    Some(EntityKey::session(protocol, client, local_ip))
}

fn parse_row<Z: WallClock + ?Sized>(
    fields: &[&str],
    protocol: &str,
    prefix: &str,
    zone: &Z,
) -> Result<SessionRecord> {
    if fields.len() < 8 {
        return Err(TallyError::parse(format!(
            "{} fields, expected at least 8",
            fields.len()
        )));
    }

    let client = clean_client_name(fields[1].trim(), prefix);
    if client.is_empty() {
        return Err(TallyError::parse("empty client name"));
    }

    let received: u64 = fields[5]
        .trim()
        .parse()
        .map_err(|_| TallyError::parse(format!("bad bytes received '{}'", fields[5])))?;
    let sent: u64 = fields[6]
        .trim()
        .parse()
        .map_err(|_| TallyError::parse(format!("bad bytes sent '{}'", fields[6])))?;

    let naive = NaiveDateTime::parse_from_str(fields[7].trim(), SINCE_FMT)
        .map_err(|_| TallyError::parse(format!("bad connected-since '{}'", fields[7])))?;
    let connected_since = zone.instant(naive).ok_or_else(|| {
        TallyError::parse(format!("connected-since '{}' falls in a DST gap", fields[7]))
    })?;

    Ok(SessionRecord {
        protocol: protocol.to_string(),
        client: client.to_string(),
        real_ip: fields[2].trim().to_string(),
        local_ip: fields[3].trim().to_string(),
        received,
        sent,
        connected_since,
    })
}

/// Parse a whole status log. The first line is a header and is ignored.
pub fn parse_session_log<Z: WallClock + ?Sized>(
    text: &str,
    protocol: &str,
    prefix: &str,
    zone: &Z,
) -> SourceOutput<SessionRecord> {
    let mut records = Vec::new();
    let mut skipped = 0;
    let mut skipped_keys = Vec::new();

    for (idx, line) in text.lines().enumerate().skip(1) {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.first().map(|f| f.trim()) != Some(SESSION_TAG) {
            continue;
        }
        match parse_row(&fields, protocol, prefix, zone) {
            Ok(record) => records.push(record),
            Err(e) => {
                debug!("{} line {}: {}", protocol, idx + 1, e);
                skipped += 1;
                skipped_keys.extend(row_key(&fields, protocol, prefix));
            }
        }
    }

    if skipped > 0 {
        debug!("{}: skipped {} malformed session rows", protocol, skipped);
    }
    SourceOutput::ok(records, skipped, skipped_keys)
}
