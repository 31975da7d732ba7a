//! Parser for `wg show` output
//!
//! The output is a sequence of blocks:
//!
//! ```text
//! interface: wg0
//!   public key: ...
//!   listening port: 51820
//!
//! peer: <base64 key>
//!   endpoint: 203.0.113.7:53311
//!   allowed ips: 10.29.8.2/32
//!   latest handshake: 1 minute, 23 seconds ago
//!   transfer: 1.21 MiB received, 18.40 MiB sent
//! ```
//!
//! Peers that never completed a handshake have no handshake/transfer lines
//! and are reported with zero counters.

use super::client_map::ClientMap;
use super::SourceOutput;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tally_common::clock::WallClock;
use tally_common::units::ByteCount;
use tally_common::{EntityKey, RawSnapshot, Result, TallyError};
use tracing::debug;

static TRANSFER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<rx>.+?)\s+received,\s*(?P<tx>.+?)\s+sent$").expect("valid transfer regex")
});

static RELATIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<n>\d+)\s+(?P<unit>second|minute|hour|day|week|month|year)s?")
        .expect("valid relative time regex")
});

/// One peer block
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub interface: String,
    pub public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    pub latest_handshake: Option<DateTime<Utc>>,
    pub received: u64,
    pub sent: u64,
}

impl PeerRecord {
    fn new(interface: String, public_key: String) -> Self {
        Self {
            interface,
            public_key,
            endpoint: None,
            allowed_ips: Vec::new(),
            latest_handshake: None,
            received: 0,
            sent: 0,
        }
    }

    /// Handshake within `window` of `now`
    pub fn is_online(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.latest_handshake
            .map(|h| now.signed_duration_since(h) <= window)
            .unwrap_or(false)
    }

    pub fn into_snapshot(
        self,
        clients: &ClientMap,
        now: DateTime<Utc>,
        window: Duration,
    ) -> RawSnapshot {
        let online = self.is_online(now, window);
        RawSnapshot {
            client: clients.resolve(&self.public_key).to_string(),
            key: EntityKey::peer(self.interface, self.public_key),
            received: self.received,
            sent: self.sent,
            observed_at: now,
            session_start: None,
            last_handshake: self.latest_handshake,
            online,
        }
    }
}

/// Parse a `latest handshake` value
///
/// Returns `Ok(None)` for peers that never shook hands.
pub fn parse_handshake<Z: WallClock + ?Sized>(
    value: &str,
    now: DateTime<Utc>,
    zone: &Z,
) -> Result<Option<DateTime<Utc>>> {
    let value = value.trim();
    let lower = value.to_ascii_lowercase();

    match lower.as_str() {
        "" | "never" | "(none)" | "n/a" => return Ok(None),
        "now" => return Ok(Some(now)),
        _ => {}
    }

    let mut elapsed = Duration::zero();
    let mut matched = false;
    for caps in RELATIVE_RE.captures_iter(&lower) {
        let n: i64 = caps["n"]
            .parse()
            .map_err(|_| TallyError::parse(format!("bad handshake '{}'", value)))?;
        // wg prints calendar units as fixed lengths: 30-day months, 365-day years
        let unit = match &caps["unit"] {
            "second" => Duration::seconds(n),
            "minute" => Duration::minutes(n),
            "hour" => Duration::hours(n),
            "day" => Duration::days(n),
            "week" => Duration::weeks(n),
            "month" => Duration::days(30 * n),
            "year" => Duration::days(365 * n),
            other => {
                return Err(TallyError::parse(format!(
                    "unknown unit '{}' in handshake '{}'",
                    other, value
                )))
            }
        };
        elapsed += unit;
        matched = true;
    }
    if matched {
        return Ok(Some(now - elapsed));
    }

    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .map_err(|_| TallyError::parse(format!("bad handshake '{}'", value)))?;
    zone.instant(naive)
        .map(Some)
        .ok_or_else(|| TallyError::parse(format!("handshake '{}' falls in a DST gap", value)))
}

fn parse_transfer(value: &str) -> Result<(u64, u64)> {
    let caps = TRANSFER_RE
        .captures(value.trim())
        .ok_or_else(|| TallyError::parse(format!("bad transfer '{}'", value)))?;
    let rx = ByteCount::parse(&caps["rx"])?;
    let tx = ByteCount::parse(&caps["tx"])?;
    Ok((rx.bytes(), tx.bytes()))
}

/// Parse full `wg show` output into peer records
pub fn parse_peer_status<Z: WallClock + ?Sized>(
    output: &str,
    now: DateTime<Utc>,
    zone: &Z,
) -> SourceOutput<PeerRecord> {
    let mut records = Vec::new();
    let mut skipped = 0;
    let mut skipped_keys = Vec::new();
    let mut interface: Option<String> = None;
    // Current peer; None once it turned out malformed
    let mut current: Option<PeerRecord> = None;
    let mut current_broken = false;

    let mut flush = |peer: Option<PeerRecord>, broken: bool, records: &mut Vec<PeerRecord>| {
        if let Some(peer) = peer {
            if broken {
                skipped += 1;
                if !peer.interface.is_empty() {
                    skipped_keys.push(EntityKey::peer(peer.interface, peer.public_key));
                }
            } else {
                records.push(peer);
            }
        }
    };

    for line in output.lines() {
        let line = line.trim();
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match field.trim() {
            "interface" => {
                flush(current.take(), current_broken, &mut records);
                current_broken = false;
                interface = Some(value.to_string());
            }
            "peer" => {
                flush(current.take(), current_broken, &mut records);
                current_broken = false;
                match &interface {
                    Some(iface) if !value.is_empty() => {
                        current = Some(PeerRecord::new(iface.clone(), value.to_string()));
                    }
                    _ => {
                        debug!("Peer '{}' outside an interface block", value);
                        current = Some(PeerRecord::new(String::new(), value.to_string()));
                        current_broken = true;
                    }
                }
            }
            "endpoint" => {
                if let Some(peer) = current.as_mut() {
                    peer.endpoint = Some(value.to_string());
                }
            }
            "allowed ips" => {
                if let Some(peer) = current.as_mut() {
                    peer.allowed_ips = value
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty() && s != "(none)")
                        .collect();
                }
            }
            "latest handshake" => {
                if let Some(peer) = current.as_mut() {
                    match parse_handshake(value, now, zone) {
                        Ok(h) => peer.latest_handshake = h,
                        // Only the online flag depends on it; keep the peer
                        Err(e) => debug!("{}: {}", peer.public_key, e),
                    }
                }
            }
            "transfer" => {
                if let Some(peer) = current.as_mut() {
                    match parse_transfer(value) {
                        Ok((rx, tx)) => {
                            peer.received = rx;
                            peer.sent = tx;
                        }
                        Err(e) => {
                            debug!("{}: {}", peer.public_key, e);
                            current_broken = true;
                        }
                    }
                }
            }
            _ => {}
        }
    }
    flush(current.take(), current_broken, &mut records);

    SourceOutput::ok(records, skipped, skipped_keys)
}
