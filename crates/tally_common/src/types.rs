//! Typed records shared by the daemon, the ledger and the console.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Client name used when a peer key has no mapping
pub const UNKNOWN_CLIENT: &str = "unknown";

// ============================================================================
// IDENTITY
// ============================================================================

/// Which external daemon reported a counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Tunnel peers from the peer-status command
    WireGuard,
    /// Client sessions from status logs
    OpenVpn,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::WireGuard => "wireguard",
            SourceKind::OpenVpn => "openvpn",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "wireguard" => Some(SourceKind::WireGuard),
            "openvpn" => Some(SourceKind::OpenVpn),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity for delta tracking
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKey {
    /// A tunnel peer within an interface
    Peer { interface: String, public_key: String },
    /// A client session in one status log
    Session {
        protocol: String,
        client: String,
        local_ip: String,
    },
}

impl EntityKey {
    pub fn peer(interface: impl Into<String>, public_key: impl Into<String>) -> Self {
        EntityKey::Peer {
            interface: interface.into(),
            public_key: public_key.into(),
        }
    }

    pub fn session(
        protocol: impl Into<String>,
        client: impl Into<String>,
        local_ip: impl Into<String>,
    ) -> Self {
        EntityKey::Session {
            protocol: protocol.into(),
            client: client.into(),
            local_ip: local_ip.into(),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            EntityKey::Peer { .. } => SourceKind::WireGuard,
            EntityKey::Session { .. } => SourceKind::OpenVpn,
        }
    }

    /// Storage columns: (kind, scope, ident, detail)
    pub fn columns(&self) -> (&'static str, &str, &str, &str) {
        match self {
            EntityKey::Peer {
                interface,
                public_key,
            } => (SourceKind::WireGuard.as_str(), interface, public_key, ""),
            EntityKey::Session {
                protocol,
                client,
                local_ip,
            } => (SourceKind::OpenVpn.as_str(), protocol, client, local_ip),
        }
    }

    pub fn from_columns(kind: &str, scope: String, ident: String, detail: String) -> Option<Self> {
        match SourceKind::from_db(kind)? {
            SourceKind::WireGuard => Some(EntityKey::Peer {
                interface: scope,
                public_key: ident,
            }),
            SourceKind::OpenVpn => Some(EntityKey::Session {
                protocol: scope,
                client: ident,
                local_ip: detail,
            }),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Peer {
                interface,
                public_key,
            } => write!(f, "{}/{}", interface, public_key),
            EntityKey::Session {
                protocol,
                client,
                local_ip,
            } => write!(f, "{}/{}@{}", protocol, client, local_ip),
        }
    }
}

// ============================================================================
// OBSERVATIONS
// ============================================================================

/// One counter observation produced by a source adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub key: EntityKey,
    /// Resolved client name, `UNKNOWN_CLIENT` when unmapped
    pub client: String,
    pub received: u64,
    pub sent: u64,
    pub observed_at: DateTime<Utc>,
    /// Start of the session the counters belong to (session logs only)
    pub session_start: Option<DateTime<Utc>>,
    /// Last handshake reported for a peer
    pub last_handshake: Option<DateTime<Utc>>,
    /// Connected right now (fresh handshake, or listed session)
    pub online: bool,
}

impl RawSnapshot {
    /// Instant the entity was last seen connected
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.last_handshake.unwrap_or(self.observed_at)
    }
}

/// Non-negative counter growth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Delta {
    pub received: u64,
    pub sent: u64,
}

impl Delta {
    pub const ZERO: Delta = Delta {
        received: 0,
        sent: 0,
    };

    pub fn new(received: u64, sent: u64) -> Self {
        Self { received, sent }
    }

    pub fn is_zero(&self) -> bool {
        self.received == 0 && self.sent == 0
    }
}

// ============================================================================
// PERSISTED ROWS
// ============================================================================

/// Last committed counters for one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    pub key: EntityKey,
    pub last_received: u64,
    pub last_sent: u64,
    /// Period (local date) the baseline was committed for
    pub period: NaiveDate,
    pub session_start: Option<DateTime<Utc>>,
}

impl Baseline {
    pub fn zero(key: EntityKey, period: NaiveDate, session_start: Option<DateTime<Utc>>) -> Self {
        Self {
            key,
            last_received: 0,
            last_sent: 0,
            period,
            session_start,
        }
    }
}

/// Traffic accumulated for one entity on one date
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyBucket {
    pub date: NaiveDate,
    pub key: EntityKey,
    pub client: String,
    pub received: u64,
    pub sent: u64,
}

/// Traffic accumulated for one client in one month
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyBucket {
    pub kind: SourceKind,
    pub client: String,
    pub month: MonthKey,
    pub total_received: u64,
    pub total_sent: u64,
    pub observations: u64,
    pub last_connected: DateTime<Utc>,
}

/// One recorded session in the bounded connection history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionLogEntry {
    pub client: String,
    pub local_ip: String,
    pub real_ip: String,
    pub connected_since: DateTime<Utc>,
    pub received: u64,
    pub sent: u64,
    pub protocol: String,
}

// ============================================================================
// PERIODS
// ============================================================================

/// Calendar month, stored as "YYYY-MM"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonthKey {
    pub year: i32,
    pub month: u32,
}

impl MonthKey {
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn previous(self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    /// Label for display ("Jan. 2024")
    pub fn label(self) -> String {
        match NaiveDate::from_ymd_opt(self.year, self.month, 1) {
            Some(d) => d.format("%b. %Y").to_string(),
            None => self.to_string(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let (y, m) = s.split_once('-')?;
        let year = y.parse().ok()?;
        let month: u32 = m.parse().ok()?;
        (1..=12).contains(&month).then_some(Self { year, month })
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}
