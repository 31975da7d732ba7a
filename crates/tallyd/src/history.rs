//! Connection history recorder
//!
//! Keeps a bounded log of recent sessions, one row per (client, connected
//! since). Seeing a session again only adds its non-negative growth.

use crate::adapters::openvpn::SessionRecord;
use tally_common::ledger::{HistoryReport, Ledger};
use tally_common::Result;
use tracing::debug;

/// Default number of sessions kept
pub const DEFAULT_HISTORY_CAP: u32 = 100;

pub struct ConnectionHistory {
    cap: u32,
}

impl ConnectionHistory {
    pub fn new(cap: u32) -> Self {
        Self { cap: cap.max(1) }
    }

    pub fn cap(&self) -> u32 {
        self.cap
    }

    pub fn record(&self, ledger: &mut Ledger, sessions: &[SessionRecord]) -> Result<HistoryReport> {
        if sessions.is_empty() {
            return Ok(HistoryReport::default());
        }
        let entries: Vec<_> = sessions.iter().map(SessionRecord::to_log_entry).collect();
        let report = ledger.record_connections(&entries, self.cap)?;
        debug!(
            "Connection history: {} new, {} grown, {} evicted",
            report.inserted, report.updated, report.evicted
        );
        Ok(report)
    }
}

impl Default for ConnectionHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn session(client: &str, minute: u32, received: u64) -> SessionRecord {
        SessionRecord {
            protocol: "UDP".into(),
            client: client.into(),
            real_ip: "198.51.100.4:50111".into(),
            local_ip: "10.8.0.2".into(),
            received,
            sent: 0,
            connected_since: Utc.with_ymd_and_hms(2024, 1, 1, 10, minute, 0).unwrap(),
        }
    }

    #[test]
    fn test_same_session_grows_in_place() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        let history = ConnectionHistory::default();

        history.record(&mut ledger, &[session("alice", 0, 2048)]).unwrap();
        let report = history.record(&mut ledger, &[session("alice", 0, 4096)]).unwrap();
        assert_eq!(report.updated, 1);

        let rows = ledger.connection_history(100).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].received, 4096);
    }

    #[test]
    fn test_reconnect_is_new_row() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        let history = ConnectionHistory::default();
        history
            .record(&mut ledger, &[session("alice", 0, 10), session("alice", 30, 5)])
            .unwrap();
        let rows = ledger.connection_history(100).unwrap();
        assert_eq!(rows.len(), 2);
        // Newest first
        assert_eq!(rows[0].received, 5);
    }

    #[test]
    fn test_cap_is_respected() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        let history = ConnectionHistory::new(3);
        let sessions: Vec<_> = (0..10).map(|m| session("c", m, 1)).collect();
        history.record(&mut ledger, &sessions).unwrap();
        assert_eq!(ledger.connection_count().unwrap(), 3);
    }
}
