//! Read views over the ledger
//!
//! These are the only things the presentation side consumes: it reads the
//! last committed aggregates and never triggers collection.

use crate::error::Result;
use crate::ledger::{date_to_db, from_db, instant_from_db, Ledger};
use crate::types::{
    ConnectionLogEntry, DailyBucket, EntityKey, MonthKey, MonthlyBucket, SourceKind,
};
use chrono::NaiveDate;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Received/sent pair for a view cell
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub received: u64,
    pub sent: u64,
}

/// Monthly report for one client: current and previous month side by side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyReport {
    pub kind: SourceKind,
    pub client: String,
    pub current: Option<MonthlyBucket>,
    pub previous: Option<MonthlyBucket>,
}

impl Ledger {
    /// Daily buckets for one date
    pub fn daily_buckets(&self, date: NaiveDate) -> Result<Vec<DailyBucket>> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, scope, ident, detail, client, received, sent
             FROM daily_buckets WHERE date = ?1
             ORDER BY kind, scope, ident, detail",
        )?;
        let rows = stmt.query_map(params![date_to_db(date)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (kind, scope, ident, detail, client, received, sent) = row?;
            if let Some(key) = EntityKey::from_columns(&kind, scope, ident, detail) {
                out.push(DailyBucket {
                    date,
                    key,
                    client,
                    received: from_db(received),
                    sent: from_db(sent),
                });
            }
        }
        Ok(out)
    }

    /// Daily map: (peer key, interface) -> transfer for a date
    pub fn daily_peer_map(&self, date: NaiveDate) -> Result<BTreeMap<(String, String), Transfer>> {
        let mut map = BTreeMap::new();
        for bucket in self.daily_buckets(date)? {
            if let EntityKey::Peer {
                interface,
                public_key,
            } = bucket.key
            {
                map.insert(
                    (public_key, interface),
                    Transfer {
                        received: bucket.received,
                        sent: bucket.sent,
                    },
                );
            }
        }
        Ok(map)
    }

    /// Every monthly bucket, newest month first
    pub fn monthly_buckets(&self) -> Result<Vec<MonthlyBucket>> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, client, month, total_received, total_sent, observations, last_connected
             FROM monthly_buckets
             ORDER BY month DESC, kind, client",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (kind, client, month, received, sent, observations, last) = row?;
            let (Some(kind), Some(month)) = (SourceKind::from_db(&kind), MonthKey::parse(&month))
            else {
                continue;
            };
            out.push(MonthlyBucket {
                kind,
                client,
                month,
                total_received: from_db(received),
                total_sent: from_db(sent),
                observations: from_db(observations),
                last_connected: instant_from_db(last),
            });
        }
        Ok(out)
    }

    /// Per-client current/previous month totals relative to `current`
    pub fn monthly_report(&self, current: MonthKey) -> Result<Vec<MonthlyReport>> {
        let previous = current.previous();
        let mut by_client: BTreeMap<(SourceKind, String), MonthlyReport> = BTreeMap::new();

        for bucket in self.monthly_buckets()? {
            let slot = if bucket.month == current {
                0
            } else if bucket.month == previous {
                1
            } else {
                continue;
            };
            let report = by_client
                .entry((bucket.kind, bucket.client.clone()))
                .or_insert_with(|| MonthlyReport {
                    kind: bucket.kind,
                    client: bucket.client.clone(),
                    current: None,
                    previous: None,
                });
            if slot == 0 {
                report.current = Some(bucket);
            } else {
                report.previous = Some(bucket);
            }
        }

        Ok(by_client.into_values().collect())
    }

    /// Most recent sessions, newest first
    pub fn connection_history(&self, limit: u32) -> Result<Vec<ConnectionLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT client, local_ip, real_ip, connected_since, received, sent, protocol
             FROM connection_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(ConnectionLogEntry {
                client: row.get(0)?,
                local_ip: row.get(1)?,
                real_ip: row.get(2)?,
                connected_since: instant_from_db(row.get(3)?),
                received: from_db(row.get(4)?),
                sent: from_db(row.get(5)?),
                protocol: row.get(6)?,
            })
        })?;
        let entries = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{BucketWrite, Commit};
    use crate::types::{Baseline, Delta};
    use chrono::{TimeZone, Utc};

    fn write(ledger: &mut Ledger, key: EntityKey, client: &str, date: NaiveDate, delta: Delta) {
        ledger
            .commit(&Commit {
                baseline: Baseline::zero(key, date, None),
                bucket: Some(BucketWrite {
                    date,
                    month: MonthKey::of(date),
                    client: client.into(),
                    delta,
                    connected_at: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
                }),
            })
            .unwrap();
    }

    #[test]
    fn test_daily_peer_map_skips_sessions() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 2, 10).unwrap();
        write(&mut ledger, EntityKey::peer("wg0", "pk"), "alice", date, Delta::new(10, 5));
        write(&mut ledger, EntityKey::session("UDP", "bob", "10.8.0.2"), "bob", date, Delta::new(1, 1));

        let map = ledger.daily_peer_map(date).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(
            map.get(&("pk".to_string(), "wg0".to_string())),
            Some(&Transfer { received: 10, sent: 5 })
        );
    }

    #[test]
    fn test_monthly_report_pairs_months() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        let key = EntityKey::peer("wg0", "pk");
        let jan = NaiveDate::from_ymd_opt(2024, 1, 20).unwrap();
        let feb = NaiveDate::from_ymd_opt(2024, 2, 3).unwrap();
        write(&mut ledger, key.clone(), "alice", jan, Delta::new(100, 1));
        write(&mut ledger, key.clone(), "alice", feb, Delta::new(7, 7));
        write(&mut ledger, key, "carol", feb, Delta::new(3, 3));

        let report = ledger.monthly_report(MonthKey::of(feb)).unwrap();
        assert_eq!(report.len(), 2);
        let alice = &report[0];
        assert_eq!(alice.client, "alice");
        assert_eq!(alice.current.as_ref().unwrap().total_received, 7);
        assert_eq!(alice.previous.as_ref().unwrap().total_received, 100);
        assert!(report[1].previous.is_none());
    }
}
