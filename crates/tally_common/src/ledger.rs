//! Ledger - SQLite-backed snapshot store and traffic buckets
//!
//! Schema:
//! - baselines: last committed counters per entity (delta reference point)
//! - daily_buckets: per-entity traffic per local date
//! - monthly_buckets: per-client traffic per month (current + previous only)
//! - connection_log: bounded history of recent sessions
//! - ledger_meta: key-value metadata (last rollover, ...)
//!
//! Every logical operation runs in one transaction: a per-entity delta
//! application touches its baseline and both buckets atomically, and a
//! period rollover commits all of its entities at once.

use crate::error::Result;
use crate::types::{
    Baseline, ConnectionLogEntry, Delta, EntityKey, MonthKey, SourceKind,
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use std::path::Path;
use tracing::debug;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS baselines (
    kind TEXT NOT NULL,
    scope TEXT NOT NULL,
    ident TEXT NOT NULL,
    detail TEXT NOT NULL,
    last_received INTEGER NOT NULL,
    last_sent INTEGER NOT NULL,
    period TEXT NOT NULL,
    session_start INTEGER,
    PRIMARY KEY (kind, scope, ident, detail)
);

CREATE TABLE IF NOT EXISTS daily_buckets (
    date TEXT NOT NULL,
    kind TEXT NOT NULL,
    scope TEXT NOT NULL,
    ident TEXT NOT NULL,
    detail TEXT NOT NULL,
    client TEXT NOT NULL,
    received INTEGER NOT NULL,
    sent INTEGER NOT NULL,
    PRIMARY KEY (date, kind, scope, ident, detail)
);

CREATE TABLE IF NOT EXISTS monthly_buckets (
    kind TEXT NOT NULL,
    client TEXT NOT NULL,
    month TEXT NOT NULL,
    total_received INTEGER NOT NULL,
    total_sent INTEGER NOT NULL,
    observations INTEGER NOT NULL,
    last_connected INTEGER NOT NULL,
    PRIMARY KEY (kind, client, month)
);

CREATE TABLE IF NOT EXISTS connection_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client TEXT NOT NULL,
    local_ip TEXT NOT NULL,
    real_ip TEXT NOT NULL,
    connected_since INTEGER NOT NULL,
    received INTEGER NOT NULL,
    sent INTEGER NOT NULL,
    protocol TEXT NOT NULL,
    UNIQUE (client, connected_since)
);

CREATE INDEX IF NOT EXISTS idx_daily_date ON daily_buckets(date);

CREATE TABLE IF NOT EXISTS ledger_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Meta key holding the period opened by the last rollover
pub const META_LAST_ROLLOVER: &str = "last_rollover";

/// Daemon state written for the console
pub const META_PHASE: &str = "phase";
pub const META_LAST_POLL: &str = "last_poll";
pub const META_LAST_ERROR: &str = "last_error";
pub const META_CONFIG_ERROR: &str = "config_error";

pub(crate) const DATE_FMT: &str = "%Y-%m-%d";

pub(crate) fn to_db(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

pub(crate) fn from_db(v: i64) -> u64 {
    v.max(0) as u64
}

pub(crate) fn date_to_db(d: NaiveDate) -> String {
    d.format(DATE_FMT).to_string()
}

pub(crate) fn date_from_db(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FMT).ok()
}

pub(crate) fn instant_from_db(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Bucket side of a commit
#[derive(Debug, Clone, PartialEq)]
pub struct BucketWrite {
    pub date: NaiveDate,
    pub month: MonthKey,
    pub client: String,
    pub delta: Delta,
    pub connected_at: DateTime<Utc>,
}

/// One atomic per-entity write: the new baseline plus optional bucket growth
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub baseline: Baseline,
    pub bucket: Option<BucketWrite>,
}

/// Outcome of a baseline sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub seeded: usize,
    pub removed: usize,
}

/// Outcome of one connection-history pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryReport {
    pub inserted: usize,
    pub updated: usize,
    pub evicted: usize,
}

/// SQLite-backed ledger
pub struct Ledger {
    pub(crate) conn: Connection,
}

impl Ledger {
    /// Open or create the ledger at a path (daemon use)
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        // WAL so tallyctl can read while the daemon writes
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        debug!("Ledger opened at {}", path.display());
        Ok(Self { conn })
    }

    /// Open read-only (console use)
    pub fn open_readonly<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self { conn })
    }

    /// In-memory ledger for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    // ------------------------------------------------------------------------
    // Baselines
    // ------------------------------------------------------------------------

    pub fn baseline(&self, key: &EntityKey) -> Result<Option<Baseline>> {
        let (kind, scope, ident, detail) = key.columns();
        let row = self
            .conn
            .query_row(
                "SELECT last_received, last_sent, period, session_start FROM baselines
                 WHERE kind = ?1 AND scope = ?2 AND ident = ?3 AND detail = ?4",
                params![kind, scope, ident, detail],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.and_then(|(received, sent, period, session_start)| {
            Some(Baseline {
                key: key.clone(),
                last_received: from_db(received),
                last_sent: from_db(sent),
                period: date_from_db(&period)?,
                session_start: session_start.map(instant_from_db),
            })
        }))
    }

    /// All baselines, optionally restricted to one source kind
    pub fn baselines(&self, kind: Option<SourceKind>) -> Result<Vec<Baseline>> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, scope, ident, detail, last_received, last_sent, period, session_start
             FROM baselines
             WHERE ?1 IS NULL OR kind = ?1
             ORDER BY kind, scope, ident, detail",
        )?;

        let rows = stmt.query_map(params![kind.map(|k| k.as_str())], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<i64>>(7)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (kind, scope, ident, detail, received, sent, period, session_start) = row?;
            let (Some(key), Some(period)) = (
                EntityKey::from_columns(&kind, scope, ident, detail),
                date_from_db(&period),
            ) else {
                continue;
            };
            out.push(Baseline {
                key,
                last_received: from_db(received),
                last_sent: from_db(sent),
                period,
                session_start: session_start.map(instant_from_db),
            });
        }
        Ok(out)
    }

    /// Latest period marker across all baselines
    pub fn current_period(&self) -> Result<Option<NaiveDate>> {
        let period: Option<String> =
            self.conn
                .query_row("SELECT MAX(period) FROM baselines", [], |row| row.get(0))?;
        Ok(period.as_deref().and_then(date_from_db))
    }

    /// Apply one per-entity commit atomically
    pub fn commit(&mut self, commit: &Commit) -> Result<()> {
        let tx = self.conn.transaction()?;
        apply_commit(&tx, commit)?;
        tx.commit()?;
        Ok(())
    }

    /// Close a period: apply the final commits and move every baseline to
    /// `next_period`, all in one transaction
    pub fn rollover(&mut self, commits: &[Commit], next_period: NaiveDate) -> Result<usize> {
        let tx = self.conn.transaction()?;
        for commit in commits {
            apply_commit(&tx, commit)?;
        }
        let marked = tx.execute(
            "UPDATE baselines SET period = ?1",
            params![date_to_db(next_period)],
        )?;
        set_meta_tx(&tx, META_LAST_ROLLOVER, &date_to_db(next_period))?;
        tx.commit()?;
        Ok(marked)
    }

    /// Re-mark every baseline with a period without touching counters
    pub fn mark_period(&mut self, period: NaiveDate) -> Result<usize> {
        let marked = self.conn.execute(
            "UPDATE baselines SET period = ?1",
            params![date_to_db(period)],
        )?;
        Ok(marked)
    }

    /// Seed zero baselines for new entities and drop those no longer
    /// reported, in one transaction. Existing baselines are left alone.
    ///
    /// `retained` lists entities the source still reported but whose record
    /// could not be parsed; they are kept as if seeded. `None` disables
    /// deletion altogether.
    pub fn sync_baselines(
        &mut self,
        kind: SourceKind,
        seeds: &[Baseline],
        retained: Option<&[EntityKey]>,
    ) -> Result<SyncReport> {
        let tx = self.conn.transaction()?;
        let mut report = SyncReport::default();

        for seed in seeds {
            let (k, scope, ident, detail) = seed.key.columns();
            report.seeded += tx.execute(
                "INSERT OR IGNORE INTO baselines
                 (kind, scope, ident, detail, last_received, last_sent, period, session_start)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    k,
                    scope,
                    ident,
                    detail,
                    to_db(seed.last_received),
                    to_db(seed.last_sent),
                    date_to_db(seed.period),
                    seed.session_start.map(|t| t.timestamp()),
                ],
            )?;
        }

        let Some(retained) = retained else {
            tx.commit()?;
            return Ok(report);
        };

        let existing: Vec<(String, String, String)> = {
            let mut stmt =
                tx.prepare("SELECT scope, ident, detail FROM baselines WHERE kind = ?1")?;
            let rows = stmt.query_map(params![kind.as_str()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            let collected = rows.collect::<std::result::Result<Vec<_>, _>>()?;
            collected
        };

        for (scope, ident, detail) in existing {
            let reported = seeds.iter().map(|s| &s.key).chain(retained).any(|key| {
                let (_, k_scope, k_ident, k_detail) = key.columns();
                k_scope == scope && k_ident == ident && k_detail == detail
            });
            if !reported {
                report.removed += tx.execute(
                    "DELETE FROM baselines
                     WHERE kind = ?1 AND scope = ?2 AND ident = ?3 AND detail = ?4",
                    params![kind.as_str(), scope, ident, detail],
                )?;
            }
        }

        tx.commit()?;
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------------

    /// Delete daily buckets dated before `cutoff`
    pub fn purge_daily_before(&mut self, cutoff: NaiveDate) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM daily_buckets WHERE date < ?1",
            params![date_to_db(cutoff)],
        )?;
        Ok(deleted)
    }

    /// Keep only `current` and the month before it
    pub fn prune_months(&mut self, current: MonthKey) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM monthly_buckets WHERE month NOT IN (?1, ?2)",
            params![current.to_string(), current.previous().to_string()],
        )?;
        Ok(deleted)
    }

    // ------------------------------------------------------------------------
    // Connection history
    // ------------------------------------------------------------------------

    /// Insert or grow sessions keyed by (client, connected_since), keeping at
    /// most `cap` rows (oldest inserted go first)
    pub fn record_connections(
        &mut self,
        entries: &[ConnectionLogEntry],
        cap: u32,
    ) -> Result<HistoryReport> {
        let tx = self.conn.transaction()?;
        let mut report = HistoryReport::default();

        for entry in entries {
            let since = entry.connected_since.timestamp();
            let existing: Option<(i64, i64, i64)> = tx
                .query_row(
                    "SELECT id, received, sent FROM connection_log
                     WHERE client = ?1 AND connected_since = ?2",
                    params![entry.client, since],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            match existing {
                None => {
                    tx.execute(
                        "INSERT INTO connection_log
                         (client, local_ip, real_ip, connected_since, received, sent, protocol)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            entry.client,
                            entry.local_ip,
                            entry.real_ip,
                            since,
                            to_db(entry.received),
                            to_db(entry.sent),
                            entry.protocol,
                        ],
                    )?;
                    report.inserted += 1;
                }
                Some((id, received, sent)) => {
                    // A read racing the writer may report less; never shrink
                    let grow_received = entry.received.saturating_sub(from_db(received));
                    let grow_sent = entry.sent.saturating_sub(from_db(sent));
                    if grow_received > 0 || grow_sent > 0 {
                        tx.execute(
                            "UPDATE connection_log
                             SET received = received + ?1, sent = sent + ?2
                             WHERE id = ?3",
                            params![to_db(grow_received), to_db(grow_sent), id],
                        )?;
                        report.updated += 1;
                    }
                }
            }

            report.evicted += tx.execute(
                "DELETE FROM connection_log WHERE id NOT IN (
                     SELECT id FROM connection_log ORDER BY id DESC LIMIT ?1
                 )",
                params![cap],
            )?;
        }

        tx.commit()?;
        Ok(report)
    }

    pub fn connection_count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM connection_log", [], |row| row.get(0))?;
        Ok(from_db(n))
    }

    // ------------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------------

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO ledger_meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM ledger_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }
}

fn set_meta_tx(tx: &Transaction<'_>, key: &str, value: &str) -> Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO ledger_meta (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

fn apply_commit(tx: &Transaction<'_>, commit: &Commit) -> Result<()> {
    let baseline = &commit.baseline;
    let (kind, scope, ident, detail) = baseline.key.columns();

    tx.execute(
        "INSERT INTO baselines
         (kind, scope, ident, detail, last_received, last_sent, period, session_start)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT (kind, scope, ident, detail) DO UPDATE SET
             last_received = excluded.last_received,
             last_sent = excluded.last_sent,
             period = excluded.period,
             session_start = excluded.session_start",
        params![
            kind,
            scope,
            ident,
            detail,
            to_db(baseline.last_received),
            to_db(baseline.last_sent),
            date_to_db(baseline.period),
            baseline.session_start.map(|t| t.timestamp()),
        ],
    )?;

    let Some(bucket) = &commit.bucket else {
        return Ok(());
    };

    tx.execute(
        "INSERT INTO daily_buckets (date, kind, scope, ident, detail, client, received, sent)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT (date, kind, scope, ident, detail) DO UPDATE SET
             client = excluded.client,
             received = received + excluded.received,
             sent = sent + excluded.sent",
        params![
            date_to_db(bucket.date),
            kind,
            scope,
            ident,
            detail,
            bucket.client,
            to_db(bucket.delta.received),
            to_db(bucket.delta.sent),
        ],
    )?;

    tx.execute(
        "INSERT INTO monthly_buckets
         (kind, client, month, total_received, total_sent, observations, last_connected)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
         ON CONFLICT (kind, client, month) DO UPDATE SET
             total_received = total_received + excluded.total_received,
             total_sent = total_sent + excluded.total_sent,
             observations = observations + 1,
             last_connected = MAX(last_connected, excluded.last_connected)",
        params![
            kind,
            bucket.client,
            bucket.month.to_string(),
            to_db(bucket.delta.received),
            to_db(bucket.delta.sent),
            bucket.connected_at.timestamp(),
        ],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_710_000_000 + secs, 0).unwrap()
    }

    fn commit(key: &EntityKey, received: u64, sent: u64, delta: Delta, date: NaiveDate) -> Commit {
        Commit {
            baseline: Baseline {
                key: key.clone(),
                last_received: received,
                last_sent: sent,
                period: date,
                session_start: None,
            },
            bucket: Some(BucketWrite {
                date,
                month: MonthKey::of(date),
                client: "alice".into(),
                delta,
                connected_at: at(0),
            }),
        }
    }

    fn entry(client: &str, since: i64, received: u64) -> ConnectionLogEntry {
        ConnectionLogEntry {
            client: client.into(),
            local_ip: "10.8.0.2".into(),
            real_ip: "203.0.113.7".into(),
            connected_since: at(since),
            received,
            sent: received / 2,
            protocol: "UDP".into(),
        }
    }

    #[test]
    fn test_commit_upserts_baseline_and_buckets() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        let key = EntityKey::peer("wg0", "pk1");

        ledger.commit(&commit(&key, 100, 10, Delta::new(100, 10), day(5))).unwrap();
        ledger.commit(&commit(&key, 150, 30, Delta::new(50, 20), day(5))).unwrap();

        let base = ledger.baseline(&key).unwrap().unwrap();
        assert_eq!((base.last_received, base.last_sent), (150, 30));

        let daily = ledger.daily_buckets(day(5)).unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!((daily[0].received, daily[0].sent), (150, 30));

        let monthly = ledger.monthly_buckets().unwrap();
        assert_eq!(monthly.len(), 1);
        assert_eq!(monthly[0].observations, 2);
        assert_eq!(monthly[0].total_received, 150);
    }

    #[test]
    fn test_commit_without_bucket_only_moves_baseline() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        let key = EntityKey::peer("wg0", "idle");
        let mut c = commit(&key, 7, 7, Delta::ZERO, day(5));
        c.bucket = None;
        ledger.commit(&c).unwrap();

        assert!(ledger.baseline(&key).unwrap().is_some());
        assert!(ledger.daily_buckets(day(5)).unwrap().is_empty());
        assert!(ledger.monthly_buckets().unwrap().is_empty());
    }

    #[test]
    fn test_rollover_marks_all_baselines() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        let a = EntityKey::peer("wg0", "a");
        let b = EntityKey::peer("wg0", "b");
        ledger.commit(&commit(&a, 1, 1, Delta::new(1, 1), day(5))).unwrap();

        let marked = ledger
            .rollover(&[commit(&b, 2, 2, Delta::new(2, 2), day(5))], day(6))
            .unwrap();
        assert_eq!(marked, 2);
        assert_eq!(ledger.current_period().unwrap(), Some(day(6)));
        assert_eq!(ledger.baseline(&a).unwrap().unwrap().period, day(6));
        assert_eq!(ledger.get_meta(META_LAST_ROLLOVER).unwrap().as_deref(), Some("2024-03-06"));
        // The final commit is still credited to the closing day
        assert_eq!(ledger.daily_buckets(day(5)).unwrap().len(), 2);
    }

    #[test]
    fn test_sync_seeds_and_removes() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        let stale = EntityKey::peer("wg0", "gone");
        let kept = EntityKey::peer("wg0", "kept");
        let session = EntityKey::session("UDP", "bob", "10.8.0.3");
        ledger.commit(&commit(&stale, 5, 5, Delta::new(5, 5), day(5))).unwrap();
        ledger.commit(&commit(&kept, 9, 9, Delta::new(9, 9), day(5))).unwrap();
        ledger.commit(&commit(&session, 9, 9, Delta::new(9, 9), day(5))).unwrap();

        let fresh = EntityKey::peer("wg1", "new");
        let seeds = vec![
            Baseline::zero(kept.clone(), day(5), None),
            Baseline::zero(fresh.clone(), day(5), None),
        ];
        let report = ledger
            .sync_baselines(SourceKind::WireGuard, &seeds, Some(&[][..]))
            .unwrap();
        assert_eq!(report, SyncReport { seeded: 1, removed: 1 });

        // Existing counters are not reset by seeding
        assert_eq!(ledger.baseline(&kept).unwrap().unwrap().last_received, 9);
        assert_eq!(ledger.baseline(&fresh).unwrap().unwrap().last_received, 0);
        assert!(ledger.baseline(&stale).unwrap().is_none());
        // Other kinds are untouched
        assert!(ledger.baseline(&session).unwrap().is_some());
    }

    #[test]
    fn test_sync_keeps_retained_and_can_skip_removal() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        let garbled = EntityKey::peer("wg0", "garbled");
        let stale = EntityKey::peer("wg0", "gone");
        ledger.commit(&commit(&garbled, 7, 7, Delta::new(7, 7), day(5))).unwrap();
        ledger.commit(&commit(&stale, 5, 5, Delta::new(5, 5), day(5))).unwrap();

        // Retained keys are neither deleted nor seeded
        let report = ledger
            .sync_baselines(SourceKind::WireGuard, &[], Some(&[garbled.clone()][..]))
            .unwrap();
        assert_eq!(report, SyncReport { seeded: 0, removed: 1 });
        assert_eq!(ledger.baseline(&garbled).unwrap().unwrap().last_received, 7);
        assert!(ledger.baseline(&stale).unwrap().is_none());

        // Without a retained set nothing is removed, seeds still land
        let fresh = EntityKey::peer("wg0", "new");
        let seeds = vec![Baseline::zero(fresh.clone(), day(5), None)];
        let report = ledger.sync_baselines(SourceKind::WireGuard, &seeds, None).unwrap();
        assert_eq!(report, SyncReport { seeded: 1, removed: 0 });
        assert!(ledger.baseline(&garbled).unwrap().is_some());
        assert!(ledger.baseline(&fresh).unwrap().is_some());
    }

    #[test]
    fn test_purge_daily_before_cutoff() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        let key = EntityKey::peer("wg0", "a");
        for d in 1..=10 {
            ledger.commit(&commit(&key, d as u64, 0, Delta::new(1, 0), day(d))).unwrap();
        }
        let deleted = ledger.purge_daily_before(day(4)).unwrap();
        assert_eq!(deleted, 3);
        assert!(ledger.daily_buckets(day(3)).unwrap().is_empty());
        assert_eq!(ledger.daily_buckets(day(4)).unwrap().len(), 1);
    }

    #[test]
    fn test_prune_months_keeps_two() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        let key = EntityKey::peer("wg0", "a");
        for m in 1..=4 {
            let date = NaiveDate::from_ymd_opt(2024, m, 1).unwrap();
            ledger.commit(&commit(&key, m as u64, 0, Delta::new(1, 0), date)).unwrap();
        }
        let deleted = ledger.prune_months(MonthKey { year: 2024, month: 4 }).unwrap();
        assert_eq!(deleted, 2);
        let months: Vec<String> = ledger
            .monthly_buckets()
            .unwrap()
            .iter()
            .map(|b| b.month.to_string())
            .collect();
        assert_eq!(months, vec!["2024-04", "2024-03"]);
    }

    #[test]
    fn test_connection_log_dedup_and_growth() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        let report = ledger.record_connections(&[entry("alice", 0, 2048)], 100).unwrap();
        assert_eq!(report.inserted, 1);

        let report = ledger.record_connections(&[entry("alice", 0, 4096)], 100).unwrap();
        assert_eq!(report, HistoryReport { inserted: 0, updated: 1, evicted: 0 });

        // A smaller read never shrinks the row
        ledger.record_connections(&[entry("alice", 0, 1000)], 100).unwrap();

        let rows = ledger.connection_history(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].received, 4096);
    }

    #[test]
    fn test_connection_log_cap_evicts_oldest() {
        let mut ledger = Ledger::open_in_memory().unwrap();
        let entries: Vec<_> = (0..130).map(|i| entry("c", i, 1)).collect();
        let report = ledger.record_connections(&entries, 100).unwrap();
        assert_eq!(report.inserted, 130);
        assert_eq!(report.evicted, 30);
        assert_eq!(ledger.connection_count().unwrap(), 100);

        let newest = ledger.connection_history(1).unwrap();
        assert_eq!(newest[0].connected_since, at(129));
    }

    #[test]
    fn test_metadata() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.set_meta("k", "v").unwrap();
        assert_eq!(ledger.get_meta("k").unwrap(), Some("v".to_string()));
        assert_eq!(ledger.get_meta("missing").unwrap(), None);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("tally.db");
        let key = EntityKey::peer("wg0", "a");
        {
            let mut ledger = Ledger::open_at(&path).unwrap();
            ledger.commit(&commit(&key, 5000, 200, Delta::new(5000, 200), day(5))).unwrap();
        }
        let ledger = Ledger::open_at(&path).unwrap();
        let base = ledger.baseline(&key).unwrap().unwrap();
        assert_eq!((base.last_received, base.last_sent), (5000, 200));
    }
}
