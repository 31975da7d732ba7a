//! Aggregation of resolved deltas into daily and monthly buckets.

use crate::resolver::Resolution;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tally_common::clock::{WallClock, ZoneSetting};
use tally_common::ledger::{BucketWrite, Commit, Ledger};
use tally_common::{MonthKey, RawSnapshot, Result};
use tracing::info;

/// Rows removed by one retention pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub daily_purged: usize,
    pub months_pruned: usize,
}

pub struct Aggregator {
    zone: ZoneSetting,
    daily_days: u32,
}

impl Aggregator {
    pub fn new(zone: ZoneSetting, daily_days: u32) -> Self {
        Self { zone, daily_days }
    }

    pub fn zone(&self) -> &ZoneSetting {
        &self.zone
    }

    /// Build the atomic write for one resolved snapshot, crediting `date`.
    ///
    /// Buckets are only touched when there is traffic to add or the entity
    /// is connected; an idle, offline entity just moves its baseline.
    pub fn plan(&self, snap: &RawSnapshot, resolution: &Resolution, date: NaiveDate) -> Commit {
        let bucket = (!resolution.delta.is_zero() || snap.online).then(|| BucketWrite {
            date,
            month: MonthKey::of(date),
            client: snap.client.clone(),
            delta: resolution.delta,
            connected_at: snap.connected_at(),
        });

        Commit {
            baseline: resolution.baseline.clone(),
            bucket,
        }
    }

    /// First date that survives daily retention
    pub fn daily_cutoff(&self, now: DateTime<Utc>) -> NaiveDate {
        self.zone.date_of(now) - Duration::days(i64::from(self.daily_days))
    }

    /// Purge old daily rows and every month but the current and previous one
    pub fn retention_pass(&self, ledger: &mut Ledger, now: DateTime<Utc>) -> Result<RetentionReport> {
        let cutoff = self.daily_cutoff(now);
        let month = MonthKey::of(self.zone.date_of(now));

        let report = RetentionReport {
            daily_purged: ledger.purge_daily_before(cutoff)?,
            months_pruned: ledger.prune_months(month)?,
        };

        if report.daily_purged > 0 {
            info!("Purged {} daily rows older than {}", report.daily_purged, cutoff);
        }
        if report.months_pruned > 0 {
            info!("Pruned {} monthly rows outside {} and {}", report.months_pruned, month, month.previous());
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::resolve;
    use chrono::TimeZone;
    use tally_common::{Delta, EntityKey};

    fn snap(received: u64, online: bool) -> RawSnapshot {
        RawSnapshot {
            key: EntityKey::peer("wg0", "P"),
            client: "alice".into(),
            received,
            sent: 0,
            observed_at: Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap(),
            session_start: None,
            last_handshake: None,
            online,
        }
    }

    #[test]
    fn test_plan_skips_idle_offline() {
        let agg = Aggregator::new(ZoneSetting::Utc, 7);
        let date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let s = snap(100, false);
        let prev = resolve(None, &s, date).baseline;

        let idle = resolve(Some(&prev), &s, date);
        assert!(agg.plan(&s, &idle, date).bucket.is_none());

        let online = snap(100, true);
        let commit = agg.plan(&online, &resolve(Some(&prev), &online, date), date);
        assert_eq!(commit.bucket.unwrap().delta, Delta::ZERO);

        let grown = snap(150, false);
        let commit = agg.plan(&grown, &resolve(Some(&prev), &grown, date), date);
        assert_eq!(commit.bucket.unwrap().delta, Delta::new(50, 0));
    }

    #[test]
    fn test_daily_cutoff() {
        let agg = Aggregator::new(ZoneSetting::Utc, 7);
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(agg.daily_cutoff(now), NaiveDate::from_ymd_opt(2024, 3, 3).unwrap());
    }
}
