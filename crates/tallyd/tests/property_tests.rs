//! Property-Based Tests
//!
//! Randomized counter sequences against the resolver, the engine and the
//! connection history. Inputs come from a small xorshift generator so runs
//! are reproducible without extra crates.
//!
//! ## Properties
//!
//! - Monotonic counters: credited deltas sum to the final counter value
//! - Any decrease credits exactly the post-reset value
//! - Re-polling unchanged counters credits nothing
//! - Ledger buckets equal the sum of resolved deltas, resets included
//! - Connection history never exceeds its cap and never duplicates a session

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use std::collections::HashSet;
use tally_common::config::TallyConfig;
use tally_common::{Baseline, Delta, EntityKey, Ledger, RawSnapshot};
use tallyd::adapters::openvpn::SessionRecord;
use tallyd::adapters::StaticSource;
use tallyd::history::ConnectionHistory;
use tallyd::resolver::{resolve, Outcome};
use tallyd::Engine;

// ============================================================================
// TEST HELPERS
// ============================================================================

/// xorshift64
struct TestRng {
    state: u64,
}

impl TestRng {
    fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn next_range(&mut self, min: u64, max: u64) -> u64 {
        if max <= min {
            return min;
        }
        min + (self.next_u64() % (max - min))
    }

    fn chance(&mut self, percent: u64) -> bool {
        self.next_range(0, 100) < percent
    }
}

fn period() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
}

fn snapshot(received: u64, sent: u64) -> RawSnapshot {
    RawSnapshot {
        key: EntityKey::peer("wg0", "UFJPUA=="),
        client: "prop".into(),
        received,
        sent,
        observed_at: start(),
        session_start: None,
        last_handshake: None,
        online: true,
    }
}

// ============================================================================
// RESOLVER
// ============================================================================

mod resolver_properties {
    use super::*;

    #[test]
    fn test_monotonic_deltas_sum_to_final_value() {
        let mut rng = TestRng::new(0x7a11_0001);

        for _ in 0..200 {
            let mut prev: Option<Baseline> = None;
            let (mut rx, mut tx) = (0u64, 0u64);
            let (mut sum_rx, mut sum_tx) = (0u64, 0u64);

            for _ in 0..rng.next_range(1, 50) {
                rx += rng.next_range(0, 1 << 20);
                tx += rng.next_range(0, 1 << 16);
                let r = resolve(prev.as_ref(), &snapshot(rx, tx), period());
                assert_ne!(r.outcome, Outcome::Reset);
                sum_rx += r.delta.received;
                sum_tx += r.delta.sent;
                prev = Some(r.baseline);
            }

            assert_eq!((sum_rx, sum_tx), (rx, tx));
        }
    }

    #[test]
    fn test_decrease_credits_post_reset_value() {
        let mut rng = TestRng::new(0x7a11_0002);

        for _ in 0..500 {
            let old_rx = rng.next_range(1, u64::MAX / 2);
            let old_tx = rng.next_range(0, u64::MAX / 2);
            let prev = resolve(None, &snapshot(old_rx, old_tx), period()).baseline;

            let new_rx = rng.next_range(0, old_rx);
            let new_tx = rng.next_range(0, u64::MAX / 2);
            let r = resolve(Some(&prev), &snapshot(new_rx, new_tx), period());

            assert_eq!(r.outcome, Outcome::Reset);
            assert_eq!(r.delta, Delta::new(new_rx, new_tx));
            assert_eq!(
                (r.baseline.last_received, r.baseline.last_sent),
                (new_rx, new_tx)
            );
        }
    }

    #[test]
    fn test_repoll_is_zero() {
        let mut rng = TestRng::new(0x7a11_0003);

        for _ in 0..500 {
            let snap = snapshot(rng.next_u64(), rng.next_u64());
            let first = resolve(None, &snap, period());
            let again = resolve(Some(&first.baseline), &snap, period());
            assert!(again.delta.is_zero());
            assert_eq!(again.baseline, first.baseline);
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

mod engine_properties {
    use super::*;

    fn wg_output(received: u64, sent: u64) -> String {
        format!(
            "interface: wg0\n  public key: c2VydmVy\n\npeer: UFJPUA==\n  latest handshake: 1 second ago\n  transfer: {} B received, {} B sent\n",
            received, sent
        )
    }

    #[test]
    fn test_ledger_matches_resolved_deltas() {
        let mut rng = TestRng::new(0x7a11_0004);

        for _ in 0..10 {
            let mut config = TallyConfig::default();
            config.clock.timezone = "utc".into();
            let timing = config.validate().unwrap();

            let wg = StaticSource::absent();
            let mut engine = Engine::with_sources(
                Ledger::open_in_memory().unwrap(),
                &config,
                &timing,
                Box::new(wg.clone()),
                Vec::new(),
            );

            let (mut rx, mut tx) = (0u64, 0u64);
            let (mut expect_rx, mut expect_tx) = (0u64, 0u64);
            let mut prev: Option<(u64, u64)> = None;

            for step in 0..rng.next_range(5, 40) {
                if rng.chance(15) {
                    // Interface restarted
                    rx = rng.next_range(0, 4096);
                    tx = rng.next_range(0, 4096);
                } else {
                    rx += rng.next_range(0, 100_000);
                    tx += rng.next_range(0, 10_000);
                }

                match prev {
                    Some((p_rx, p_tx)) if rx >= p_rx && tx >= p_tx => {
                        expect_rx += rx - p_rx;
                        expect_tx += tx - p_tx;
                    }
                    _ => {
                        expect_rx += rx;
                        expect_tx += tx;
                    }
                }
                prev = Some((rx, tx));

                wg.set(wg_output(rx, tx));
                engine
                    .poll_peers(start() + Duration::seconds(30 * step as i64))
                    .unwrap();
            }

            let daily = engine.ledger().daily_buckets(period()).unwrap();
            assert_eq!(daily.len(), 1);
            assert_eq!((daily[0].received, daily[0].sent), (expect_rx, expect_tx));

            let monthly = engine.ledger().monthly_buckets().unwrap();
            assert_eq!(monthly.len(), 1);
            assert_eq!(
                (monthly[0].total_received, monthly[0].total_sent),
                (expect_rx, expect_tx)
            );
        }
    }
}

// ============================================================================
// CONNECTION HISTORY
// ============================================================================

mod history_properties {
    use super::*;

    #[test]
    fn test_cap_and_uniqueness_hold() {
        let mut rng = TestRng::new(0x7a11_0005);
        let clients = ["alice", "bob", "carol", "dave"];

        for _ in 0..10 {
            let cap = rng.next_range(1, 30) as u32;
            let history = ConnectionHistory::new(cap);
            let mut ledger = Ledger::open_in_memory().unwrap();

            for _ in 0..rng.next_range(1, 60) {
                let batch: Vec<SessionRecord> = (0..rng.next_range(1, 6))
                    .map(|_| SessionRecord {
                        protocol: "UDP".into(),
                        client: clients[rng.next_range(0, 4) as usize].to_string(),
                        real_ip: "198.51.100.4:50111".into(),
                        local_ip: "10.8.0.2".into(),
                        received: rng.next_range(0, 1 << 30),
                        sent: rng.next_range(0, 1 << 30),
                        connected_since: start()
                            + Duration::minutes(rng.next_range(0, 20) as i64),
                    })
                    .collect();
                history.record(&mut ledger, &batch).unwrap();

                assert!(ledger.connection_count().unwrap() <= u64::from(cap));
            }

            let rows = ledger.connection_history(1000).unwrap();
            let mut seen = HashSet::new();
            for row in &rows {
                assert!(
                    seen.insert((row.client.clone(), row.connected_since)),
                    "duplicate session {} at {}",
                    row.client,
                    row.connected_since
                );
            }
        }
    }
}
