//! Delta/reset resolution
//!
//! Pure decision from (baseline, current snapshot) to a non-negative delta and
//! the baseline that replaces it. The external counters are cumulative and
//! restart-prone; there is no reset signal, so a decrease is taken as a reset.
//! Bytes moved between the last poll and a reset cannot be recovered: the
//! post-reset value is credited as the whole delta.

use chrono::NaiveDate;
use tally_common::{Baseline, Delta, RawSnapshot};

/// Which rule produced the delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No baseline yet; everything observed so far is credited
    FirstSeen,
    /// Normal monotonic growth (possibly zero)
    Growth,
    /// A counter went down; the current value is credited in full
    Reset,
    /// Session-keyed entity started a new session; counters are independent
    NewSession,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub delta: Delta,
    pub outcome: Outcome,
    /// Baseline to commit; always the current counters
    pub baseline: Baseline,
}

/// Resolve one snapshot against its stored baseline
pub fn resolve(prev: Option<&Baseline>, snap: &RawSnapshot, period: NaiveDate) -> Resolution {
    let (delta, outcome) = match prev {
        None => (Delta::new(snap.received, snap.sent), Outcome::FirstSeen),
        // A different session start means the stored counters belong to
        // another connection instance
        Some(b) if snap.session_start.is_some() && b.session_start != snap.session_start => {
            (Delta::new(snap.received, snap.sent), Outcome::NewSession)
        }
        Some(b) if snap.received >= b.last_received && snap.sent >= b.last_sent => (
            Delta::new(snap.received - b.last_received, snap.sent - b.last_sent),
            Outcome::Growth,
        ),
        Some(_) => (Delta::new(snap.received, snap.sent), Outcome::Reset),
    };

    Resolution {
        delta,
        outcome,
        baseline: Baseline {
            key: snap.key.clone(),
            last_received: snap.received,
            last_sent: snap.sent,
            period,
            session_start: snap.session_start,
        },
    }
}
