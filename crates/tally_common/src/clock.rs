//! Wall-clock handling for day and month boundaries.
//!
//! A period is a calendar date in the configured zone. DST days of 23 or 25
//! hours are still a single date. Converting a local wall-clock time back to
//! an instant picks the earliest instant when the time occurs twice (fold) and
//! the first instant after the gap when it does not occur at all.

use crate::error::{Result, TallyError};
use chrono::{
    DateTime, Duration, FixedOffset, Local, LocalResult, NaiveDate, NaiveDateTime, NaiveTime,
    TimeZone, Utc,
};
use std::fmt;
use std::str::FromStr;

/// Zone used to compute day boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneSetting {
    /// System local zone
    Local,
    Utc,
    Fixed(FixedOffset),
}

impl FromStr for ZoneSetting {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "local" => return Ok(ZoneSetting::Local),
            "utc" | "z" => return Ok(ZoneSetting::Utc),
            _ => {}
        }
        parse_offset(s)
            .map(ZoneSetting::Fixed)
            .ok_or_else(|| TallyError::config(format!("unrecognized timezone '{}'", s)))
    }
}

impl fmt::Display for ZoneSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneSetting::Local => f.write_str("local"),
            ZoneSetting::Utc => f.write_str("utc"),
            ZoneSetting::Fixed(off) => write!(f, "{}", off),
        }
    }
}

/// Parse "+03:00", "-0530", "+3"
fn parse_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 => rest.split_at(2),
        None => (rest, "0"),
    };
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Parse "HH:MM" into a wall-clock time
pub fn parse_wall_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .map_err(|_| TallyError::config(format!("invalid wall-clock time '{}', expected HH:MM", s)))
}

fn pick<T: TimeZone>(result: LocalResult<DateTime<T>>) -> Option<DateTime<Utc>> {
    match result {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

/// Mapping between instants and wall-clock times in one zone.
///
/// Implementors supply the two conversions; the boundary helpers built on
/// top of them carry the fold/gap policy.
pub trait WallClock {
    /// Wall-clock time of an instant
    fn local(&self, at: DateTime<Utc>) -> NaiveDateTime;

    /// Instant for a wall-clock time; `None` when it falls in a DST gap
    fn instant(&self, local: NaiveDateTime) -> Option<DateTime<Utc>>;

    /// Calendar date (period) of an instant
    fn date_of(&self, at: DateTime<Utc>) -> NaiveDate {
        self.local(at).date()
    }

    /// Like `instant`, but a time inside a DST gap moves to the end of the gap
    fn instant_lenient(&self, local: NaiveDateTime) -> DateTime<Utc> {
        let mut wall = local;
        // Gaps are at most a few hours; step minute by minute up to a day
        for _ in 0..(24 * 60) {
            if let Some(at) = self.instant(wall) {
                return at;
            }
            wall += Duration::minutes(1);
        }
        Utc.from_utc_datetime(&local)
    }

    /// Next instant strictly after `now` whose wall-clock time is `at`
    fn next_occurrence(&self, now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
        let mut date = self.date_of(now);
        loop {
            let candidate = self.instant_lenient(date.and_time(at));
            if candidate > now {
                return candidate;
            }
            date = match date.succ_opt() {
                Some(d) => d,
                None => return now + Duration::days(1),
            };
        }
    }
}

impl WallClock for ZoneSetting {
    fn local(&self, at: DateTime<Utc>) -> NaiveDateTime {
        match self {
            ZoneSetting::Local => at.with_timezone(&Local).naive_local(),
            ZoneSetting::Utc => at.naive_utc(),
            ZoneSetting::Fixed(off) => at.with_timezone(off).naive_local(),
        }
    }

    fn instant(&self, local: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            ZoneSetting::Local => pick(Local.from_local_datetime(&local)),
            ZoneSetting::Utc => Some(Utc.from_utc_datetime(&local)),
            ZoneSetting::Fixed(off) => pick(off.from_local_datetime(&local)),
        }
    }
}

/// True when `now` lies in the quiet window between fixation and resumption.
/// The window may wrap around midnight (23:59 -> 00:00).
pub fn in_quiet_window(now: NaiveTime, fix: NaiveTime, resume: NaiveTime) -> bool {
    if fix < resume {
        now >= fix && now < resume
    } else {
        now >= fix || now < resume
    }
}
