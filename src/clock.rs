//! Time source abstraction.
//!
//! The store and engine read wall-clock time through [`Clock`] so tests can
//! move time forward past a retry or schedule gate without sleeping.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use parking_lot::Mutex;

/// Wall-clock time source.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Start at the current system time, truncated to whole microseconds.
    pub fn new() -> Self {
        Self::starting_at(Utc::now().trunc_subsecs(6))
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: std::time::Duration) {
        let mut now = self.now.lock();
        *now = add_duration(*now, by);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Latest instant with a four-digit year: `9999-12-31T23:59:59.999999Z`.
///
/// Persisted timestamps are compared as text, so nothing later may be stored.
pub fn latest_timestamp() -> DateTime<Utc> {
    DateTime::from_timestamp(253_402_300_799, 999_999_000).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Earliest instant with a four-digit year: `0001-01-01T00:00:00Z`.
pub fn earliest_timestamp() -> DateTime<Utc> {
    DateTime::from_timestamp(-62_135_596_800, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Pull a timestamp into the storable range.
pub fn clamp_timestamp(at: DateTime<Utc>) -> DateTime<Utc> {
    at.clamp(earliest_timestamp(), latest_timestamp())
}

/// Add a std duration to a timestamp, saturating at [`latest_timestamp`].
pub fn add_duration(at: DateTime<Utc>, by: std::time::Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(by)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .map_or_else(latest_timestamp, |t| t.min(latest_timestamp()))
}

/// Subtract a std duration from a timestamp, saturating at [`earliest_timestamp`].
pub fn sub_duration(at: DateTime<Utc>, by: std::time::Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(by)
        .ok()
        .and_then(|d| at.checked_sub_signed(d))
        .map_or_else(earliest_timestamp, |t| t.max(earliest_timestamp()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[test]
    fn manual_clock_advances_shared_time() {
        let clock = ManualClock::new();
        let other = clock.clone();
        let start = clock.now();

        other.advance(Duration::from_secs(300));
        assert_eq!(clock.now() - start, ChronoDuration::seconds(300));
    }

    #[test]
    fn add_duration_saturates_at_four_digit_years() {
        let far = add_duration(Utc::now(), Duration::from_secs(u64::MAX));
        assert_eq!(far, latest_timestamp());

        let beyond = add_duration(Utc::now(), Duration::from_secs(u64::MAX / 4));
        assert_eq!(beyond, latest_timestamp());

        let past = sub_duration(Utc::now(), Duration::from_secs(u64::MAX / 4));
        assert_eq!(past, earliest_timestamp());
    }

    #[test]
    fn timestamp_bounds_have_four_digit_years() {
        assert_eq!(latest_timestamp().to_rfc3339(), "9999-12-31T23:59:59.999999+00:00");
        assert_eq!(earliest_timestamp().to_rfc3339(), "0001-01-01T00:00:00+00:00");

        let year_10000 = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(clamp_timestamp(year_10000), latest_timestamp());
    }
}
