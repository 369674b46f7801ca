//! Unix Timestamps
//!
//! Wager deadlines are unix seconds on-chain. Domain logic never reads the
//! clock itself; callers pass `now` so deadline checks are reproducible.

use chrono::{DateTime, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch.
pub type UnixSeconds = u64;

/// Seconds in a day.
pub const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Current wall-clock time.
pub fn unix_now() -> UnixSeconds {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `days` after `ts`.
pub fn days_after(ts: UnixSeconds, days: u64) -> UnixSeconds {
    ts.saturating_add(days.saturating_mul(SECONDS_PER_DAY))
}

/// `days` before `ts`, clamped at the epoch.
pub fn days_before(ts: UnixSeconds, days: u64) -> UnixSeconds {
    ts.saturating_sub(days.saturating_mul(SECONDS_PER_DAY))
}

/// Convert to a UTC datetime.
pub fn to_datetime(ts: UnixSeconds) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(i64::try_from(ts).ok()?, 0)
}

/// RFC 3339 rendering, empty for out-of-range values.
pub fn to_rfc3339(ts: UnixSeconds) -> String {
    to_datetime(ts).map(|d| d.to_rfc3339()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_day_arithmetic() {
        assert_eq!(days_after(0, 7), 7 * SECONDS_PER_DAY);
        assert_eq!(days_before(10 * SECONDS_PER_DAY, 7), 3 * SECONDS_PER_DAY);
        assert_eq!(days_before(100, 1), 0);
        assert_eq!(days_after(u64::MAX, 1), u64::MAX);
    }

    #[test]
    fn test_datetime_conversion() {
        let dt = to_datetime(1_700_000_000).unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
        assert_eq!(to_rfc3339(0), "1970-01-01T00:00:00+00:00");
        assert!(to_datetime(u64::MAX).is_none());
    }

    #[test]
    fn test_now_is_after_2020() {
        assert!(unix_now() > 1_577_836_800);
    }
}
