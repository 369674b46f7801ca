//! Activity Records and Qualification
//!
//! Records are fetched transiently from the fitness API and never persisted.
//! Two selection paths exist:
//! - interactive: [`filter_qualifying`] keeps every record at or above the
//!   distance threshold, in API order, for manual selection
//! - automatic: [`find_qualifying_activity`] picks the earliest record meeting
//!   distance, deadline and (optional) type constraints

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::time::{days_before, UnixSeconds};

/// Lookback window for the interactive selection list.
pub const INTERACTIVE_LOOKBACK_DAYS: u64 = 14;

/// Window before the deadline searched by the automatic finder.
pub const FINDER_WINDOW_DAYS: u64 = 7;

/// A workout as returned by the fitness API (summary representation).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Remote identifier.
    pub id: u64,
    /// User-supplied title.
    #[serde(default)]
    pub name: String,
    /// Distance in meters.
    pub distance: f64,
    /// Moving time in seconds.
    #[serde(default)]
    pub moving_time: u64,
    /// Elapsed time in seconds.
    #[serde(default)]
    pub elapsed_time: u64,
    /// Sport type ("Run", "Ride", ...).
    #[serde(rename = "type")]
    pub activity_type: String,
    /// Start time (UTC).
    pub start_date: DateTime<Utc>,
    /// Start time in the athlete's timezone, as sent.
    #[serde(default)]
    pub start_date_local: Option<String>,
}

impl ActivityRecord {
    /// Start time as unix seconds (clamped at the epoch).
    pub fn start_timestamp(&self) -> UnixSeconds {
        u64::try_from(self.start_date.timestamp()).unwrap_or(0)
    }

    /// Distance meets `min_distance` meters.
    pub fn meets_distance(&self, min_distance: f64) -> bool {
        self.distance >= min_distance
    }

    /// Distance in kilometers.
    pub fn distance_km(&self) -> f64 {
        self.distance / 1000.0
    }

    /// Moving time in whole minutes.
    pub fn moving_minutes(&self) -> u64 {
        self.moving_time / 60
    }
}

/// Result of presenting qualifying activities.
#[derive(Clone, Debug, PartialEq)]
pub enum ActivitySelection {
    /// Nothing qualifies. Terminal, not an error.
    Empty,
    /// Qualifying records in API order.
    Choices(Vec<ActivityRecord>),
}

impl ActivitySelection {
    /// Build from a fetched list and a distance threshold.
    pub fn from_activities(activities: &[ActivityRecord], min_distance: f64) -> Self {
        let qualifying = filter_qualifying(activities, min_distance);
        if qualifying.is_empty() {
            ActivitySelection::Empty
        } else {
            ActivitySelection::Choices(qualifying)
        }
    }
}

/// Exactly the records with `distance >= min_distance`, order preserved.
pub fn filter_qualifying(activities: &[ActivityRecord], min_distance: f64) -> Vec<ActivityRecord> {
    activities
        .iter()
        .filter(|a| a.meets_distance(min_distance))
        .cloned()
        .collect()
}

/// Earliest record meeting the distance target, started no later than
/// `deadline`, and matching `activity_type` when given.
pub fn find_qualifying_activity<'a>(
    activities: &'a [ActivityRecord],
    target_distance: f64,
    deadline: UnixSeconds,
    activity_type: Option<&str>,
) -> Option<&'a ActivityRecord> {
    activities
        .iter()
        .filter(|a| a.meets_distance(target_distance))
        .filter(|a| a.start_timestamp() <= deadline)
        .filter(|a| activity_type.map_or(true, |t| a.activity_type == t))
        .min_by_key(|a| a.start_date)
}

/// `after` parameter for an activity listing covering `days` before `now`.
pub fn lookback_start(now: UnixSeconds, days: u64) -> UnixSeconds {
    days_before(now, days)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    pub(crate) fn activity(id: u64, distance: f64, activity_type: &str, start: i64) -> ActivityRecord {
        ActivityRecord {
            id,
            name: format!("Activity {}", id),
            distance,
            moving_time: 1800,
            elapsed_time: 1900,
            activity_type: activity_type.into(),
            start_date: Utc.timestamp_opt(start, 0).unwrap(),
            start_date_local: None,
        }
    }

    #[test]
    fn test_deserialize_strava_summary() {
        let json = r#"{
            "resource_state": 2,
            "id": 154504250376823,
            "name": "Morning Run",
            "distance": 5012.3,
            "moving_time": 1620,
            "elapsed_time": 1700,
            "type": "Run",
            "start_date": "2024-05-01T06:30:00Z",
            "start_date_local": "2024-05-01T08:30:00Z",
            "map": { "summary_polyline": "abc" }
        }"#;

        let record: ActivityRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, 154504250376823);
        assert_eq!(record.activity_type, "Run");
        assert_eq!(record.moving_minutes(), 27);
        assert!((record.distance_km() - 5.0123).abs() < 1e-9);
        assert_eq!(record.start_timestamp(), 1_714_545_000);
    }

    #[test]
    fn test_filter_threshold_inclusive() {
        let list = vec![
            activity(1, 4999.9, "Run", 100),
            activity(2, 5000.0, "Run", 200),
            activity(3, 10000.0, "Ride", 300),
        ];
        let ids: Vec<u64> = filter_qualifying(&list, 5000.0).iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_short_activity_never_qualifies() {
        let list = vec![activity(1, 4800.0, "Run", 100)];
        assert_eq!(ActivitySelection::from_activities(&list, 5000.0), ActivitySelection::Empty);
    }

    #[test]
    fn test_empty_list_is_empty_selection() {
        assert_eq!(ActivitySelection::from_activities(&[], 5000.0), ActivitySelection::Empty);
    }

    #[test]
    fn test_finder_picks_earliest() {
        let list = vec![
            activity(1, 6000.0, "Run", 300),
            activity(2, 5500.0, "Run", 100),
            activity(3, 3000.0, "Run", 50),
        ];
        let found = find_qualifying_activity(&list, 5000.0, 1_000, None).unwrap();
        assert_eq!(found.id, 2);
    }

    #[test]
    fn test_finder_respects_deadline_and_type() {
        let list = vec![
            activity(1, 6000.0, "Ride", 100),
            activity(2, 6000.0, "Run", 2_000),
            activity(3, 6000.0, "Run", 500),
        ];
        assert_eq!(find_qualifying_activity(&list, 5000.0, 1_000, Some("Run")).unwrap().id, 3);
        assert!(find_qualifying_activity(&list, 5000.0, 50, None).is_none());
        assert!(find_qualifying_activity(&list, 5000.0, 10_000, Some("Swim")).is_none());
    }

    #[test]
    fn test_lookback_start() {
        assert_eq!(lookback_start(20 * 86_400, INTERACTIVE_LOOKBACK_DAYS), 6 * 86_400);
    }

    proptest! {
        #[test]
        fn prop_filter_is_exact(
            distances in proptest::collection::vec(0.0f64..20_000.0, 0..40),
            threshold in 0.0f64..20_000.0,
        ) {
            let list: Vec<ActivityRecord> = distances
                .iter()
                .enumerate()
                .map(|(i, d)| activity(i as u64, *d, "Run", i as i64))
                .collect();

            let filtered = filter_qualifying(&list, threshold);

            prop_assert!(filtered.iter().all(|a| a.distance >= threshold));
            let expected: Vec<u64> = list
                .iter()
                .filter(|a| a.distance >= threshold)
                .map(|a| a.id)
                .collect();
            let actual: Vec<u64> = filtered.iter().map(|a| a.id).collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
