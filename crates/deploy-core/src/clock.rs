//! Clock and time-window helpers.
//!
//! Every function takes `now` explicitly; nothing here reads the system
//! clock. Weekly boundaries are computed against a fixed numeric UTC offset,
//! never the host timezone, so two callers anywhere agree on the same instant
//! and local daylight-saving changes have no effect.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

const MS_PER_SECOND: u64 = 1_000;
const MS_PER_MINUTE: u64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: u64 = 60 * MS_PER_MINUTE;
const MS_PER_DAY: u64 = 24 * MS_PER_HOUR;

/// Time elapsed since a start stamp. All fields are totals, not components.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Elapsed {
    pub whole_minutes: u64,
    pub whole_seconds: u64,
    pub total_ms: u64,
}

impl Elapsed {
    pub fn from_ms(total_ms: u64) -> Self {
        Self {
            whole_minutes: total_ms / MS_PER_MINUTE,
            whole_seconds: total_ms / MS_PER_SECOND,
            total_ms,
        }
    }
}

/// A non-negative duration split into day/hour/minute components.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Countdown {
    pub days: u64,
    pub hours: u64,
    pub minutes: u64,
    pub total_ms: u64,
}

impl Countdown {
    pub fn from_ms(total_ms: u64) -> Self {
        Self {
            days: total_ms / MS_PER_DAY,
            hours: (total_ms % MS_PER_DAY) / MS_PER_HOUR,
            minutes: (total_ms % MS_PER_HOUR) / MS_PER_MINUTE,
            total_ms,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.total_ms == 0
    }
}

/// Drop sub-millisecond precision; stored start stamps are whole milliseconds.
pub fn truncate_to_millis(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_nanosecond(t.nanosecond() / 1_000_000 * 1_000_000)
        .unwrap_or(t)
}

/// Non-negative milliseconds from `start` to `now`.
pub(crate) fn ms_between(start: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    u64::try_from((now - start).num_milliseconds()).unwrap_or(0)
}

/// `now - start`, clamped to zero when `start` lies in the future.
pub fn elapsed_since(start: DateTime<Utc>, now: DateTime<Utc>) -> Elapsed {
    Elapsed::from_ms(ms_between(start, now))
}

/// Time since a reference event; zero when there was none.
pub fn time_since(reference: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Countdown {
    match reference {
        Some(at) => Countdown::from_ms(ms_between(at, now)),
        None => Countdown::default(),
    }
}

/// A recurring weekday/time in a fixed UTC offset, e.g. Sunday 00:01 UTC+10.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyBoundary {
    pub weekday: Weekday,
    pub time: NaiveTime,
    /// Offset of the reference timezone from UTC, in minutes.
    pub offset_minutes: i32,
}

impl Default for WeeklyBoundary {
    fn default() -> Self {
        Self {
            weekday: Weekday::Sun,
            time: NaiveTime::from_hms_opt(0, 1, 0).unwrap_or_default(),
            offset_minutes: 600,
        }
    }
}

impl WeeklyBoundary {
    /// First boundary strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.naive_utc() + Duration::minutes(i64::from(self.offset_minutes));
        let days_ahead = (i64::from(self.weekday.num_days_from_monday())
            - i64::from(local.weekday().num_days_from_monday()))
        .rem_euclid(7);
        let mut candidate = (local.date() + Duration::days(days_ahead)).and_time(self.time);
        if candidate <= local {
            candidate += Duration::days(7);
        }
        now + (candidate - local)
    }

    /// Most recent boundary at or before `now`.
    pub fn last_at_or_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.next_after(now) - Duration::days(7)
    }
}

/// Time left until the next weekly boundary. At the exact boundary instant
/// the next occurrence is a full week away, never zero.
pub fn time_until_weekly_boundary(now: DateTime<Utc>, boundary: &WeeklyBoundary) -> Countdown {
    Countdown::from_ms(ms_between(now, boundary.next_after(now)))
}

/// Start of the weekly window containing `now`; scopes quota queries.
pub fn start_of_current_week(now: DateTime<Utc>, boundary: &WeeklyBoundary) -> DateTime<Utc> {
    boundary.last_at_or_before(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    #[test]
    fn elapsed_clamps_future_start() {
        let now = utc(2024, 5, 1, 12, 0, 0);
        let e = elapsed_since(now + Duration::seconds(30), now);
        assert_eq!(e, Elapsed::default());
    }

    #[test]
    fn elapsed_reports_totals() {
        let start = utc(2024, 5, 1, 12, 0, 0);
        let e = elapsed_since(start, start + Duration::milliseconds(125_500));
        assert_eq!(e.total_ms, 125_500);
        assert_eq!(e.whole_seconds, 125);
        assert_eq!(e.whole_minutes, 2);
    }

    #[test]
    fn truncation_keeps_whole_millis() {
        let t = utc(2024, 6, 13, 12, 0, 0) + Duration::nanoseconds(1_234_567);
        let cut = truncate_to_millis(t);
        assert_eq!(cut, utc(2024, 6, 13, 12, 0, 0) + Duration::milliseconds(1));
        assert_eq!(truncate_to_millis(cut), cut);
    }

    #[test]
    fn time_since_none_is_zero() {
        let now = utc(2024, 5, 1, 12, 0, 0);
        assert!(time_since(None, now).is_zero());
        let c = time_since(Some(now - Duration::hours(26) - Duration::minutes(5)), now);
        assert_eq!((c.days, c.hours, c.minutes), (1, 2, 5));
    }

    #[test]
    fn default_boundary_is_saturday_1401_utc() {
        // 2024-06-08 is a Saturday; Sunday 00:01 at UTC+10 is Saturday 14:01Z.
        let b = WeeklyBoundary::default();
        let now = utc(2024, 6, 8, 14, 0, 0);
        assert_eq!(b.next_after(now), utc(2024, 6, 8, 14, 1, 0));
        let c = time_until_weekly_boundary(now, &b);
        assert_eq!(c.total_ms, 60_000);
        assert_eq!((c.days, c.hours, c.minutes), (0, 0, 1));
    }

    #[test]
    fn exact_boundary_gives_full_week() {
        let b = WeeklyBoundary::default();
        let at = utc(2024, 6, 8, 14, 1, 0);
        let c = time_until_weekly_boundary(at, &b);
        assert_eq!(c.days, 7);
        assert_eq!(c.total_ms, 7 * MS_PER_DAY);
        assert_eq!(start_of_current_week(at, &b), at);
    }

    #[test]
    fn week_start_just_after_boundary() {
        let b = WeeklyBoundary::default();
        let now = utc(2024, 6, 12, 3, 0, 0); // Wednesday
        assert_eq!(start_of_current_week(now, &b), utc(2024, 6, 8, 14, 1, 0));
    }

    #[test]
    fn negative_offset_boundary() {
        let b = WeeklyBoundary {
            weekday: Weekday::Mon,
            time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            offset_minutes: -300,
        };
        // Monday 09:00 at UTC-5 is Monday 14:00Z.
        let now = utc(2024, 6, 10, 13, 0, 0);
        assert_eq!(b.next_after(now), utc(2024, 6, 10, 14, 0, 0));
    }

    #[test]
    fn boundaries_ignore_host_dst() {
        // US clocks change on 2024-03-10; a fixed offset keeps windows exactly 7 days long.
        let b = WeeklyBoundary::default();
        let first = b.next_after(utc(2024, 3, 5, 0, 0, 0));
        let second = b.next_after(first);
        assert_eq!(second - first, Duration::days(7));
    }

    proptest! {
        #[test]
        fn countdown_is_positive_and_at_most_a_week(secs in 0i64..4_000_000_000i64) {
            let now = utc(1970, 1, 1, 0, 0, 0) + Duration::seconds(secs);
            let b = WeeklyBoundary::default();
            let c = time_until_weekly_boundary(now, &b);
            prop_assert!(c.total_ms > 0);
            prop_assert!(c.total_ms <= 7 * MS_PER_DAY);
            let start = start_of_current_week(now, &b);
            prop_assert!(start <= now);
            prop_assert!(now - start < Duration::days(7));
        }

        #[test]
        fn elapsed_is_monotonic(a in 0i64..1_000_000, b in 0i64..1_000_000) {
            let start = utc(2024, 1, 1, 0, 0, 0);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let e1 = elapsed_since(start, start + Duration::milliseconds(lo));
            let e2 = elapsed_since(start, start + Duration::milliseconds(hi));
            prop_assert!(e1.total_ms <= e2.total_ms);
        }
    }
}
