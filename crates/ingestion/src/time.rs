//! Time axis handling for download and assembly ranges.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

use crate::error::{IngestError, Result};

/// A half-open `[start, end)` range of timestamps with a fixed step.
///
/// Invariant: `end >= start`, `step_seconds > 0`, and iteration yields
/// strictly increasing timestamps on the fixed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    step_seconds: i64,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, step_seconds: i64) -> Self {
        assert!(step_seconds > 0, "time step must be positive");
        assert!(end >= start, "time range end before start");
        Self {
            start,
            end,
            step_seconds,
        }
    }

    /// Parse a `YYYYMMDD-YYYYMMDD` interval (inclusive of the last day).
    pub fn parse_interval(interval: &str, step_seconds: i64) -> Result<Self> {
        let bad = || IngestError::InvalidTimeInterval(interval.to_string());
        let (from, to) = interval.split_once('-').ok_or_else(bad)?;
        let from = NaiveDate::parse_from_str(from, "%Y%m%d").map_err(|_| bad())?;
        let to = NaiveDate::parse_from_str(to, "%Y%m%d").map_err(|_| bad())?;
        if to < from {
            return Err(bad());
        }
        let start = Utc.from_utc_datetime(&from.and_hms_opt(0, 0, 0).unwrap());
        let end = Utc.from_utc_datetime(&to.and_hms_opt(0, 0, 0).unwrap()) + Duration::days(1);
        Ok(Self::new(start, end, step_seconds))
    }

    /// The trailing `days` full days up to today 00Z. Default download
    /// window; sized for the typical upstream publication delay.
    pub fn last_days(days: i64, step_seconds: i64, now: DateTime<Utc>) -> Self {
        let today = now.date_naive().and_hms_opt(0, 0, 0).unwrap();
        let end = Utc.from_utc_datetime(&today);
        Self::new(end - Duration::days(days), end, step_seconds)
    }

    /// One calendar year on the given step.
    pub fn year(year: i32, step_seconds: i64) -> Self {
        let start = Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(year + 1, 1, 1, 0, 0, 0).unwrap();
        Self::new(start, end, step_seconds)
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn step_seconds(&self) -> i64 {
        self.step_seconds
    }

    /// Number of steps in the range.
    pub fn count(&self) -> usize {
        let span = (self.end - self.start).num_seconds();
        (span / self.step_seconds) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Shrink the range to end at `at` (used for availability truncation).
    pub fn truncated_at(&self, at: DateTime<Utc>) -> Self {
        Self {
            start: self.start,
            end: at.clamp(self.start, self.end),
            step_seconds: self.step_seconds,
        }
    }

    /// Same span on a different step.
    pub fn with_step(&self, step_seconds: i64) -> Self {
        Self::new(self.start, self.end, step_seconds)
    }

    /// Position of `t` on the step axis, if it lies on it.
    pub fn index_of(&self, t: DateTime<Utc>) -> Option<usize> {
        if t < self.start || t >= self.end {
            return None;
        }
        let offset = (t - self.start).num_seconds();
        (offset % self.step_seconds == 0).then(|| (offset / self.step_seconds) as usize)
    }

    /// Global step indices since the epoch, for archive addressing.
    pub fn index_time(&self) -> std::ops::Range<i64> {
        let t0 = self.start.timestamp() / self.step_seconds;
        t0..t0 + self.count() as i64
    }

    pub fn iter(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        (0..self.count()).map(move |i| self.start + Duration::seconds(i as i64 * self.step_seconds))
    }

    pub fn pretty(&self) -> String {
        format!(
            "{} .. {} (dt {}s)",
            self.start.format("%Y-%m-%d %H:%MZ"),
            self.end.format("%Y-%m-%d %H:%MZ"),
            self.step_seconds
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_interval_inclusive_of_last_day() {
        let range = TimeRange::parse_interval("20220101-20220131", 86_400).unwrap();
        assert_eq!(range.count(), 31);
        assert_eq!(range.start(), Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(range.end(), Utc.with_ymd_and_hms(2022, 2, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn parse_interval_rejects_garbage() {
        assert!(TimeRange::parse_interval("2022_bad", 86_400).is_err());
        assert!(TimeRange::parse_interval("20220131-20220101", 86_400).is_err());
    }

    #[test]
    fn iteration_is_strictly_increasing_on_fixed_step() {
        let range = TimeRange::parse_interval("20220101-20220102", 3_600).unwrap();
        let steps: Vec<_> = range.iter().collect();
        assert_eq!(steps.len(), 48);
        for pair in steps.windows(2) {
            assert_eq!((pair[1] - pair[0]).num_seconds(), 3_600);
        }
    }

    #[test]
    fn last_days_spans_back_from_midnight() {
        let now = Utc.with_ymd_and_hms(2022, 3, 10, 15, 42, 0).unwrap();
        let range = TimeRange::last_days(14, 86_400, now);
        assert_eq!(range.count(), 14);
        assert_eq!(range.end(), Utc.with_ymd_and_hms(2022, 3, 10, 0, 0, 0).unwrap());
    }

    #[test]
    fn index_of_requires_on_step_timestamps() {
        let range = TimeRange::parse_interval("20220101-20220101", 10_800).unwrap();
        let on = Utc.with_ymd_and_hms(2022, 1, 1, 6, 0, 0).unwrap();
        let off = Utc.with_ymd_and_hms(2022, 1, 1, 7, 0, 0).unwrap();
        assert_eq!(range.index_of(on), Some(2));
        assert_eq!(range.index_of(off), None);
    }

    #[test]
    fn truncation_clamps_into_range() {
        let range = TimeRange::parse_interval("20220101-20220110", 86_400).unwrap();
        let day6 = Utc.with_ymd_and_hms(2022, 1, 6, 0, 0, 0).unwrap();
        let truncated = range.truncated_at(day6);
        assert_eq!(truncated.count(), 5);
        assert_eq!(truncated.end(), day6);
    }
}
