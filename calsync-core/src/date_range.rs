//! Sync window for etag enumeration and occurrence materialization.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_SYNC_DAYS;

/// A half-open time window `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl Default for DateRange {
    /// Default range: ±DEFAULT_SYNC_DAYS from now
    fn default() -> Self {
        DateRange::around(Utc::now(), DEFAULT_SYNC_DAYS, DEFAULT_SYNC_DAYS)
    }
}

impl DateRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        DateRange { from, to }
    }

    /// Window spanning `past_days` before and `future_days` after `now`.
    pub fn around(now: DateTime<Utc>, past_days: i64, future_days: i64) -> Self {
        DateRange {
            from: now - Duration::days(past_days),
            to: now + Duration::days(future_days),
        }
    }

    /// Parse `YYYY-MM-DD` bounds; the end date is inclusive.
    pub fn from_dates(from: &str, to: &str) -> Result<Self, String> {
        let from = parse_date(from)?;
        let to = parse_date(to)? + Duration::days(1);
        if to <= from {
            return Err("End date must not be before start date".to_string());
        }
        Ok(DateRange { from, to })
    }

    /// Whether the span `[start, end)` intersects this window.
    ///
    /// Zero-length spans count when they sit inside the window.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        if end <= start {
            return start >= self.from && start < self.to;
        }
        start < self.to && end > self.from
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.from && instant < self.to
    }
}

fn parse_date(s: &str) -> Result<DateTime<Utc>, String> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| format!("Invalid date format '{}'. Expected YYYY-MM-DD", s))?;
    Ok(date.and_time(chrono::NaiveTime::MIN).and_utc())
}
