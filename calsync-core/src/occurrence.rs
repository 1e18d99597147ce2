//! Materialized occurrences of events on the timeline.
//!
//! Every master owns one occurrence row per expanded instance. Exceptions
//! never add rows of their own: linking one rewrites the matching row in
//! place, so a master with N instances always has exactly N rows.

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::date_range::DateRange;
use crate::error::CalSyncResult;
use crate::event::{Event, EventData, EventId};
use crate::recurrence::{self, InstanceSpan};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    /// Master owning this instance
    pub event_id: EventId,
    /// Event whose content applies: the overriding exception, else the master
    pub effective_event_id: EventId,
    /// Instance start generated by the master's rule
    pub instance_time: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Local day of `start`, as days since 0001-01-01
    pub start_day: i32,
    /// Local day of the last moment covered by the occurrence
    pub end_day: i32,
    pub cancelled: bool,
}

impl Occurrence {
    fn from_span(master: &Event, span: &InstanceSpan) -> Self {
        let (start_day, end_day) = day_codes(&master.data, span.start, span.end);
        Occurrence {
            event_id: master.id,
            effective_event_id: master.id,
            instance_time: span.instance_time,
            start: span.start,
            end: span.end,
            start_day,
            end_day,
            cancelled: false,
        }
    }

    /// Whether this occurrence covers any part of days `[first_day, last_day]`.
    pub fn touches_days(&self, first_day: i32, last_day: i32) -> bool {
        self.start_day <= last_day && self.end_day >= first_day
    }

    fn reset_to_master(&mut self, master: &Event) {
        let start = self.instance_time;
        let end = start + master.data.duration();
        let (start_day, end_day) = day_codes(&master.data, start, end);
        self.effective_event_id = master.id;
        self.start = start;
        self.end = end;
        self.start_day = start_day;
        self.end_day = end_day;
        self.cancelled = false;
    }
}

/// Day code of a calendar date, as used by `start_day`/`end_day`.
pub fn day_number(date: chrono::NaiveDate) -> i32 {
    date.num_days_from_ce()
}

/// Compute start/end day codes in the event's own zone.
///
/// All-day ends are already the last second of their final day; timed events
/// ending exactly at midnight don't touch the following day.
fn day_codes(data: &EventData, start: DateTime<Utc>, end: DateTime<Utc>) -> (i32, i32) {
    let last = if data.all_day || end <= start {
        end.max(start)
    } else {
        end - Duration::seconds(1)
    };
    match data.zone() {
        Some(tz) => (
            day_number(start.with_timezone(&tz).date_naive()),
            day_number(last.with_timezone(&tz).date_naive()),
        ),
        None => (day_number(start.date_naive()), day_number(last.date_naive())),
    }
}

/// Rebuild every occurrence of `master` from scratch within `window`.
///
/// Exceptions are not applied; callers relink them afterwards with
/// [`link_exception`].
pub fn regenerate_occurrences(
    master: &Event,
    window: &DateRange,
    max_instances: u16,
) -> CalSyncResult<Vec<Occurrence>> {
    let spans = recurrence::expand(&master.data, window, max_instances)?;
    Ok(spans
        .iter()
        .map(|span| Occurrence::from_span(master, span))
        .collect())
}

/// Regenerate the occurrences of `master` and apply all of its `exceptions`.
pub fn materialize(
    master: &Event,
    exceptions: &[Event],
    window: &DateRange,
    max_instances: u16,
) -> CalSyncResult<Vec<Occurrence>> {
    let mut occurrences = regenerate_occurrences(master, window, max_instances)?;
    for exception in exceptions {
        link_exception(&mut occurrences, master, exception);
    }
    Ok(occurrences)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// The occurrence now uses the exception's times and content.
    Linked,
    /// The occurrence is marked cancelled.
    Cancelled,
    /// No occurrence matches the exception's instance time.
    Unmatched,
}

/// Apply `exception` to the occurrence whose instance time it overrides.
///
/// Applying the same exception again leaves the rows unchanged.
pub fn link_exception(
    occurrences: &mut [Occurrence],
    master: &Event,
    exception: &Event,
) -> LinkOutcome {
    let Some(instance_time) = exception.original_instance_time() else {
        return LinkOutcome::Unmatched;
    };
    let Some(occurrence) = occurrences
        .iter_mut()
        .find(|o| o.event_id == master.id && o.instance_time == instance_time)
    else {
        warn!(
            uid = %master.uid(),
            instance = %instance_time,
            "Exception does not match any expanded instance"
        );
        return LinkOutcome::Unmatched;
    };

    if exception.is_cancelled() {
        occurrence.reset_to_master(master);
        occurrence.effective_event_id = exception.id;
        occurrence.cancelled = true;
        return LinkOutcome::Cancelled;
    }

    let (start_day, end_day) = day_codes(&exception.data, exception.data.start, exception.data.end);
    occurrence.effective_event_id = exception.id;
    occurrence.start = exception.data.start;
    occurrence.end = exception.data.end;
    occurrence.start_day = start_day;
    occurrence.end_day = end_day;
    occurrence.cancelled = false;
    LinkOutcome::Linked
}

/// Restore the occurrence at `instance_time` to the master's generated instance.
///
/// Returns false when no such occurrence exists.
pub fn unlink_exception(
    occurrences: &mut [Occurrence],
    master: &Event,
    instance_time: DateTime<Utc>,
) -> bool {
    match occurrences
        .iter_mut()
        .find(|o| o.event_id == master.id && o.instance_time == instance_time)
    {
        Some(occurrence) => {
            occurrence.reset_to_master(master);
            true
        }
        None => false,
    }
}
