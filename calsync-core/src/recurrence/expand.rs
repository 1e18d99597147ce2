//! RRULE expansion for recurring masters.
//!
//! Expands a master into the instance spans that intersect a window. The
//! RRULE itself is evaluated by the `rrule` crate; RDATE and EXDATE lists are
//! applied here on exact UTC instants.

use chrono::{DateTime, Duration, Utc};
use rrule::RRuleSet;

use crate::date_range::DateRange;
use crate::error::{CalSyncError, CalSyncResult};
use crate::event::EventData;
use crate::recurrence::rule::RecurrenceRule;

/// One expanded instance of a master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct InstanceSpan {
    /// Start as generated by the rule; the key exceptions are matched against.
    pub instance_time: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Expand `master` into the ordered, deduplicated spans intersecting `window`.
///
/// A master without RRULE or RDATE yields its own span. At most `max_instances`
/// spans are produced.
pub fn expand(
    master: &EventData,
    window: &DateRange,
    max_instances: u16,
) -> CalSyncResult<Vec<InstanceSpan>> {
    let duration = master.duration();

    let mut starts = match &master.rrule {
        Some(rule) => expand_rule(master, rule, window, duration, max_instances)?,
        None => vec![master.start],
    };
    starts.extend(master.rdates.iter().copied());
    starts.retain(|start| !master.exdates.contains(start));
    starts.sort();
    starts.dedup();

    let spans = starts
        .into_iter()
        .map(|start| InstanceSpan {
            instance_time: start,
            start,
            end: start + duration,
        })
        .filter(|span| window.overlaps(span.start, span.end))
        .take(usize::from(max_instances))
        .collect();

    Ok(spans)
}

/// Build the iCalendar text the `rrule` crate parses.
///
/// Zoned events keep their TZID so the rule steps in wall-clock time across
/// DST changes; everything else is expanded in UTC.
fn build_rrule_string(master: &EventData, rule: &RecurrenceRule) -> String {
    match master.zone() {
        Some(tz) => format!(
            "DTSTART;TZID={}:{}\nRRULE:{}",
            tz.name(),
            master.start.with_timezone(&tz).format("%Y%m%dT%H%M%S"),
            rule.normalized(&tz)
        ),
        None => format!(
            "DTSTART:{}\nRRULE:{}",
            master.start.format("%Y%m%dT%H%M%SZ"),
            rule.normalized(&Utc)
        ),
    }
}

fn expand_rule(
    master: &EventData,
    rule_text: &str,
    window: &DateRange,
    duration: Duration,
    max_instances: u16,
) -> CalSyncResult<Vec<DateTime<Utc>>> {
    let rule: RecurrenceRule = rule_text.parse()?;
    let exhausted = match master.zone() {
        Some(tz) => rule.is_exhausted_before(master.start, &tz),
        None => rule.is_exhausted_before(master.start, &Utc),
    };
    if exhausted {
        return Ok(Vec::new());
    }
    let rrule_str = build_rrule_string(master, &rule);

    let rrule_set: RRuleSet = rrule_str.parse().map_err(|e| {
        CalSyncError::Recurrence(format!(
            "Failed to parse RRULE for event '{}': {}",
            master.uid, e
        ))
    })?;

    // after/before are exclusive; widen by a second, and by the event's
    // duration so instances that started before the window still count.
    let tz: rrule::Tz = Utc.into();
    let after = (window.from - duration - Duration::seconds(1)).with_timezone(&tz);
    let before = (window.to + Duration::seconds(1)).with_timezone(&tz);

    let result = rrule_set.after(after).before(before).all(max_instances);

    Ok(result
        .dates
        .iter()
        .map(|dt| dt.with_timezone(&Utc))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    fn window(from: (i32, u32, u32), to: (i32, u32, u32)) -> DateRange {
        DateRange::new(
            Utc.with_ymd_and_hms(from.0, from.1, from.2, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(to.0, to.1, to.2, 0, 0, 0).unwrap(),
        )
    }

    fn master(start: DateTime<Utc>, minutes: i64, rrule: &str) -> EventData {
        let mut data = EventData::new("rec", "Recurring", start, start + Duration::minutes(minutes));
        data.rrule = Some(rrule.to_string());
        data
    }

    #[test]
    fn test_count_rule_yields_exact_instances_at_fixed_spacing() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let data = master(start, 60, "FREQ=WEEKLY;COUNT=10");
        let spans = expand(&data, &window((2023, 12, 1), (2025, 1, 1)), 1000).unwrap();

        assert_eq!(spans.len(), 10);
        for (i, span) in spans.iter().enumerate() {
            assert_eq!(span.start, start + Duration::weeks(i as i64));
            assert_eq!(span.end - span.start, Duration::hours(1));
        }
    }

    #[test]
    fn test_until_rule_is_inclusive_of_last_instance() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let data = master(start, 30, "FREQ=DAILY;INTERVAL=2;UNTIL=20240111T090000Z");
        let spans = expand(&data, &window((2023, 12, 1), (2025, 1, 1)), 1000).unwrap();

        let days: Vec<u32> = spans.iter().map(|s| s.start.day()).collect();
        assert_eq!(days, vec![1, 3, 5, 7, 9, 11]);
    }

    #[test]
    fn test_exdates_and_rdates_are_applied() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let mut data = master(start, 60, "FREQ=DAILY;COUNT=5");
        data.exdates = vec![start + Duration::days(2)];
        data.rdates = vec![
            Utc.with_ymd_and_hms(2024, 1, 20, 15, 0, 0).unwrap(),
            start + Duration::days(1),
        ];
        let spans = expand(&data, &window((2023, 12, 1), (2025, 1, 1)), 1000).unwrap();

        let starts: Vec<_> = spans.iter().map(|s| (s.start.day(), s.start.hour())).collect();
        assert_eq!(starts, vec![(1, 10), (2, 10), (4, 10), (5, 10), (20, 15)]);
    }

    #[test]
    fn test_monthly_last_friday() {
        let start = Utc.with_ymd_and_hms(2024, 1, 26, 16, 0, 0).unwrap();
        let data = master(start, 60, "FREQ=MONTHLY;BYDAY=-1FR;COUNT=4");
        let spans = expand(&data, &window((2024, 1, 1), (2025, 1, 1)), 1000).unwrap();

        let dates: Vec<_> = spans.iter().map(|s| (s.start.month(), s.start.day())).collect();
        assert_eq!(dates, vec![(1, 26), (2, 23), (3, 29), (4, 26)]);
        assert!(spans.iter().all(|s| s.start.weekday() == Weekday::Fri));
    }

    #[test]
    fn test_zoned_rule_keeps_wall_clock_across_dst() {
        // 09:00 Berlin is 08:00Z before March 31 and 07:00Z after
        let start = Utc.with_ymd_and_hms(2024, 3, 25, 8, 0, 0).unwrap();
        let mut data = master(start, 60, "FREQ=WEEKLY;COUNT=2");
        data.timezone = Some("Europe/Berlin".to_string());

        let spans = expand(&data, &window((2024, 3, 1), (2024, 5, 1)), 1000).unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].start.hour(), 8);
        assert_eq!(spans[1].start, Utc.with_ymd_and_hms(2024, 4, 1, 7, 0, 0).unwrap());
    }

    #[test]
    fn test_date_only_until_keeps_last_evening_west_of_utc() {
        // 20:00 in Los Angeles is 04:00Z the next day
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 4, 0, 0).unwrap();
        let mut data = master(start, 60, "FREQ=DAILY;UNTIL=20240105");
        data.timezone = Some("America/Los_Angeles".to_string());

        let spans = expand(&data, &window((2023, 12, 1), (2024, 2, 1)), 1000).unwrap();
        assert_eq!(spans.len(), 5);
        assert_eq!(spans[4].start, Utc.with_ymd_and_hms(2024, 1, 6, 4, 0, 0).unwrap());
    }

    #[test]
    fn test_until_before_start_yields_nothing_from_rule() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let data = master(start, 30, "FREQ=DAILY;UNTIL=20240101T000000Z");
        let spans = expand(&data, &window((2024, 1, 1), (2025, 1, 1)), 1000).unwrap();
        assert!(spans.is_empty());
    }

    #[test]
    fn test_window_and_cap_bound_open_ended_rules() {
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 12, 0, 0).unwrap();
        let data = master(start, 60, "FREQ=DAILY");
        let spans = expand(&data, &window((2024, 1, 1), (2024, 1, 8)), 1000).unwrap();
        assert_eq!(spans.len(), 7);

        let capped = expand(&data, &window((2024, 1, 1), (2025, 1, 1)), 5).unwrap();
        assert_eq!(capped.len(), 5);
    }

    #[test]
    fn test_non_recurring_master_yields_own_span() {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        let data = EventData::new("single", "Once", start, start + Duration::hours(2));
        let spans = expand(&data, &window((2024, 1, 1), (2025, 1, 1)), 1000).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].instance_time, start);

        let outside = expand(&data, &window((2025, 1, 1), (2026, 1, 1)), 1000).unwrap();
        assert!(outside.is_empty());
    }
}
