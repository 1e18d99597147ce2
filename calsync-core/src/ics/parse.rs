//! ICS parsing using the icalendar crate's parser.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use icalendar::{
    CalendarDateTime, DatePerhapsTime,
    parser::{Component, Property, read_calendar, unfold},
};

use crate::error::{CalSyncError, CalSyncResult};
use crate::event::{EventData, EventStatus};
use crate::ics::document_components;
use crate::ics::group::{EventGroup, ParseIssue, group_components};
use crate::ics::timezone::TimezoneResolver;

/// Result of parsing one calendar object resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedCalendar {
    pub groups: Vec<EventGroup>,
    pub issues: Vec<ParseIssue>,
}

impl ParsedCalendar {
    pub fn failure_count(&self) -> usize {
        self.issues.iter().filter(|i| i.is_failure()).count()
    }
}

/// Parse ICS content into UID groups of masters and exceptions.
///
/// Only a document that can't be read at all is an error. Individual VEVENTs
/// that fail to parse are skipped and reported in `issues`.
pub fn parse_calendar(content: &str) -> CalSyncResult<ParsedCalendar> {
    let unfolded = unfold(content);
    let calendar = read_calendar(&unfolded).map_err(|e| CalSyncError::IcsParse(e.to_string()))?;
    if !calendar
        .components
        .iter()
        .any(|c| c.name == "VCALENDAR" || c.name == "VEVENT")
    {
        return Err(CalSyncError::IcsParse("No calendar data in document".into()));
    }
    let components = document_components(&calendar.components);
    let resolver = TimezoneResolver::from_components(components);

    let mut parsed = Vec::new();
    let mut issues = Vec::new();
    for vevent in components.iter().filter(|c| c.name == "VEVENT") {
        match parse_vevent(vevent, &resolver) {
            Ok(data) => parsed.push(data),
            Err(reason) => issues.push(ParseIssue::InvalidComponent {
                uid: vevent.find_prop("UID").map(|p| p.val.to_string()),
                reason,
            }),
        }
    }

    let (groups, group_issues) = group_components(parsed);
    issues.extend(group_issues);
    Ok(ParsedCalendar { groups, issues })
}

/// A DTSTART/DTEND/RECURRENCE-ID value converted to UTC.
#[derive(Debug, Clone)]
struct ParsedTime {
    instant: DateTime<Utc>,
    date_only: bool,
    /// IANA zone the value was written in
    zone: Option<String>,
}

fn parse_vevent(vevent: &Component<'_>, resolver: &TimezoneResolver) -> Result<EventData, String> {
    let uid = vevent
        .find_prop("UID")
        .map(|p| p.val.to_string())
        .filter(|uid| !uid.is_empty())
        .ok_or("missing UID")?;
    let summary = vevent
        .find_prop("SUMMARY")
        .map(|p| p.val.to_string())
        .unwrap_or_else(|| "(No title)".to_string());

    let start = vevent
        .find_prop("DTSTART")
        .ok_or("missing DTSTART")
        .and_then(|p| parse_time(p, resolver).ok_or("unreadable DTSTART"))?;
    let dtend = match vevent.find_prop("DTEND") {
        Some(p) => Some(parse_time(p, resolver).ok_or("unreadable DTEND")?),
        None => None,
    };
    let duration = match vevent.find_prop("DURATION") {
        Some(p) => Some(parse_duration(p.val.as_ref()).ok_or("unreadable DURATION")?),
        None => None,
    };

    let end = if start.date_only {
        // iCalendar all-day ends are exclusive; store the last second of the final day
        let exclusive = match (&dtend, duration) {
            (Some(end), _) => end.instant,
            (None, Some(d)) => start.instant + d,
            (None, None) => start.instant + Duration::days(1),
        };
        let exclusive = if exclusive <= start.instant {
            start.instant + Duration::days(1)
        } else {
            exclusive
        };
        exclusive - Duration::seconds(1)
    } else {
        let end = match (&dtend, duration) {
            (Some(end), _) => end.instant,
            (None, Some(d)) => start.instant + d,
            (None, None) => start.instant,
        };
        end.max(start.instant)
    };

    let recurrence_id = match vevent.find_prop("RECURRENCE-ID") {
        Some(p) => Some(parse_time(p, resolver).ok_or("unreadable RECURRENCE-ID")?.instant),
        None => None,
    };

    let status = vevent
        .find_prop("STATUS")
        .map(|p| match p.val.as_ref() {
            "TENTATIVE" => EventStatus::Tentative,
            "CANCELLED" => EventStatus::Cancelled,
            _ => EventStatus::Confirmed,
        })
        .unwrap_or(EventStatus::Confirmed);

    let sequence = vevent
        .find_prop("SEQUENCE")
        .and_then(|p| p.val.as_ref().trim().parse().ok())
        .unwrap_or(0);

    let updated = vevent
        .find_prop("LAST-MODIFIED")
        .and_then(|p| parse_time(p, resolver))
        .map(|t| t.instant);

    let rrule = vevent.find_prop("RRULE").map(|p| p.val.to_string());
    let exdates = multi_valued_times(vevent, "EXDATE", resolver);
    let rdates = multi_valued_times(vevent, "RDATE", resolver);

    // Custom X- properties (preserved for round-tripping provider-specific data)
    let custom_properties = vevent
        .properties
        .iter()
        .filter(|p| p.name.as_ref().starts_with("X-"))
        .map(|p| (p.name.to_string(), p.val.to_string()))
        .collect();

    Ok(EventData {
        uid,
        summary,
        description: vevent.find_prop("DESCRIPTION").map(|p| p.val.to_string()),
        location: vevent.find_prop("LOCATION").map(|p| p.val.to_string()),
        start: start.instant,
        end,
        all_day: start.date_only,
        timezone: start.zone,
        status,
        rrule,
        rdates,
        exdates,
        recurrence_id,
        sequence,
        updated,
        custom_properties,
    })
}

fn parse_time(prop: &Property<'_>, resolver: &TimezoneResolver) -> Option<ParsedTime> {
    let parsed = match DatePerhapsTime::try_from(prop).ok()? {
        DatePerhapsTime::Date(date) => ParsedTime {
            instant: midnight(date),
            date_only: true,
            zone: None,
        },
        DatePerhapsTime::DateTime(CalendarDateTime::Utc(dt)) => ParsedTime {
            instant: dt,
            date_only: false,
            zone: None,
        },
        // Floating times are taken as UTC
        DatePerhapsTime::DateTime(CalendarDateTime::Floating(naive)) => ParsedTime {
            instant: naive.and_utc(),
            date_only: false,
            zone: None,
        },
        DatePerhapsTime::DateTime(CalendarDateTime::WithTimezone { date_time, tzid }) => {
            let zone = resolver.resolve(&tzid);
            ParsedTime {
                instant: zone.to_utc(date_time),
                date_only: false,
                zone: zone.iana_name(),
            }
        }
    };
    Some(parsed)
}

/// Collect every value of a repeatable date list property (EXDATE, RDATE).
///
/// Handles:
/// - TZID parameter: `EXDATE;TZID=America/New_York:20240108T100000`
/// - VALUE=DATE: `EXDATE;VALUE=DATE:20240108`
/// - UTC: `EXDATE:20240108T100000Z`
/// - Comma-separated values: `EXDATE;TZID=...:20240108T100000,20240115T100000`
/// - PERIOD values (`RDATE;VALUE=PERIOD:...Z/PT1H`), keeping only the start
fn multi_valued_times(
    vevent: &Component<'_>,
    name: &str,
    resolver: &TimezoneResolver,
) -> Vec<DateTime<Utc>> {
    let mut times: Vec<DateTime<Utc>> = vevent
        .properties
        .iter()
        .filter(|p| p.name == name)
        .flat_map(|prop| parse_time_list(prop, resolver))
        .collect();
    times.sort();
    times.dedup();
    times
}

fn parse_time_list(prop: &Property<'_>, resolver: &TimezoneResolver) -> Vec<DateTime<Utc>> {
    let zone = prop
        .params
        .iter()
        .find(|p| p.key == "TZID")
        .and_then(|p| p.val.as_ref().map(|v| resolver.resolve(v.as_ref())));

    let is_date = prop
        .params
        .iter()
        .any(|p| p.key == "VALUE" && p.val.as_ref().map(|v| v.as_ref()) == Some("DATE"));

    prop.val
        .as_ref()
        .split(',')
        .filter_map(|s| {
            let s = s.trim();
            let s = s.split_once('/').map_or(s, |(start, _)| start);
            if s.is_empty() {
                return None;
            }
            if is_date || s.len() == 8 {
                return NaiveDate::parse_from_str(s, "%Y%m%d").ok().map(midnight);
            }
            if let Some(utc) = s.strip_suffix('Z') {
                return NaiveDateTime::parse_from_str(utc, "%Y%m%dT%H%M%S")
                    .ok()
                    .map(|dt| dt.and_utc());
            }
            let local = NaiveDateTime::parse_from_str(s, "%Y%m%dT%H%M%S").ok()?;
            Some(match &zone {
                Some(zone) => zone.to_utc(local),
                None => local.and_utc(),
            })
        })
        .collect()
}

/// Parse an ISO 8601 DURATION value; negative durations count as zero.
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let negative = value.starts_with('-');
    let duration = iso8601::duration(value.trim_start_matches(['-', '+'])).ok()?;
    let std_duration: std::time::Duration = duration.into();
    if negative {
        return Some(Duration::zero());
    }
    Duration::from_std(std_duration).ok()
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}
