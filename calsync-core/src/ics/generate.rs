//! ICS generation.
//!
//! Zoned times are written as `TZID=<IANA name>` without a VTIMEZONE block.
//! This relies on the server knowing IANA zone names, which iCloud, Google,
//! Nextcloud and Yahoo all do; the parser resolves such TZIDs the same way.

use chrono::{DateTime, Duration, Utc};
use icalendar::{Calendar, Component, EventLike, Property, ValueType};

use crate::constants::PRODID;
use crate::error::{CalSyncError, CalSyncResult};
use crate::event::{EventData, EventStatus};

/// How instants of an event are written.
#[derive(Debug, Clone, Copy)]
enum TimeStyle {
    Date,
    Zoned(chrono_tz::Tz),
    Utc,
}

impl TimeStyle {
    fn of(data: &EventData) -> Self {
        if data.all_day {
            return TimeStyle::Date;
        }
        match data.zone() {
            Some(tz) => TimeStyle::Zoned(tz),
            None => TimeStyle::Utc,
        }
    }

    fn property(self, name: &str, instant: DateTime<Utc>) -> Property {
        match self {
            TimeStyle::Date => {
                let mut prop = Property::new(name, instant.format("%Y%m%d").to_string());
                prop.append_parameter(ValueType::Date);
                prop
            }
            TimeStyle::Zoned(tz) => {
                let local = instant.with_timezone(&tz);
                let mut prop = Property::new(name, local.format("%Y%m%dT%H%M%S").to_string());
                prop.add_parameter("TZID", tz.name());
                prop
            }
            TimeStyle::Utc => Property::new(name, instant.format("%Y%m%dT%H%M%SZ").to_string()),
        }
    }
}

/// Generate one calendar object resource: the master plus its exceptions.
///
/// Exceptions share the master's UID and carry RECURRENCE-ID written in the
/// same form as the master's DTSTART.
pub fn generate_ics(master: &EventData, exceptions: &[EventData]) -> CalSyncResult<String> {
    if master.is_exception() {
        return Err(CalSyncError::IcsGenerate(format!(
            "Event '{}' is an exception, not a master",
            master.import_id()
        )));
    }
    if let Some(stranger) = exceptions
        .iter()
        .find(|e| e.uid != master.uid || e.recurrence_id.is_none())
    {
        return Err(CalSyncError::IcsGenerate(format!(
            "'{}' is not an exception of '{}'",
            stranger.import_id(),
            master.uid
        )));
    }

    let master_style = TimeStyle::of(master);
    let mut cal = Calendar::new();
    cal.push(build_vevent(master, master_style));
    for exception in exceptions {
        cal.push(build_vevent(exception, master_style));
    }
    let cal = cal.done();

    Ok(strip_ics_bloat(&cal.to_string()))
}

/// Build a VEVENT; `series_style` is how the series' instance times are written.
fn build_vevent(data: &EventData, series_style: TimeStyle) -> icalendar::Event {
    let style = TimeStyle::of(data);
    let mut ics_event = icalendar::Event::new();
    ics_event.uid(&data.uid);
    ics_event.summary(&data.summary);

    // DTSTAMP - required by RFC 5545
    let dtstamp = data
        .updated
        .unwrap_or_else(Utc::now)
        .format("%Y%m%dT%H%M%SZ")
        .to_string();
    ics_event.add_property("DTSTAMP", &dtstamp);
    if let Some(updated) = data.updated {
        ics_event.add_property("LAST-MODIFIED", updated.format("%Y%m%dT%H%M%SZ").to_string());
    }
    if data.sequence > 0 {
        ics_event.add_property("SEQUENCE", data.sequence.to_string());
    }

    ics_event.append_property(style.property("DTSTART", data.start));
    let end = if data.all_day {
        // Back to the exclusive iCalendar form
        data.end + Duration::seconds(1)
    } else {
        data.end
    };
    ics_event.append_property(style.property("DTEND", end));

    if let Some(recurrence_id) = data.recurrence_id {
        ics_event.append_property(series_style.property("RECURRENCE-ID", recurrence_id));
    }

    if let Some(ref desc) = data.description {
        ics_event.description(desc);
    }
    if let Some(ref loc) = data.location {
        ics_event.location(loc);
    }

    // Status - only emit if not CONFIRMED (the implied default)
    match data.status {
        EventStatus::Confirmed => {}
        EventStatus::Tentative => {
            ics_event.add_property("STATUS", "TENTATIVE");
        }
        EventStatus::Cancelled => {
            ics_event.add_property("STATUS", "CANCELLED");
        }
    }

    if let Some(ref rrule) = data.rrule {
        ics_event.add_property("RRULE", rrule);
    }
    for exdate in &data.exdates {
        ics_event.append_multi_property(style.property("EXDATE", *exdate));
    }
    for rdate in &data.rdates {
        ics_event.append_multi_property(style.property("RDATE", *rdate));
    }

    for (key, value) in &data.custom_properties {
        ics_event.append_multi_property(Property::new(key, value));
    }

    ics_event.done()
}

/// Clean up ICS output from the icalendar crate
/// - Replace PRODID with ours
/// - Remove CALSCALE:GREGORIAN (it's the default)
fn strip_ics_bloat(ics: &str) -> String {
    let mut result = String::with_capacity(ics.len());
    for line in ics.lines() {
        if line.starts_with("PRODID:") {
            result.push_str("PRODID:");
            result.push_str(PRODID);
            result.push_str("\r\n");
            continue;
        }
        if line == "CALSCALE:GREGORIAN" {
            continue;
        }
        result.push_str(line);
        result.push_str("\r\n");
    }
    result
}
