//! TZID resolution.
//!
//! Servers reference zones by TZID, which is usually an IANA name but can be
//! anything the client that wrote the event chose. Resolution order:
//!
//! 1. the TZID itself as an IANA name
//! 2. `X-LIC-LOCATION` of the matching VTIMEZONE
//! 3. trailing path segments (`/mozilla.org/20050126_1/Europe/Berlin`)
//! 4. well-known Windows zone names
//! 5. the VTIMEZONE's own STANDARD/DAYLIGHT offset rules
//! 6. UTC, with a warning

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc, Weekday};
use icalendar::parser::Component;
use tracing::warn;

use crate::recurrence::RecurrenceRule;

/// A zone an event time can be interpreted in.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedZone {
    Iana(chrono_tz::Tz),
    /// Offsets taken from an unrecognized VTIMEZONE definition
    Custom(CustomZone),
    Utc,
}

impl ResolvedZone {
    /// Convert a wall-clock time in this zone to UTC.
    ///
    /// Times falling in a DST gap are shifted forward by the gap.
    pub fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        match self {
            ResolvedZone::Iana(tz) => {
                if let Some(dt) = tz.from_local_datetime(&local).earliest() {
                    return dt.with_timezone(&Utc);
                }
                tz.from_local_datetime(&(local + Duration::hours(1)))
                    .earliest()
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|| local.and_utc())
            }
            ResolvedZone::Custom(zone) => local.and_utc() - Duration::seconds(zone.offset_at(local).into()),
            ResolvedZone::Utc => local.and_utc(),
        }
    }

    /// IANA name to store on the event, if any.
    pub fn iana_name(&self) -> Option<String> {
        match self {
            ResolvedZone::Iana(tz) => Some(tz.name().to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomZone {
    pub tzid: String,
    pub observances: Vec<Observance>,
}

/// One STANDARD or DAYLIGHT block.
#[derive(Debug, Clone, PartialEq)]
pub struct Observance {
    pub dtstart: NaiveDateTime,
    /// Seconds east of UTC before the onset
    pub offset_from: i32,
    /// Seconds east of UTC from the onset on
    pub offset_to: i32,
    /// Month and BYDAY of the yearly onset, when the block recurs
    pub yearly: Option<(u32, i8, Weekday)>,
}

impl Observance {
    /// Onset of this block in `year`, if it applies that year.
    fn onset_in_year(&self, year: i32) -> Option<NaiveDateTime> {
        if year < self.dtstart.year() {
            return None;
        }
        match self.yearly {
            None => Some(self.dtstart),
            Some((month, nth, weekday)) => {
                nth_weekday(year, month, nth, weekday).map(|date| date.and_time(self.dtstart.time()))
            }
        }
    }
}

impl CustomZone {
    /// UTC offset in seconds in effect at a wall-clock time.
    pub fn offset_at(&self, local: NaiveDateTime) -> i32 {
        let latest = self
            .observances
            .iter()
            .flat_map(|obs| {
                [local.year(), local.year() - 1]
                    .into_iter()
                    .filter_map(move |year| obs.onset_in_year(year).map(|onset| (onset, obs)))
            })
            .filter(|(onset, _)| *onset <= local)
            .max_by_key(|(onset, _)| *onset);

        match latest {
            Some((_, obs)) => obs.offset_to,
            None => self
                .observances
                .iter()
                .min_by_key(|obs| obs.dtstart)
                .map(|obs| obs.offset_from)
                .unwrap_or(0),
        }
    }
}

/// Resolves TZIDs against the VTIMEZONE blocks of one calendar document.
#[derive(Debug, Default)]
pub struct TimezoneResolver {
    definitions: HashMap<String, VTimezone>,
}

#[derive(Debug, Clone)]
struct VTimezone {
    location: Option<String>,
    zone: CustomZone,
}

impl TimezoneResolver {
    pub fn from_components(components: &[Component<'_>]) -> Self {
        let definitions = components
            .iter()
            .filter(|c| c.name == "VTIMEZONE")
            .filter_map(parse_vtimezone)
            .map(|tz| (tz.zone.tzid.clone(), tz))
            .collect();
        TimezoneResolver { definitions }
    }

    pub fn resolve(&self, tzid: &str) -> ResolvedZone {
        let tzid = tzid.trim_matches('"');
        if let Some(tz) = lookup_iana(tzid) {
            return ResolvedZone::Iana(tz);
        }

        let definition = self.definitions.get(tzid);
        if let Some(tz) = definition
            .and_then(|d| d.location.as_deref())
            .and_then(lookup_iana)
        {
            return ResolvedZone::Iana(tz);
        }

        if let Some(tz) = from_path_segments(tzid).or_else(|| from_windows_name(tzid)) {
            return ResolvedZone::Iana(tz);
        }

        if let Some(definition) = definition
            && !definition.zone.observances.is_empty()
        {
            return ResolvedZone::Custom(definition.zone.clone());
        }

        warn!(tzid = %tzid, "Unknown timezone, treating times as UTC");
        ResolvedZone::Utc
    }
}

fn lookup_iana(name: &str) -> Option<chrono_tz::Tz> {
    name.parse::<chrono_tz::Tz>().ok()
}

/// Try the last two and three `/`-separated segments as an IANA name.
fn from_path_segments(tzid: &str) -> Option<chrono_tz::Tz> {
    let segments: Vec<&str> = tzid.split('/').filter(|s| !s.is_empty()).collect();
    [3usize, 2]
        .into_iter()
        .filter(|n| segments.len() >= *n)
        .find_map(|n| lookup_iana(&segments[segments.len() - n..].join("/")))
}

fn from_windows_name(tzid: &str) -> Option<chrono_tz::Tz> {
    let iana = match tzid {
        "UTC" | "Coordinated Universal Time" => "UTC",
        "GMT Standard Time" => "Europe/London",
        "W. Europe Standard Time" => "Europe/Berlin",
        "Romance Standard Time" => "Europe/Paris",
        "Central Europe Standard Time" => "Europe/Budapest",
        "Central European Standard Time" => "Europe/Warsaw",
        "E. Europe Standard Time" => "Europe/Chisinau",
        "FLE Standard Time" => "Europe/Kiev",
        "GTB Standard Time" => "Europe/Bucharest",
        "Russian Standard Time" => "Europe/Moscow",
        "Eastern Standard Time" => "America/New_York",
        "Central Standard Time" => "America/Chicago",
        "Mountain Standard Time" => "America/Denver",
        "US Mountain Standard Time" => "America/Phoenix",
        "Pacific Standard Time" => "America/Los_Angeles",
        "Alaskan Standard Time" => "America/Anchorage",
        "Hawaiian Standard Time" => "Pacific/Honolulu",
        "Atlantic Standard Time" => "America/Halifax",
        "E. South America Standard Time" => "America/Sao_Paulo",
        "India Standard Time" => "Asia/Kolkata",
        "China Standard Time" => "Asia/Shanghai",
        "Singapore Standard Time" => "Asia/Singapore",
        "Tokyo Standard Time" => "Asia/Tokyo",
        "Korea Standard Time" => "Asia/Seoul",
        "AUS Eastern Standard Time" => "Australia/Sydney",
        "New Zealand Standard Time" => "Pacific/Auckland",
        _ => return None,
    };
    lookup_iana(iana)
}

fn parse_vtimezone(component: &Component<'_>) -> Option<VTimezone> {
    let tzid = component.find_prop("TZID")?.val.to_string();
    let location = component
        .find_prop("X-LIC-LOCATION")
        .map(|p| p.val.to_string());
    let observances = component
        .components
        .iter()
        .filter(|c| c.name == "STANDARD" || c.name == "DAYLIGHT")
        .filter_map(parse_observance)
        .collect();
    Some(VTimezone {
        location,
        zone: CustomZone { tzid, observances },
    })
}

fn parse_observance(component: &Component<'_>) -> Option<Observance> {
    let dtstart = NaiveDateTime::parse_from_str(
        component.find_prop("DTSTART")?.val.as_ref(),
        "%Y%m%dT%H%M%S",
    )
    .ok()?;
    let offset_to = parse_offset(component.find_prop("TZOFFSETTO")?.val.as_ref())?;
    let offset_from = component
        .find_prop("TZOFFSETFROM")
        .and_then(|p| parse_offset(p.val.as_ref()))
        .unwrap_or(offset_to);
    let yearly = component
        .find_prop("RRULE")
        .and_then(|p| p.val.as_ref().parse::<RecurrenceRule>().ok())
        .and_then(|rule| {
            let month = u32::from(*rule.by_month.first()?);
            let day = rule.by_day.first()?;
            Some((month, day.ordinal.unwrap_or(1), day.weekday))
        });
    Some(Observance {
        dtstart,
        offset_from,
        offset_to,
        yearly,
    })
}

/// Parse `+HHMM`, `-HHMM` or `+HHMMSS` into seconds east of UTC.
fn parse_offset(value: &str) -> Option<i32> {
    let value = value.trim();
    let (sign, digits) = match value.as_bytes().first()? {
        b'+' => (1, &value[1..]),
        b'-' => (-1, &value[1..]),
        _ => (1, value),
    };
    if !(digits.len() == 4 || digits.len() == 6) || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[0..2].parse().ok()?;
    let minutes: i32 = digits[2..4].parse().ok()?;
    let seconds: i32 = if digits.len() == 6 { digits[4..6].parse().ok()? } else { 0 };
    Some(sign * (hours * 3600 + minutes * 60 + seconds))
}

/// The `nth` weekday of a month; negative counts from the end.
fn nth_weekday(year: i32, month: u32, nth: i8, weekday: Weekday) -> Option<NaiveDate> {
    if nth > 0 {
        NaiveDate::from_weekday_of_month_opt(year, month, weekday, nth.unsigned_abs())
    } else {
        let first_next = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)?
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)?
        };
        let last = first_next.pred_opt()?;
        let back = (7 + last.weekday().num_days_from_monday() - weekday.num_days_from_monday()) % 7;
        let last_match = last - Duration::days(back.into());
        Some(last_match - Duration::weeks(i64::from(nth.unsigned_abs()) - 1))
    }
}
