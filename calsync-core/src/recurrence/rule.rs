//! RRULE value parsing and validation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc, Weekday};

use crate::error::CalSyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Frequency {
    fn as_str(self) -> &'static str {
        match self {
            Frequency::Daily => "DAILY",
            Frequency::Weekly => "WEEKLY",
            Frequency::Monthly => "MONTHLY",
            Frequency::Yearly => "YEARLY",
        }
    }
}

/// A BYDAY entry such as `MO`, `2TU` or `-1FR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeekdayNum {
    pub ordinal: Option<i8>,
    pub weekday: Weekday,
}

impl fmt::Display for WeekdayNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(n) = self.ordinal {
            write!(f, "{}", n)?;
        }
        f.write_str(weekday_code(self.weekday))
    }
}

/// How a rule terminates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleEnd {
    Never,
    Count(u32),
    Until(UntilValue),
}

/// UNTIL as written: a UTC instant, a floating local time, or a date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UntilValue {
    Utc(DateTime<Utc>),
    Floating(NaiveDateTime),
    Date(NaiveDate),
}

/// A parsed RRULE value.
///
/// Parts this crate doesn't interpret itself (BYSETPOS, WKST, BYHOUR, ...)
/// are kept verbatim so the rule can be handed to the expander unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    pub interval: u32,
    pub end: RuleEnd,
    pub by_day: Vec<WeekdayNum>,
    pub by_month_day: Vec<i8>,
    pub by_month: Vec<u8>,
    pub other: Vec<(String, String)>,
}

impl FromStr for RecurrenceRule {
    type Err = CalSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches("RRULE:");
        let mut frequency = None;
        let mut interval = 1;
        let mut count = None;
        let mut until = None;
        let mut by_day = Vec::new();
        let mut by_month_day = Vec::new();
        let mut by_month = Vec::new();
        let mut other = Vec::new();

        for part in s.split(';').filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| invalid(s, &format!("malformed part '{}'", part)))?;
            match key.to_ascii_uppercase().as_str() {
                "FREQ" => {
                    frequency = Some(match value.to_ascii_uppercase().as_str() {
                        "DAILY" => Frequency::Daily,
                        "WEEKLY" => Frequency::Weekly,
                        "MONTHLY" => Frequency::Monthly,
                        "YEARLY" => Frequency::Yearly,
                        unknown => {
                            return Err(invalid(s, &format!("unsupported frequency {}", unknown)));
                        }
                    })
                }
                "INTERVAL" => {
                    interval = value
                        .parse::<u32>()
                        .ok()
                        .filter(|n| *n >= 1)
                        .ok_or_else(|| invalid(s, "INTERVAL must be a positive integer"))?;
                }
                "COUNT" => {
                    count = Some(
                        value
                            .parse::<u32>()
                            .map_err(|_| invalid(s, "COUNT must be a non-negative integer"))?,
                    );
                }
                "UNTIL" => until = Some(parse_until(value).ok_or_else(|| invalid(s, "bad UNTIL"))?),
                "BYDAY" => {
                    for item in value.split(',') {
                        by_day.push(
                            parse_weekday_num(item)
                                .ok_or_else(|| invalid(s, &format!("bad BYDAY entry '{}'", item)))?,
                        );
                    }
                }
                "BYMONTHDAY" => {
                    for item in value.split(',') {
                        let day = item
                            .parse::<i8>()
                            .ok()
                            .filter(|d| *d != 0 && (-31..=31).contains(d))
                            .ok_or_else(|| invalid(s, &format!("bad BYMONTHDAY '{}'", item)))?;
                        by_month_day.push(day);
                    }
                }
                "BYMONTH" => {
                    for item in value.split(',') {
                        let month = item
                            .parse::<u8>()
                            .ok()
                            .filter(|m| (1..=12).contains(m))
                            .ok_or_else(|| invalid(s, &format!("bad BYMONTH '{}'", item)))?;
                        by_month.push(month);
                    }
                }
                _ => other.push((key.to_ascii_uppercase(), value.to_string())),
            }
        }

        let frequency = frequency.ok_or_else(|| invalid(s, "FREQ is required"))?;

        let end = match (count, until) {
            (Some(_), Some(_)) => return Err(invalid(s, "COUNT and UNTIL are mutually exclusive")),
            (Some(n), None) => RuleEnd::Count(n),
            (None, Some(u)) => RuleEnd::Until(u),
            (None, None) => RuleEnd::Never,
        };

        if matches!(frequency, Frequency::Daily | Frequency::Weekly)
            && by_day.iter().any(|d| d.ordinal.is_some())
        {
            return Err(invalid(
                s,
                "numbered BYDAY is only valid with MONTHLY or YEARLY",
            ));
        }

        Ok(RecurrenceRule {
            frequency,
            interval,
            end,
            by_day,
            by_month_day,
            by_month,
            other,
        })
    }
}

impl RecurrenceRule {
    /// Last allowed instance start, if the rule ends on UNTIL.
    pub fn until_utc<Tz: TimeZone>(&self, zone: &Tz) -> Option<DateTime<Utc>> {
        match &self.end {
            RuleEnd::Until(until) => Some(until_to_utc(until, zone)),
            _ => None,
        }
    }

    /// Whether the rule can't produce any instance after `start`.
    pub fn is_exhausted_before<Tz: TimeZone>(&self, start: DateTime<Utc>, zone: &Tz) -> bool {
        match &self.end {
            RuleEnd::Count(0) => true,
            RuleEnd::Until(_) => self.until_utc(zone).is_some_and(|until| until < start),
            _ => false,
        }
    }

    /// Render the rule with UNTIL converted to a UTC instant.
    ///
    /// Floating UNTIL values are read in `zone`; a date-only
    /// UNTIL covers the whole of that day in `zone`.
    pub fn normalized<Tz: TimeZone>(&self, zone: &Tz) -> String {
        let mut parts = vec![format!("FREQ={}", self.frequency.as_str())];
        if self.interval != 1 {
            parts.push(format!("INTERVAL={}", self.interval));
        }
        match &self.end {
            RuleEnd::Never => {}
            RuleEnd::Count(n) => parts.push(format!("COUNT={}", n)),
            RuleEnd::Until(until) => {
                let utc = until_to_utc(until, zone);
                parts.push(format!("UNTIL={}", utc.format("%Y%m%dT%H%M%SZ")));
            }
        }
        if !self.by_day.is_empty() {
            let days: Vec<String> = self.by_day.iter().map(|d| d.to_string()).collect();
            parts.push(format!("BYDAY={}", days.join(",")));
        }
        if !self.by_month_day.is_empty() {
            let days: Vec<String> = self.by_month_day.iter().map(|d| d.to_string()).collect();
            parts.push(format!("BYMONTHDAY={}", days.join(",")));
        }
        if !self.by_month.is_empty() {
            let months: Vec<String> = self.by_month.iter().map(|m| m.to_string()).collect();
            parts.push(format!("BYMONTH={}", months.join(",")));
        }
        for (key, value) in &self.other {
            parts.push(format!("{}={}", key, value));
        }
        parts.join(";")
    }
}

fn until_to_utc<Tz: TimeZone>(until: &UntilValue, zone: &Tz) -> DateTime<Utc> {
    match until {
        UntilValue::Utc(dt) => *dt,
        UntilValue::Floating(naive) => zone
            .from_local_datetime(naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| naive.and_utc()),
        // The last second of that day in the series' own zone
        UntilValue::Date(date) => {
            let naive = date
                .and_hms_opt(23, 59, 59)
                .unwrap_or_else(|| date.and_time(chrono::NaiveTime::MIN));
            zone.from_local_datetime(&naive)
                .latest()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| naive.and_utc())
        }
    }
}

fn parse_until(value: &str) -> Option<UntilValue> {
    if let Some(stripped) = value.strip_suffix('Z') {
        return NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S")
            .ok()
            .map(|dt| UntilValue::Utc(dt.and_utc()));
    }
    if value.contains('T') {
        return NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
            .ok()
            .map(UntilValue::Floating);
    }
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .ok()
        .map(UntilValue::Date)
}

fn parse_weekday_num(item: &str) -> Option<WeekdayNum> {
    let item = item.trim();
    if item.len() < 2 {
        return None;
    }
    let (num, day) = item.split_at(item.len() - 2);
    let weekday = match day.to_ascii_uppercase().as_str() {
        "MO" => Weekday::Mon,
        "TU" => Weekday::Tue,
        "WE" => Weekday::Wed,
        "TH" => Weekday::Thu,
        "FR" => Weekday::Fri,
        "SA" => Weekday::Sat,
        "SU" => Weekday::Sun,
        _ => return None,
    };
    let ordinal = if num.is_empty() {
        None
    } else {
        let n: i8 = num.trim_start_matches('+').parse().ok()?;
        if n == 0 || !(-53..=53).contains(&n) {
            return None;
        }
        Some(n)
    };
    Some(WeekdayNum { ordinal, weekday })
}

fn weekday_code(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
        Weekday::Sun => "SU",
    }
}

fn invalid(rule: &str, reason: &str) -> CalSyncError {
    CalSyncError::Recurrence(format!("Invalid RRULE '{}': {}", rule, reason))
}
