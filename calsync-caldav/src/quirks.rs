//! Per-vendor deviations from the CalDAV RFCs.
//!
//! The client asks its [`Quirks`] whenever a server may behave differently
//! from the standard. Nothing else in the crate looks at which vendor it is
//! talking to.

use calsync_core::remote::RemoteCalendar;
use chrono::{DateTime, Utc};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quirks {
    #[default]
    Generic,
    ICloud,
    Google,
    Nextcloud,
    Yahoo,
}

impl Quirks {
    /// Guess the vendor from the server URL.
    pub fn detect(url: &Url) -> Self {
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        if host.ends_with("icloud.com") {
            Quirks::ICloud
        } else if host.ends_with("google.com") || host.ends_with("googleusercontent.com") {
            Quirks::Google
        } else if host.ends_with("yahoo.com") {
            Quirks::Yahoo
        } else if host.contains("nextcloud") || url.path().starts_with("/remote.php/dav") {
            Quirks::Nextcloud
        } else {
            Quirks::Generic
        }
    }

    /// Vendor forced by configuration (`vendor = "nextcloud"`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "generic" | "caldav" => Some(Quirks::Generic),
            "icloud" | "apple" => Some(Quirks::ICloud),
            "google" => Some(Quirks::Google),
            "nextcloud" | "owncloud" => Some(Quirks::Nextcloud),
            "yahoo" => Some(Quirks::Yahoo),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Quirks::Generic => "generic",
            Quirks::ICloud => "icloud",
            Quirks::Google => "google",
            Quirks::Nextcloud => "nextcloud",
            Quirks::Yahoo => "yahoo",
        }
    }

    /// Paths tried, in order, after the configured URL when looking for the principal.
    pub fn discovery_paths(&self) -> &'static [&'static str] {
        match self {
            Quirks::Generic | Quirks::Yahoo => &["/.well-known/caldav", "/"],
            Quirks::ICloud => &["/"],
            Quirks::Google => &["/caldav/v2/"],
            Quirks::Nextcloud => &["/remote.php/dav/", "/.well-known/caldav"],
        }
    }

    /// Whether `getctag` reliably changes with the collection.
    pub fn supports_ctag(&self) -> bool {
        !matches!(self, Quirks::Yahoo)
    }

    /// Whether the sync-collection REPORT can be used.
    pub fn supports_sync_collection(&self) -> bool {
        !matches!(self, Quirks::Yahoo)
    }

    /// Timestamp written into calendar-query time-range filters.
    pub fn format_time_range(&self, instant: DateTime<Utc>) -> String {
        match self {
            // Rejects anything that isn't on a day boundary
            Quirks::Yahoo => instant.format("%Y%m%dT000000Z").to_string(),
            _ => instant.format("%Y%m%dT%H%M%SZ").to_string(),
        }
    }

    /// Headers added to every PROPFIND and REPORT.
    pub fn extra_headers(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Quirks::ICloud | Quirks::Nextcloud => &[("prefer", "return=minimal")],
            Quirks::Generic | Quirks::Google | Quirks::Yahoo => &[],
        }
    }

    /// Whether a failed sync-collection REPORT means the token must be dropped.
    pub fn is_resync_required(&self, status: u16, body: &str) -> bool {
        let invalid_token = body.contains("valid-sync-token");
        match (self, status) {
            (_, 403 | 409) if invalid_token => true,
            (Quirks::Google, 410) => true,
            (Quirks::Nextcloud, 400 | 507) => invalid_token,
            _ => false,
        }
    }

    /// Whether a listed collection should be offered as an event calendar.
    pub fn accepts_calendar(&self, calendar: &RemoteCalendar) -> bool {
        if !calendar.supports_events() {
            return false;
        }
        let href = calendar.href.trim_end_matches('/');
        match self {
            Quirks::Nextcloud => {
                !href.ends_with("/contact_birthdays") && !href.contains("/trashbin")
            }
            Quirks::ICloud => !["/inbox", "/outbox", "/notification"]
                .iter()
                .any(|suffix| href.ends_with(suffix)),
            Quirks::Generic | Quirks::Google | Quirks::Yahoo => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_detect_from_host() {
        assert_eq!(Quirks::detect(&url("https://caldav.icloud.com/")), Quirks::ICloud);
        assert_eq!(
            Quirks::detect(&url("https://apidata.googleusercontent.com/caldav/v2/")),
            Quirks::Google
        );
        assert_eq!(Quirks::detect(&url("https://caldav.calendar.yahoo.com/")), Quirks::Yahoo);
        assert_eq!(
            Quirks::detect(&url("https://cloud.example.org/remote.php/dav/")),
            Quirks::Nextcloud
        );
        assert_eq!(Quirks::detect(&url("https://dav.example.org/")), Quirks::Generic);
    }

    #[test]
    fn test_from_name_round_trips() {
        for quirks in [
            Quirks::Generic,
            Quirks::ICloud,
            Quirks::Google,
            Quirks::Nextcloud,
            Quirks::Yahoo,
        ] {
            assert_eq!(Quirks::from_name(quirks.name()), Some(quirks));
        }
        assert_eq!(Quirks::from_name(" Apple "), Some(Quirks::ICloud));
        assert_eq!(Quirks::from_name("exchange"), None);
    }

    #[test]
    fn test_resync_detection() {
        let body = "<d:error xmlns:d=\"DAV:\"><d:valid-sync-token/></d:error>";
        assert!(Quirks::Generic.is_resync_required(403, body));
        assert!(Quirks::Generic.is_resync_required(409, body));
        assert!(!Quirks::Generic.is_resync_required(403, "forbidden"));
        assert!(!Quirks::Generic.is_resync_required(410, ""));
        assert!(Quirks::Google.is_resync_required(410, ""));
        assert!(Quirks::Nextcloud.is_resync_required(507, body));
    }

    #[test]
    fn test_calendar_filtering() {
        let calendar = |href: &str, components: &[&str]| RemoteCalendar {
            href: href.into(),
            name: "x".into(),
            color: None,
            ctag: None,
            components: components.iter().map(|c| c.to_string()).collect(),
        };

        assert!(!Quirks::Generic.accepts_calendar(&calendar("/cal/tasks/", &["VTODO"])));
        assert!(Quirks::Generic.accepts_calendar(&calendar("/cal/contact_birthdays/", &[])));
        assert!(!Quirks::Nextcloud.accepts_calendar(&calendar(
            "/remote.php/dav/calendars/me/contact_birthdays/",
            &["VEVENT"]
        )));
        assert!(!Quirks::ICloud.accepts_calendar(&calendar("/123/calendars/inbox/", &[])));
        assert!(Quirks::ICloud.accepts_calendar(&calendar("/123/calendars/home/", &["VEVENT"])));
    }

    #[test]
    fn test_time_range_format() {
        let instant = DateTime::parse_from_rfc3339("2025-03-04T10:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(Quirks::Generic.format_time_range(instant), "20250304T103000Z");
        assert_eq!(Quirks::Yahoo.format_time_range(instant), "20250304T000000Z");
    }
}
