//! In-memory CalDAV server used by the sync scenarios.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use calsync_core::date_range::DateRange;
use calsync_core::remote::{ChangeReport, RemoteCalendar, Resource, ResourceTag};
use calsync_core::{CalendarRemote, DavError, DavResult};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

#[derive(Debug, Clone)]
struct Change {
    version: u64,
    href: String,
    deleted: bool,
}

#[derive(Debug, Default)]
struct ServerState {
    calendars: Vec<RemoteCalendar>,
    /// href -> (etag, body)
    resources: BTreeMap<String, (String, String)>,
    changes: Vec<Change>,
    version: u64,
    /// Tokens older than this are rejected
    token_floor: u64,
    fail_writes: Option<DavError>,
    write_count: usize,
}

impl ServerState {
    fn record(&mut self, href: &str, deleted: bool) -> u64 {
        self.version += 1;
        self.changes.push(Change {
            version: self.version,
            href: href.to_string(),
            deleted,
        });
        self.version
    }
}

/// Cheap handle to a shared fake server.
#[derive(Debug, Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn with_calendars(hrefs: &[&str]) -> Self {
        let server = FakeServer::default();
        {
            let mut state = server.state.lock();
            for href in hrefs {
                state.calendars.push(RemoteCalendar {
                    href: href.to_string(),
                    name: href.trim_matches('/').rsplit('/').next().unwrap_or("").to_string(),
                    color: None,
                    ctag: None,
                    components: vec!["VEVENT".into()],
                });
            }
            state.calendars.push(RemoteCalendar {
                href: "/dav/tasks/".into(),
                name: "Tasks".into(),
                color: None,
                ctag: None,
                components: vec!["VTODO".into()],
            });
        }
        server
    }

    /// Create or replace a resource as another client would.
    pub fn put(&self, href: &str, body: &str) {
        let mut state = self.state.lock();
        let version = state.record(href, false);
        state
            .resources
            .insert(href.to_string(), (format!("\"{version}\""), body.to_string()));
    }

    pub fn remove(&self, href: &str) {
        let mut state = self.state.lock();
        state.resources.remove(href);
        state.record(href, true);
    }

    /// Drop a resource without it showing up in ctags or change reports.
    pub fn remove_unrecorded(&self, href: &str) {
        self.state.lock().resources.remove(href);
    }

    pub fn expire_tokens(&self) {
        let mut state = self.state.lock();
        state.token_floor = state.version + 1;
    }

    pub fn fail_writes(&self, error: Option<DavError>) {
        self.state.lock().fail_writes = error;
    }

    pub fn body(&self, href: &str) -> Option<String> {
        self.state.lock().resources.get(href).map(|(_, body)| body.clone())
    }

    pub fn etag(&self, href: &str) -> Option<String> {
        self.state.lock().resources.get(href).map(|(etag, _)| etag.clone())
    }

    pub fn hrefs(&self) -> Vec<String> {
        self.state.lock().resources.keys().cloned().collect()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().write_count
    }

    fn check_writable(&self) -> DavResult<()> {
        let mut state = self.state.lock();
        state.write_count += 1;
        match &state.fail_writes {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

impl CalendarRemote for FakeServer {
    async fn discover_principal(&self) -> DavResult<String> {
        Ok("/dav/principals/me/".into())
    }

    async fn discover_calendar_homes(&self, _principal: &str) -> DavResult<Vec<String>> {
        Ok(vec!["/dav/".into()])
    }

    async fn list_calendars(&self, _home: &str) -> DavResult<Vec<RemoteCalendar>> {
        Ok(self.state.lock().calendars.clone())
    }

    async fn get_ctag(&self, calendar: &str) -> DavResult<Option<String>> {
        let state = self.state.lock();
        let last = state
            .changes
            .iter()
            .filter(|c| c.href.starts_with(calendar))
            .map(|c| c.version)
            .max()
            .unwrap_or(0);
        Ok(Some(format!("ctag-{last}")))
    }

    async fn get_sync_token(&self, _calendar: &str) -> DavResult<Option<String>> {
        Ok(Some(format!("tok-{}", self.state.lock().version)))
    }

    async fn sync_collection(&self, calendar: &str, token: &str) -> DavResult<ChangeReport> {
        let state = self.state.lock();
        let since: u64 = token
            .strip_prefix("tok-")
            .and_then(|v| v.parse().ok())
            .ok_or(DavError::TokenExpired)?;
        if since < state.token_floor {
            return Err(DavError::TokenExpired);
        }

        let mut latest: BTreeMap<&str, &Change> = BTreeMap::new();
        for change in state
            .changes
            .iter()
            .filter(|c| c.version > since && c.href.starts_with(calendar))
        {
            latest.insert(change.href.as_str(), change);
        }
        let mut report = ChangeReport {
            new_token: Some(format!("tok-{}", state.version)),
            ..Default::default()
        };
        for (href, change) in latest {
            match state.resources.get(href) {
                Some((etag, _)) if !change.deleted => report.changed.push(ResourceTag {
                    href: href.to_string(),
                    etag: etag.clone(),
                }),
                _ => report.deleted.push(href.to_string()),
            }
        }
        Ok(report)
    }

    async fn list_etags(&self, calendar: &str, _range: &DateRange) -> DavResult<Vec<ResourceTag>> {
        Ok(self
            .state
            .lock()
            .resources
            .iter()
            .filter(|(href, _)| href.starts_with(calendar))
            .map(|(href, (etag, _))| ResourceTag {
                href: href.clone(),
                etag: etag.clone(),
            })
            .collect())
    }

    async fn fetch_resources(&self, _calendar: &str, hrefs: &[String]) -> DavResult<Vec<Resource>> {
        let state = self.state.lock();
        Ok(hrefs
            .iter()
            .filter_map(|href| {
                state.resources.get(href).map(|(etag, body)| Resource {
                    href: href.clone(),
                    etag: etag.clone(),
                    data: body.clone(),
                })
            })
            .collect())
    }

    async fn create_resource(&self, href: &str, body: &str) -> DavResult<Option<String>> {
        self.check_writable()?;
        let mut state = self.state.lock();
        if state.resources.contains_key(href) {
            return Err(DavError::AlreadyExists(href.to_string()));
        }
        let version = state.record(href, false);
        let etag = format!("\"{version}\"");
        state
            .resources
            .insert(href.to_string(), (etag.clone(), body.to_string()));
        Ok(Some(etag))
    }

    async fn update_resource(&self, href: &str, body: &str, etag: &str) -> DavResult<Option<String>> {
        self.check_writable()?;
        let mut state = self.state.lock();
        match state.resources.get(href) {
            None => return Err(DavError::NotFound(href.to_string())),
            Some((current, _)) if current != etag => return Err(DavError::Conflict(href.to_string())),
            Some(_) => {}
        }
        let version = state.record(href, false);
        let etag = format!("\"{version}\"");
        state
            .resources
            .insert(href.to_string(), (etag.clone(), body.to_string()));
        Ok(Some(etag))
    }

    async fn delete_resource(&self, href: &str, etag: Option<&str>) -> DavResult<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        match (state.resources.get(href), etag) {
            (None, _) => return Ok(()),
            (Some((current, _)), Some(expected)) if current != expected => {
                return Err(DavError::Conflict(href.to_string()));
            }
            _ => {}
        }
        state.resources.remove(href);
        state.record(href, true);
        Ok(())
    }
}

/// 10:00 UTC a week from today, so series land inside the default window.
pub fn next_week() -> DateTime<Utc> {
    let today = Utc::now().date_naive();
    (today + Duration::days(7))
        .and_hms_opt(10, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or_else(Utc::now)
}

pub fn stamp(instant: DateTime<Utc>) -> String {
    instant.format("%Y%m%dT%H%M%SZ").to_string()
}

/// One VEVENT with the given extra lines.
pub fn vevent(uid: &str, summary: &str, start: DateTime<Utc>, minutes: i64, extra: &[String]) -> String {
    let mut lines = vec![
        "BEGIN:VEVENT".to_string(),
        format!("UID:{uid}"),
        format!("DTSTAMP:{}", stamp(start)),
        format!("DTSTART:{}", stamp(start)),
        format!("DTEND:{}", stamp(start + Duration::minutes(minutes))),
        format!("SUMMARY:{summary}"),
    ];
    lines.extend(extra.iter().cloned());
    lines.push("END:VEVENT".to_string());
    lines.join("\r\n")
}

pub fn calendar(vevents: &[String]) -> String {
    format!(
        "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//fake//EN\r\n{}\r\nEND:VCALENDAR\r\n",
        vevents.join("\r\n")
    )
}
