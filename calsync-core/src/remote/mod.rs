//! Interface to a remote calendar server.
//!
//! The sync engine only talks to servers through [`CalendarRemote`]. The
//! CalDAV client in `calsync-caldav` is the production implementation; tests
//! drive the engine against an in-memory server.

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::date_range::DateRange;

/// Failure of a single protocol operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DavError {
    /// Network failure, timeout, 5xx or throttling. Worth retrying later.
    #[error("transient server error: {0}")]
    Transient(String),

    /// Validation, authentication or other rejection that a retry won't fix.
    #[error("request rejected: {0}")]
    Permanent(String),

    /// The supplied etag no longer matches the server's copy.
    #[error("etag mismatch on {0}")]
    Conflict(String),

    /// A conditional create found the resource already present.
    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    /// The sync token is no longer accepted; a full resync is required.
    #[error("sync token expired")]
    TokenExpired,

    /// The server answered with something we could not interpret.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl DavError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DavError::Transient(_))
    }
}

pub type DavResult<T> = Result<T, DavError>;

/// A calendar collection as listed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCalendar {
    pub href: String,
    pub name: String,
    pub color: Option<String>,
    pub ctag: Option<String>,
    /// Supported component kinds (VEVENT, VTODO, ...). Empty when the server doesn't say.
    pub components: Vec<String>,
}

impl RemoteCalendar {
    pub fn supports_events(&self) -> bool {
        self.components.is_empty() || self.components.iter().any(|c| c == "VEVENT")
    }
}

/// A resource href with its current etag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTag {
    pub href: String,
    pub etag: String,
}

/// A fetched calendar object resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub href: String,
    pub etag: String,
    pub data: String,
}

/// Result of a sync-collection REPORT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeReport {
    pub changed: Vec<ResourceTag>,
    pub deleted: Vec<String>,
    pub new_token: Option<String>,
}

/// Operations the sync engine needs from a calendar server.
pub trait CalendarRemote: Send + Sync {
    fn discover_principal(&self) -> impl Future<Output = DavResult<String>> + Send;

    fn discover_calendar_homes(
        &self,
        principal: &str,
    ) -> impl Future<Output = DavResult<Vec<String>>> + Send;

    fn list_calendars(
        &self,
        home: &str,
    ) -> impl Future<Output = DavResult<Vec<RemoteCalendar>>> + Send;

    fn get_ctag(&self, calendar: &str) -> impl Future<Output = DavResult<Option<String>>> + Send;

    fn get_sync_token(
        &self,
        calendar: &str,
    ) -> impl Future<Output = DavResult<Option<String>>> + Send;

    /// Changes since `token`. Fails with [`DavError::TokenExpired`] when the
    /// server no longer recognizes it.
    fn sync_collection(
        &self,
        calendar: &str,
        token: &str,
    ) -> impl Future<Output = DavResult<ChangeReport>> + Send;

    /// Etags of every event resource overlapping `range`.
    fn list_etags(
        &self,
        calendar: &str,
        range: &DateRange,
    ) -> impl Future<Output = DavResult<Vec<ResourceTag>>> + Send;

    /// Bodies of the given resources. Hrefs the server doesn't return are omitted.
    fn fetch_resources(
        &self,
        calendar: &str,
        hrefs: &[String],
    ) -> impl Future<Output = DavResult<Vec<Resource>>> + Send;

    /// Create a resource that must not exist yet. Returns the new etag if the server sent one.
    fn create_resource(
        &self,
        href: &str,
        body: &str,
    ) -> impl Future<Output = DavResult<Option<String>>> + Send;

    /// Replace a resource whose current etag must be `etag`.
    fn update_resource(
        &self,
        href: &str,
        body: &str,
        etag: &str,
    ) -> impl Future<Output = DavResult<Option<String>>> + Send;

    /// Delete a resource. A resource that is already gone counts as deleted.
    fn delete_resource(
        &self,
        href: &str,
        etag: Option<&str>,
    ) -> impl Future<Output = DavResult<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(DavError::Transient("503".into()).is_transient());
        assert!(!DavError::Permanent("401".into()).is_transient());
        assert!(!DavError::Conflict("/a.ics".into()).is_transient());
        assert!(!DavError::TokenExpired.is_transient());
    }

    #[test]
    fn test_calendar_without_component_list_accepts_events() {
        let mut cal = RemoteCalendar {
            href: "/cal/".into(),
            name: "Home".into(),
            color: None,
            ctag: None,
            components: vec![],
        };
        assert!(cal.supports_events());
        cal.components = vec!["VTODO".into()];
        assert!(!cal.supports_events());
    }
}
