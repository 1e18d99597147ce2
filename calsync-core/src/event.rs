//! Event rows and their iCalendar content.
//!
//! An [`Event`] is one VEVENT as stored locally. Masters and exceptions share
//! the same `uid`; exceptions carry the instance time they override in
//! `data.recurrence_id` and point at their master through `original_event_id`.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Local primary key of an event row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        EventId(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a synced calendar collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalendarId(pub String);

impl CalendarId {
    pub fn new(id: impl Into<String>) -> Self {
        CalendarId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CalendarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Confirmed,
    Tentative,
    Cancelled,
}

/// Where an event row stands relative to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// Matches the server as of the last pull or push.
    Synced,
    /// Created locally, not yet on the server.
    LocallyCreated,
    /// Edited locally, the server still has the previous version.
    LocallyModified,
    /// Deleted locally, the server still has it.
    LocallyDeleted,
}

/// Content of a single VEVENT, independent of where it is stored.
///
/// All timestamps are UTC instants. All-day events start at UTC midnight and
/// end one second before the UTC midnight following their last day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub uid: String,
    pub summary: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub all_day: bool,
    /// IANA zone the event's wall-clock times belong to; `None` means UTC.
    pub timezone: Option<String>,
    pub status: EventStatus,

    // Recurrence fields
    /// RRULE value, e.g. `FREQ=WEEKLY;COUNT=10`
    pub rrule: Option<String>,
    /// RDATE instants (additional standalone instances)
    pub rdates: Vec<DateTime<Utc>>,
    /// EXDATE instants (removed instances, matched on exact start)
    pub exdates: Vec<DateTime<Utc>>,
    /// RECURRENCE-ID: the instance of the master this component overrides
    pub recurrence_id: Option<DateTime<Utc>>,

    /// Revision sequence number (SEQUENCE)
    pub sequence: i64,
    /// Last modification timestamp (LAST-MODIFIED)
    pub updated: Option<DateTime<Utc>>,

    /// Custom X- properties, preserved for round-tripping back to the server
    pub custom_properties: Vec<(String, String)>,
}

impl EventData {
    pub fn new(
        uid: impl Into<String>,
        summary: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        EventData {
            uid: uid.into(),
            summary: summary.into(),
            description: None,
            location: None,
            start,
            end,
            all_day: false,
            timezone: None,
            status: EventStatus::Confirmed,
            rrule: None,
            rdates: Vec::new(),
            exdates: Vec::new(),
            recurrence_id: None,
            sequence: 0,
            updated: None,
            custom_properties: Vec::new(),
        }
    }

    pub fn is_exception(&self) -> bool {
        self.recurrence_id.is_some()
    }

    pub fn is_recurring(&self) -> bool {
        self.recurrence_id.is_none() && (self.rrule.is_some() || !self.rdates.is_empty())
    }

    pub fn duration(&self) -> Duration {
        if self.end > self.start {
            self.end - self.start
        } else {
            Duration::zero()
        }
    }

    pub fn import_id(&self) -> String {
        import_id_for(&self.uid, self.recurrence_id)
    }

    /// Zone used for wall-clock expansion; all-day and UTC events have none.
    pub fn zone(&self) -> Option<chrono_tz::Tz> {
        if self.all_day {
            return None;
        }
        self.timezone.as_deref().and_then(|tz| tz.parse().ok())
    }

    /// Whether everything that determines the expanded instance set is unchanged.
    pub fn same_recurrence_definition(&self, other: &EventData) -> bool {
        self.start == other.start
            && self.end == other.end
            && self.all_day == other.all_day
            && self.timezone == other.timezone
            && self.rrule == other.rrule
            && self.rdates == other.rdates
            && self.exdates == other.exdates
    }

    /// Content equality ignoring revision metadata (SEQUENCE, LAST-MODIFIED).
    pub fn same_content(&self, other: &EventData) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.sequence = 0;
        b.sequence = 0;
        a.updated = None;
        b.updated = None;
        a == b
    }
}

/// Build the per-row unique key: the uid for masters, uid plus instance marker for exceptions.
pub fn import_id_for(uid: &str, recurrence_id: Option<DateTime<Utc>>) -> String {
    match recurrence_id {
        Some(instance) => format!("{}#{}", uid, instance.format("%Y%m%dT%H%M%SZ")),
        None => uid.to_string(),
    }
}

/// An event row in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub calendar_id: CalendarId,
    pub import_id: String,
    /// Server resource holding this event (shared by a master and its exceptions)
    pub href: Option<String>,
    /// Concurrency token of `href` as of the last sync
    pub etag: Option<String>,
    /// Master this exception belongs to
    pub original_event_id: Option<EventId>,
    pub sync_state: SyncState,
    pub data: EventData,
}

impl Event {
    /// A row mirroring server content.
    pub fn from_remote(
        calendar_id: CalendarId,
        data: EventData,
        href: impl Into<String>,
        etag: Option<String>,
    ) -> Self {
        Event {
            id: EventId::new(),
            calendar_id,
            import_id: data.import_id(),
            href: Some(href.into()),
            etag,
            original_event_id: None,
            sync_state: SyncState::Synced,
            data,
        }
    }

    /// A row created by a local edit, not yet known to the server.
    pub fn local(calendar_id: CalendarId, data: EventData) -> Self {
        Event {
            id: EventId::new(),
            calendar_id,
            import_id: data.import_id(),
            href: None,
            etag: None,
            original_event_id: None,
            sync_state: SyncState::LocallyCreated,
            data,
        }
    }

    pub fn uid(&self) -> &str {
        &self.data.uid
    }

    pub fn is_exception(&self) -> bool {
        self.data.is_exception()
    }

    pub fn original_instance_time(&self) -> Option<DateTime<Utc>> {
        self.data.recurrence_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.data.status == EventStatus::Cancelled
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.data.summary)
    }
}
