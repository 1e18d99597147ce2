//! Local persistence interface.
//!
//! The sync engine reads through [`CalendarStore`] and writes exclusively
//! through [`CalendarStore::apply`], which commits a [`StoreBatch`] atomically:
//! either every write in the batch is visible afterwards or none is.

mod memory;
mod snapshot;

pub use memory::MemoryStore;

use std::future::Future;

use crate::calendar::Calendar;
use crate::cursor::SyncCursor;
use crate::error::CalSyncResult;
use crate::event::{CalendarId, Event, EventId};
use crate::occurrence::Occurrence;
use crate::pending::{OperationId, PendingOperation};

/// A single write inside a batch.
#[derive(Debug, Clone)]
pub enum StoreWrite {
    PutCalendar(Calendar),
    /// Insert or replace an event row by id.
    PutEvent(Event),
    /// Delete an event. Deleting a master cascades to its exceptions and
    /// occurrences; deleting an exception restores the occurrence it overrode.
    DeleteEvent(EventId),
    /// Drop every occurrence of a master and insert `occurrences` instead.
    ReplaceOccurrences {
        master: EventId,
        occurrences: Vec<Occurrence>,
    },
    /// Insert or replace one occurrence keyed by master and instance time.
    PutOccurrence(Occurrence),
    /// Append to the pending queue; the store assigns the sequence number.
    EnqueueOperation(PendingOperation),
    /// Replace an existing queue entry, keeping its position.
    PutOperation(PendingOperation),
    RemoveOperation(OperationId),
    PutCursor(SyncCursor),
}

/// Writes committed together.
#[derive(Debug, Clone, Default)]
pub struct StoreBatch {
    writes: Vec<StoreWrite>,
}

impl StoreBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, write: StoreWrite) -> &mut Self {
        self.writes.push(write);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn writes(&self) -> &[StoreWrite] {
        &self.writes
    }

    pub fn into_writes(self) -> Vec<StoreWrite> {
        self.writes
    }
}

impl Extend<StoreWrite> for StoreBatch {
    fn extend<T: IntoIterator<Item = StoreWrite>>(&mut self, iter: T) {
        self.writes.extend(iter);
    }
}

/// Read/write access to events, occurrences, the pending queue and cursors.
pub trait CalendarStore: Send + Sync {
    fn calendars(&self) -> impl Future<Output = CalSyncResult<Vec<Calendar>>> + Send;

    fn calendar(
        &self,
        id: &CalendarId,
    ) -> impl Future<Output = CalSyncResult<Option<Calendar>>> + Send;

    fn event(&self, id: EventId) -> impl Future<Output = CalSyncResult<Option<Event>>> + Send;

    fn event_by_import_id(
        &self,
        calendar: &CalendarId,
        import_id: &str,
    ) -> impl Future<Output = CalSyncResult<Option<Event>>> + Send;

    /// Every event row of a calendar, masters and exceptions.
    fn events(&self, calendar: &CalendarId)
    -> impl Future<Output = CalSyncResult<Vec<Event>>> + Send;

    /// Rows stored under a server resource: a master and its exceptions.
    fn events_by_href(
        &self,
        calendar: &CalendarId,
        href: &str,
    ) -> impl Future<Output = CalSyncResult<Vec<Event>>> + Send;

    fn exceptions_of(
        &self,
        master: EventId,
    ) -> impl Future<Output = CalSyncResult<Vec<Event>>> + Send;

    /// Occurrences of a master ordered by instance time.
    fn occurrences_of(
        &self,
        master: EventId,
    ) -> impl Future<Output = CalSyncResult<Vec<Occurrence>>> + Send;

    /// Occurrences touching the day range `[first_day, last_day]`, ordered by start.
    fn occurrences_in_days(
        &self,
        calendar: Option<&CalendarId>,
        first_day: i32,
        last_day: i32,
    ) -> impl Future<Output = CalSyncResult<Vec<Occurrence>>> + Send;

    /// Queue entries of a calendar in creation order.
    fn pending_operations(
        &self,
        calendar: &CalendarId,
    ) -> impl Future<Output = CalSyncResult<Vec<PendingOperation>>> + Send;

    /// Stored cursor, or a fresh one if the calendar was never pulled.
    fn cursor(
        &self,
        calendar: &CalendarId,
    ) -> impl Future<Output = CalSyncResult<SyncCursor>> + Send;

    fn apply(&self, batch: StoreBatch) -> impl Future<Output = CalSyncResult<()>> + Send;
}
