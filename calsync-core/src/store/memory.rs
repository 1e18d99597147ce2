//! In-memory store with optional JSON snapshot persistence.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::calendar::Calendar;
use crate::cursor::SyncCursor;
use crate::error::{CalSyncError, CalSyncResult};
use crate::event::{CalendarId, Event, EventId};
use crate::occurrence::{Occurrence, unlink_exception};
use crate::pending::{OperationId, PendingOperation};
use crate::store::snapshot::Snapshot;
use crate::store::{CalendarStore, StoreBatch, StoreWrite};

#[derive(Debug, Clone, Default)]
pub(super) struct Tables {
    pub(super) calendars: BTreeMap<CalendarId, Calendar>,
    pub(super) events: HashMap<EventId, Event>,
    import_index: HashMap<(CalendarId, String), EventId>,
    /// Keyed by (master, instance time)
    pub(super) occurrences: BTreeMap<(EventId, DateTime<Utc>), Occurrence>,
    /// Keyed by sequence number
    pub(super) operations: BTreeMap<u64, PendingOperation>,
    pub(super) next_seq: u64,
    pub(super) cursors: BTreeMap<CalendarId, SyncCursor>,
}

impl Tables {
    pub(super) fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut tables = Tables {
            next_seq: snapshot.next_seq,
            ..Default::default()
        };
        for calendar in snapshot.calendars {
            tables.calendars.insert(calendar.id.clone(), calendar);
        }
        for event in snapshot.events {
            tables
                .import_index
                .insert((event.calendar_id.clone(), event.import_id.clone()), event.id);
            tables.events.insert(event.id, event);
        }
        for occ in snapshot.occurrences {
            tables.occurrences.insert((occ.event_id, occ.instance_time), occ);
        }
        for op in snapshot.operations {
            tables.next_seq = tables.next_seq.max(op.seq + 1);
            tables.operations.insert(op.seq, op);
        }
        for cursor in snapshot.cursors {
            tables.cursors.insert(cursor.calendar_id.clone(), cursor);
        }
        tables
    }

    fn apply(&mut self, write: StoreWrite) -> CalSyncResult<()> {
        match write {
            StoreWrite::PutCalendar(calendar) => {
                self.calendars.insert(calendar.id.clone(), calendar);
            }
            StoreWrite::PutEvent(event) => self.put_event(event)?,
            StoreWrite::DeleteEvent(id) => self.delete_event(id),
            StoreWrite::ReplaceOccurrences { master, occurrences } => {
                self.occurrences.retain(|(owner, _), _| *owner != master);
                for occ in occurrences {
                    self.put_occurrence(occ)?;
                }
            }
            StoreWrite::PutOccurrence(occ) => self.put_occurrence(occ)?,
            StoreWrite::EnqueueOperation(mut op) => {
                op.seq = self.next_seq;
                self.next_seq += 1;
                self.operations.insert(op.seq, op);
            }
            StoreWrite::PutOperation(op) => {
                if !self.operations.contains_key(&op.seq) {
                    return Err(CalSyncError::Store(format!(
                        "Pending operation {} is not queued",
                        op.seq
                    )));
                }
                self.operations.insert(op.seq, op);
            }
            StoreWrite::RemoveOperation(id) => self.remove_operation(id),
            StoreWrite::PutCursor(cursor) => {
                self.cursors.insert(cursor.calendar_id.clone(), cursor);
            }
        }
        Ok(())
    }

    fn put_event(&mut self, event: Event) -> CalSyncResult<()> {
        let key = (event.calendar_id.clone(), event.import_id.clone());
        if let Some(existing) = self.import_index.get(&key)
            && *existing != event.id
        {
            return Err(CalSyncError::Store(format!(
                "Duplicate import id '{}' in calendar {}",
                event.import_id, event.calendar_id
            )));
        }
        if let Some(master_id) = event.original_event_id {
            let master = self.events.get(&master_id).ok_or_else(|| {
                CalSyncError::Store(format!("Exception '{}' references a missing master", event.import_id))
            })?;
            if master.data.uid != event.data.uid {
                return Err(CalSyncError::Store(format!(
                    "Exception '{}' does not share its master's uid",
                    event.import_id
                )));
            }
        }

        // Re-keying an existing row (uid or calendar changed) drops the old index entry
        if let Some(previous) = self.events.get(&event.id) {
            let old_key = (previous.calendar_id.clone(), previous.import_id.clone());
            if old_key != key {
                self.import_index.remove(&old_key);
            }
        }

        self.import_index.insert(key, event.id);
        self.events.insert(event.id, event);
        Ok(())
    }

    fn delete_event(&mut self, id: EventId) {
        let Some(event) = self.events.remove(&id) else {
            return;
        };
        self.import_index
            .remove(&(event.calendar_id.clone(), event.import_id.clone()));

        match (event.original_event_id, event.original_instance_time()) {
            (Some(master_id), Some(instance_time)) => {
                // Exception: put the overridden instance back to the master's times
                if let Some(master) = self.events.get(&master_id)
                    && let Some(occ) = self.occurrences.get_mut(&(master_id, instance_time))
                    && occ.effective_event_id == id
                {
                    unlink_exception(std::slice::from_mut(occ), master, instance_time);
                }
            }
            _ => {
                self.occurrences.retain(|(owner, _), _| *owner != id);
                let exceptions: Vec<EventId> = self
                    .events
                    .values()
                    .filter(|e| e.original_event_id == Some(id))
                    .map(|e| e.id)
                    .collect();
                for exception in exceptions {
                    if let Some(removed) = self.events.remove(&exception) {
                        self.import_index
                            .remove(&(removed.calendar_id, removed.import_id));
                    }
                }
            }
        }
    }

    fn put_occurrence(&mut self, occ: Occurrence) -> CalSyncResult<()> {
        if !self.events.contains_key(&occ.event_id) {
            return Err(CalSyncError::Store(format!(
                "Occurrence references missing event {}",
                occ.event_id
            )));
        }
        self.occurrences.insert((occ.event_id, occ.instance_time), occ);
        Ok(())
    }

    fn remove_operation(&mut self, id: OperationId) {
        self.operations.retain(|_, op| op.id != id);
    }
}

/// A [`CalendarStore`] kept in memory.
///
/// Each batch is applied to a copy of the tables and swapped in only if every
/// write succeeded. When opened with a path, the tables are written to that
/// file after each committed batch.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store persisted at `path`, loading the existing snapshot if there is one.
    pub fn open(path: impl AsRef<Path>) -> CalSyncResult<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = match Snapshot::load(&path)? {
            Some(snapshot) => Tables::from_snapshot(snapshot),
            None => Tables::default(),
        };
        Ok(MemoryStore {
            tables: RwLock::new(tables),
            path: Some(path),
        })
    }

    fn commit(&self, batch: StoreBatch) -> CalSyncResult<()> {
        let mut tables = self.tables.write();
        let mut next = tables.clone();
        let count = batch.len();
        for write in batch.into_writes() {
            next.apply(write)?;
        }
        if let Some(path) = &self.path {
            Snapshot::from_tables(&next).save(path)?;
        }
        *tables = next;
        debug!(writes = count, "Committed store batch");
        Ok(())
    }
}

impl CalendarStore for MemoryStore {
    async fn calendars(&self) -> CalSyncResult<Vec<Calendar>> {
        Ok(self.tables.read().calendars.values().cloned().collect())
    }

    async fn calendar(&self, id: &CalendarId) -> CalSyncResult<Option<Calendar>> {
        Ok(self.tables.read().calendars.get(id).cloned())
    }

    async fn event(&self, id: EventId) -> CalSyncResult<Option<Event>> {
        Ok(self.tables.read().events.get(&id).cloned())
    }

    async fn event_by_import_id(
        &self,
        calendar: &CalendarId,
        import_id: &str,
    ) -> CalSyncResult<Option<Event>> {
        let tables = self.tables.read();
        Ok(tables
            .import_index
            .get(&(calendar.clone(), import_id.to_string()))
            .and_then(|id| tables.events.get(id))
            .cloned())
    }

    async fn events(&self, calendar: &CalendarId) -> CalSyncResult<Vec<Event>> {
        let tables = self.tables.read();
        let mut events: Vec<Event> = tables
            .events
            .values()
            .filter(|e| &e.calendar_id == calendar)
            .cloned()
            .collect();
        events.sort_by(|a, b| a.import_id.cmp(&b.import_id));
        Ok(events)
    }

    async fn events_by_href(&self, calendar: &CalendarId, href: &str) -> CalSyncResult<Vec<Event>> {
        let tables = self.tables.read();
        let mut events: Vec<Event> = tables
            .events
            .values()
            .filter(|e| &e.calendar_id == calendar && e.href.as_deref() == Some(href))
            .cloned()
            .collect();
        events.sort_by(|a, b| a.import_id.cmp(&b.import_id));
        Ok(events)
    }

    async fn exceptions_of(&self, master: EventId) -> CalSyncResult<Vec<Event>> {
        let tables = self.tables.read();
        let mut events: Vec<Event> = tables
            .events
            .values()
            .filter(|e| e.original_event_id == Some(master))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.original_instance_time());
        Ok(events)
    }

    async fn occurrences_of(&self, master: EventId) -> CalSyncResult<Vec<Occurrence>> {
        Ok(self
            .tables
            .read()
            .occurrences
            .range((master, DateTime::<Utc>::MIN_UTC)..=(master, DateTime::<Utc>::MAX_UTC))
            .map(|(_, occ)| occ.clone())
            .collect())
    }

    async fn occurrences_in_days(
        &self,
        calendar: Option<&CalendarId>,
        first_day: i32,
        last_day: i32,
    ) -> CalSyncResult<Vec<Occurrence>> {
        let tables = self.tables.read();
        let mut occs: Vec<Occurrence> = tables
            .occurrences
            .values()
            .filter(|occ| occ.touches_days(first_day, last_day))
            .filter(|occ| match calendar {
                Some(cal) => tables
                    .events
                    .get(&occ.event_id)
                    .is_some_and(|e| &e.calendar_id == cal),
                None => true,
            })
            .cloned()
            .collect();
        occs.sort_by_key(|occ| (occ.start, occ.event_id));
        Ok(occs)
    }

    async fn pending_operations(&self, calendar: &CalendarId) -> CalSyncResult<Vec<PendingOperation>> {
        Ok(self
            .tables
            .read()
            .operations
            .values()
            .filter(|op| &op.calendar_id == calendar)
            .cloned()
            .collect())
    }

    async fn cursor(&self, calendar: &CalendarId) -> CalSyncResult<SyncCursor> {
        Ok(self
            .tables
            .read()
            .cursors
            .get(calendar)
            .cloned()
            .unwrap_or_else(|| SyncCursor::new(calendar.clone())))
    }

    async fn apply(&self, batch: StoreBatch) -> CalSyncResult<()> {
        self.commit(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date_range::DateRange;
    use crate::event::{EventData, EventStatus};
    use crate::occurrence::{link_exception, regenerate_occurrences};
    use crate::pending::OperationKind;
    use chrono::{Duration, TimeZone};

    fn cal() -> CalendarId {
        CalendarId::new("cal")
    }

    fn recurring_master() -> Event {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let mut data = EventData::new("series", "Series", start, start + Duration::hours(1));
        data.rrule = Some("FREQ=DAILY;COUNT=3".to_string());
        Event::from_remote(cal(), data, "/cal/series.ics", Some("\"1\"".into()))
    }

    fn window() -> DateRange {
        DateRange::new(
            Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    fn exception(master: &Event, day: i64) -> Event {
        let instance = master.data.start + Duration::days(day);
        let mut data = EventData::new(master.uid(), "Moved", instance + Duration::hours(2), instance + Duration::hours(3));
        data.recurrence_id = Some(instance);
        let mut e = Event::from_remote(cal(), data, "/cal/series.ics", Some("\"1\"".into()));
        e.original_event_id = Some(master.id);
        e
    }

    async fn seed(store: &MemoryStore, master: &Event, exception: &Event) {
        let mut occs = regenerate_occurrences(master, &window(), 100).unwrap();
        link_exception(&mut occs, master, exception);
        let mut batch = StoreBatch::new();
        batch
            .push(StoreWrite::PutEvent(master.clone()))
            .push(StoreWrite::PutEvent(exception.clone()))
            .push(StoreWrite::ReplaceOccurrences {
                master: master.id,
                occurrences: occs,
            });
        store.apply(batch).await.unwrap();
    }

    #[tokio::test]
    async fn test_deleting_master_cascades() {
        let store = MemoryStore::new();
        let master = recurring_master();
        let exception = exception(&master, 1);
        seed(&store, &master, &exception).await;
        assert_eq!(store.occurrences_of(master.id).await.unwrap().len(), 3);

        let mut batch = StoreBatch::new();
        batch.push(StoreWrite::DeleteEvent(master.id));
        store.apply(batch).await.unwrap();

        assert!(store.occurrences_of(master.id).await.unwrap().is_empty());
        assert!(store.event(exception.id).await.unwrap().is_none());
        assert!(store.events(&cal()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleting_exception_restores_master_instance() {
        let store = MemoryStore::new();
        let master = recurring_master();
        let exception = exception(&master, 1);
        seed(&store, &master, &exception).await;

        let mut batch = StoreBatch::new();
        batch.push(StoreWrite::DeleteEvent(exception.id));
        store.apply(batch).await.unwrap();

        let occs = store.occurrences_of(master.id).await.unwrap();
        assert_eq!(occs.len(), 3);
        assert!(occs.iter().all(|o| o.effective_event_id == master.id));
        assert_eq!(occs[1].start, occs[1].instance_time);
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_store_untouched() {
        let store = MemoryStore::new();
        let master = recurring_master();
        let mut orphan = exception(&master, 1);
        orphan.original_event_id = Some(EventId::new());

        let mut batch = StoreBatch::new();
        batch
            .push(StoreWrite::PutEvent(master.clone()))
            .push(StoreWrite::PutEvent(orphan));
        assert!(store.apply(batch).await.is_err());
        assert!(store.event(master.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_exception_uid_must_match_master() {
        let store = MemoryStore::new();
        let master = recurring_master();
        let mut stranger = exception(&master, 1);
        stranger.data.uid = "other".to_string();
        stranger.import_id = stranger.data.import_id();

        let mut batch = StoreBatch::new();
        batch
            .push(StoreWrite::PutEvent(master))
            .push(StoreWrite::PutEvent(stranger));
        assert!(store.apply(batch).await.is_err());
    }

    #[tokio::test]
    async fn test_operations_keep_creation_order() {
        let store = MemoryStore::new();
        let event_id = EventId::new();
        let mut batch = StoreBatch::new();
        for kind in [OperationKind::Create, OperationKind::Update, OperationKind::Delete] {
            batch.push(StoreWrite::EnqueueOperation(PendingOperation::new(cal(), event_id, kind, 5)));
        }
        store.apply(batch).await.unwrap();

        let ops = store.pending_operations(&cal()).await.unwrap();
        let kinds: Vec<&str> = ops.iter().map(|op| op.kind.label()).collect();
        assert_eq!(kinds, vec!["create", "update", "delete"]);
        assert!(ops.windows(2).all(|w| w[0].seq < w[1].seq));

        let mut batch = StoreBatch::new();
        batch.push(StoreWrite::RemoveOperation(ops[0].id));
        store.apply(batch).await.unwrap();
        assert_eq!(store.pending_operations(&cal()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_occurrences_in_days_filters_by_calendar() {
        let store = MemoryStore::new();
        let master = recurring_master();
        let mut cancelled = exception(&master, 2);
        cancelled.data.status = EventStatus::Cancelled;
        seed(&store, &master, &cancelled).await;

        let first = crate::occurrence::day_number(master.data.start.date_naive());
        let occs = store.occurrences_in_days(Some(&cal()), first, first + 1).await.unwrap();
        assert_eq!(occs.len(), 2);

        let other = CalendarId::new("other");
        assert!(store.occurrences_in_days(Some(&other), first, first + 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let master = recurring_master();
        let exception = exception(&master, 1);
        {
            let store = MemoryStore::open(&path).unwrap();
            seed(&store, &master, &exception).await;
        }

        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.occurrences_of(master.id).await.unwrap().len(), 3);
        let found = reopened
            .event_by_import_id(&cal(), &exception.import_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, exception.id);
    }
}
