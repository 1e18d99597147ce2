//! Local edits.
//!
//! Every edit writes the changed rows, their occurrences and the pending
//! operation that will carry it to the server in one batch. Operations always
//! target the master: a server resource holds a whole series, so editing an
//! exception re-uploads its master's resource.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::date_range::DateRange;
use crate::error::{CalSyncError, CalSyncResult};
use crate::event::{CalendarId, Event, EventData, EventId, EventStatus, SyncState, import_id_for};
use crate::occurrence::{link_exception, materialize};
use crate::pending::{MovePhase, OperationKind, OperationState, PendingOperation};
use crate::store::{CalendarStore, StoreBatch, StoreWrite};

/// Records local changes and queues them for the next push.
pub struct LocalEditor<S> {
    store: Arc<S>,
    config: SyncConfig,
}

impl<S: CalendarStore> LocalEditor<S> {
    pub fn new(store: Arc<S>, config: SyncConfig) -> Self {
        LocalEditor { store, config }
    }

    fn window(&self) -> DateRange {
        DateRange::around(Utc::now(), self.config.past_days, self.config.future_days)
    }

    fn enqueue(&self, calendar_id: &CalendarId, event_id: EventId, kind: OperationKind) -> StoreWrite {
        StoreWrite::EnqueueOperation(PendingOperation::new(
            calendar_id.clone(),
            event_id,
            kind,
            self.config.retry.max_retries,
        ))
    }

    /// Queued (not flagged) operations for `event_id`.
    async fn queued_for(&self, calendar_id: &CalendarId, event_id: EventId) -> CalSyncResult<Vec<PendingOperation>> {
        Ok(self
            .store
            .pending_operations(calendar_id)
            .await?
            .into_iter()
            .filter(|op| op.event_id == event_id && op.state == OperationState::Queued)
            .collect())
    }

    /// Queue an upload of the master's resource unless one is already waiting.
    async fn enqueue_upload(&self, batch: &mut StoreBatch, master: &Event) -> CalSyncResult<()> {
        let queued = self.queued_for(&master.calendar_id, master.id).await?;
        let waiting = queued.iter().any(|op| {
            matches!(
                op.kind,
                OperationKind::Create | OperationKind::Update | OperationKind::Move { .. }
            )
        });
        if waiting {
            debug!(event = %master.id, "Upload already queued");
        } else {
            let kind = if master.href.is_some() {
                OperationKind::Update
            } else {
                OperationKind::Create
            };
            batch.push(self.enqueue(&master.calendar_id, master.id, kind));
        }
        Ok(())
    }

    async fn load(&self, id: EventId) -> CalSyncResult<Event> {
        match self.store.event(id).await? {
            Some(event) if event.sync_state != SyncState::LocallyDeleted => Ok(event),
            _ => Err(CalSyncError::EventNotFound(id.to_string())),
        }
    }

    async fn load_master(&self, id: EventId) -> CalSyncResult<Event> {
        let event = self.load(id).await?;
        if event.is_exception() {
            return Err(CalSyncError::InvalidEdit(format!(
                "'{}' is a single instance, not a series",
                event.import_id
            )));
        }
        Ok(event)
    }

    /// Create a new event. An empty uid gets a generated one.
    pub async fn create_event(&self, calendar_id: &CalendarId, mut data: EventData) -> CalSyncResult<Event> {
        if self.store.calendar(calendar_id).await?.is_none() {
            return Err(CalSyncError::CalendarNotFound(calendar_id.to_string()));
        }
        if data.recurrence_id.is_some() {
            return Err(CalSyncError::InvalidEdit(
                "Use override_occurrence to change a single instance".into(),
            ));
        }
        validate_times(&data)?;
        if data.uid.is_empty() {
            data.uid = format!("{}@calsync", Uuid::new_v4());
        }
        if self
            .store
            .event_by_import_id(calendar_id, &data.uid)
            .await?
            .is_some()
        {
            return Err(CalSyncError::InvalidEdit(format!(
                "An event with uid '{}' already exists",
                data.uid
            )));
        }
        data.updated = Some(Utc::now());

        let event = Event::local(calendar_id.clone(), data);
        let occurrences = materialize(&event, &[], &self.window(), self.config.max_instances)?;

        let mut batch = StoreBatch::new();
        batch.push(StoreWrite::PutEvent(event.clone()));
        batch.push(StoreWrite::ReplaceOccurrences {
            master: event.id,
            occurrences,
        });
        batch.push(self.enqueue(calendar_id, event.id, OperationKind::Create));
        self.store.apply(batch).await?;

        debug!(uid = %event.uid(), "Created event locally");
        Ok(event)
    }

    /// Replace the content of a master or exception.
    pub async fn update_event(&self, id: EventId, data: EventData) -> CalSyncResult<Event> {
        let event = self.load(id).await?;
        if data.uid != event.data.uid || data.recurrence_id != event.data.recurrence_id {
            return Err(CalSyncError::InvalidEdit(
                "uid and recurrence id of an event can't change".into(),
            ));
        }
        validate_times(&data)?;

        match event.original_event_id {
            Some(master_id) => {
                let master = self.load_master(master_id).await?;
                self.write_exception(master, Some(event), data).await
            }
            None => self.update_master(event, data).await,
        }
    }

    async fn update_master(&self, event: Event, mut data: EventData) -> CalSyncResult<Event> {
        data.sequence = event.data.sequence + 1;
        data.updated = Some(Utc::now());

        let mut updated = event.clone();
        updated.data = data;
        updated.sync_state = touched_state(event.sync_state);

        let mut batch = StoreBatch::new();
        batch.push(StoreWrite::PutEvent(updated.clone()));
        if !event.data.same_recurrence_definition(&updated.data) {
            let exceptions = self.store.exceptions_of(updated.id).await?;
            let occurrences =
                materialize(&updated, &exceptions, &self.window(), self.config.max_instances)?;
            batch.push(StoreWrite::ReplaceOccurrences {
                master: updated.id,
                occurrences,
            });
        }
        self.enqueue_upload(&mut batch, &updated).await?;
        self.store.apply(batch).await?;
        Ok(updated)
    }

    /// Change a single instance of a recurring master.
    pub async fn override_occurrence(
        &self,
        master_id: EventId,
        instance_time: DateTime<Utc>,
        mut data: EventData,
    ) -> CalSyncResult<Event> {
        let master = self.load_master(master_id).await?;
        let occurrences = self.store.occurrences_of(master.id).await?;
        if !occurrences.iter().any(|o| o.instance_time == instance_time) {
            return Err(CalSyncError::InvalidEdit(format!(
                "{} is not an instance of '{}'",
                instance_time,
                master.uid()
            )));
        }
        validate_times(&data)?;
        data.uid = master.data.uid.clone();
        data.recurrence_id = Some(instance_time);
        data.rrule = None;
        data.rdates.clear();
        data.exdates.clear();

        let existing = self
            .store
            .event_by_import_id(&master.calendar_id, &import_id_for(master.uid(), Some(instance_time)))
            .await?;
        self.write_exception(master, existing, data).await
    }

    /// Cancel one instance of a recurring master.
    pub async fn cancel_occurrence(&self, master_id: EventId, instance_time: DateTime<Utc>) -> CalSyncResult<Event> {
        let master = self.load_master(master_id).await?;
        let mut data = master.data.clone();
        data.start = instance_time;
        data.end = instance_time + master.data.duration();
        data.status = EventStatus::Cancelled;
        self.override_occurrence(master_id, instance_time, data).await
    }

    async fn write_exception(
        &self,
        mut master: Event,
        existing: Option<Event>,
        mut data: EventData,
    ) -> CalSyncResult<Event> {
        data.updated = Some(Utc::now());
        let exception = match existing {
            Some(mut exception) => {
                data.sequence = exception.data.sequence + 1;
                exception.data = data;
                exception.sync_state = touched_state(exception.sync_state);
                exception
            }
            None => {
                data.sequence = master.data.sequence;
                let mut exception = Event::local(master.calendar_id.clone(), data);
                exception.original_event_id = Some(master.id);
                exception.href = master.href.clone();
                exception.etag = master.etag.clone();
                exception
            }
        };

        let mut batch = StoreBatch::new();
        if master.sync_state == SyncState::Synced {
            master.sync_state = SyncState::LocallyModified;
            batch.push(StoreWrite::PutEvent(master.clone()));
        }
        batch.push(StoreWrite::PutEvent(exception.clone()));

        let mut occurrences = self.store.occurrences_of(master.id).await?;
        link_exception(&mut occurrences, &master, &exception);
        if let Some(occurrence) = occurrences
            .into_iter()
            .find(|o| Some(o.instance_time) == exception.original_instance_time())
        {
            batch.push(StoreWrite::PutOccurrence(occurrence));
        }

        self.enqueue_upload(&mut batch, &master).await?;
        self.store.apply(batch).await?;
        Ok(exception)
    }

    /// Delete an event.
    ///
    /// Deleting an exception restores the instance it overrode. Deleting a
    /// master that never reached the server just drops it.
    pub async fn delete_event(&self, id: EventId) -> CalSyncResult<()> {
        let event = self.load(id).await?;
        let mut batch = StoreBatch::new();

        if let Some(master_id) = event.original_event_id {
            let mut master = self.load_master(master_id).await?;
            if master.sync_state == SyncState::Synced {
                master.sync_state = SyncState::LocallyModified;
                batch.push(StoreWrite::PutEvent(master.clone()));
            }
            batch.push(StoreWrite::DeleteEvent(event.id));
            self.enqueue_upload(&mut batch, &master).await?;
            return self.store.apply(batch).await;
        }

        let pending: Vec<PendingOperation> = self
            .store
            .pending_operations(&event.calendar_id)
            .await?
            .into_iter()
            .filter(|op| op.event_id == event.id)
            .collect();
        if pending.iter().any(|op| matches!(op.kind, OperationKind::Move { .. })) {
            return Err(move_in_progress(&event));
        }
        if event.href.is_none() {
            for op in pending {
                batch.push(StoreWrite::RemoveOperation(op.id));
            }
            batch.push(StoreWrite::DeleteEvent(event.id));
            return self.store.apply(batch).await;
        }

        // Queued uploads would only be deleted again
        for op in pending.iter().filter(|op| op.kind == OperationKind::Update) {
            batch.push(StoreWrite::RemoveOperation(op.id));
        }
        let mut deleted = event.clone();
        deleted.sync_state = SyncState::LocallyDeleted;
        batch.push(StoreWrite::PutEvent(deleted));
        batch.push(StoreWrite::ReplaceOccurrences {
            master: event.id,
            occurrences: Vec::new(),
        });
        batch.push(self.enqueue(&event.calendar_id, event.id, OperationKind::Delete));
        self.store.apply(batch).await
    }

    /// Move a series to another calendar of the same account.
    pub async fn move_event(&self, id: EventId, destination: &CalendarId) -> CalSyncResult<Event> {
        let event = self.load_master(id).await?;
        if &event.calendar_id == destination {
            return Ok(event);
        }
        if self.store.calendar(destination).await?.is_none() {
            return Err(CalSyncError::CalendarNotFound(destination.to_string()));
        }
        if self
            .store
            .event_by_import_id(destination, &event.import_id)
            .await?
            .is_some()
        {
            return Err(CalSyncError::InvalidEdit(format!(
                "'{}' already exists in {}",
                event.uid(),
                destination
            )));
        }

        let source = event.calendar_id.clone();
        let exceptions = self.store.exceptions_of(event.id).await?;
        let pending: Vec<PendingOperation> = self
            .store
            .pending_operations(&source)
            .await?
            .into_iter()
            .filter(|op| op.event_id == event.id)
            .collect();
        if pending.iter().any(|op| matches!(op.kind, OperationKind::Move { .. })) {
            return Err(move_in_progress(&event));
        }

        let mut batch = StoreBatch::new();
        let kind = match event.href.clone() {
            // Never uploaded: the create simply goes to the new calendar
            None => OperationKind::Create,
            Some(source_href) => OperationKind::Move {
                source_calendar: source.clone(),
                source_href,
                source_etag: event.etag.clone(),
                phase: MovePhase::CreateAtDestination,
            },
        };
        for op in &pending {
            batch.push(StoreWrite::RemoveOperation(op.id));
        }

        let mut moved = event.clone();
        moved.calendar_id = destination.clone();
        moved.href = None;
        moved.etag = None;
        moved.sync_state = SyncState::LocallyCreated;
        batch.push(StoreWrite::PutEvent(moved.clone()));
        for mut exception in exceptions {
            exception.calendar_id = destination.clone();
            exception.href = None;
            exception.etag = None;
            exception.sync_state = SyncState::LocallyCreated;
            batch.push(StoreWrite::PutEvent(exception));
        }
        batch.push(self.enqueue(destination, moved.id, kind));
        self.store.apply(batch).await?;

        debug!(uid = %moved.uid(), from = %source, to = %destination, "Moved event locally");
        Ok(moved)
    }
}

/// State of a row after a local edit.
fn touched_state(previous: SyncState) -> SyncState {
    match previous {
        SyncState::LocallyCreated => SyncState::LocallyCreated,
        _ => SyncState::LocallyModified,
    }
}

fn move_in_progress(event: &Event) -> CalSyncError {
    CalSyncError::InvalidEdit(format!(
        "'{}' is still being moved, sync before changing its calendar again",
        event.data.summary
    ))
}

fn validate_times(data: &EventData) -> CalSyncResult<()> {
    if data.end < data.start {
        return Err(CalSyncError::InvalidEdit(format!(
            "'{}' ends before it starts",
            data.summary
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::Calendar;
    use crate::remote::RemoteCalendar;
    use crate::store::MemoryStore;
    use chrono::{Datelike, Duration, TimeZone};
    use pretty_assertions::assert_eq;

    async fn setup() -> (LocalEditor<MemoryStore>, Arc<MemoryStore>, CalendarId, CalendarId) {
        let store = Arc::new(MemoryStore::new());
        let mut batch = StoreBatch::new();
        let mut ids = Vec::new();
        for name in ["home", "work"] {
            let calendar = Calendar::from_remote(
                "test",
                &RemoteCalendar {
                    href: format!("/dav/{name}/"),
                    name: name.into(),
                    color: None,
                    ctag: None,
                    components: vec![],
                },
            );
            ids.push(calendar.id.clone());
            batch.push(StoreWrite::PutCalendar(calendar));
        }
        store.apply(batch).await.unwrap();
        let editor = LocalEditor::new(Arc::clone(&store), SyncConfig::default());
        (editor, store, ids[0].clone(), ids[1].clone())
    }

    fn weekly(start: DateTime<Utc>) -> EventData {
        let mut data = EventData::new("", "Review", start, start + Duration::hours(1));
        data.rrule = Some("FREQ=WEEKLY;COUNT=4".into());
        data
    }

    fn soon() -> DateTime<Utc> {
        let now = Utc::now();
        Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), 9, 0, 0)
            .unwrap()
            + Duration::days(1)
    }

    #[tokio::test]
    async fn test_create_materializes_and_queues() {
        let (editor, store, home, _) = setup().await;
        let event = editor.create_event(&home, weekly(soon())).await.unwrap();

        assert!(!event.data.uid.is_empty());
        assert_eq!(event.sync_state, SyncState::LocallyCreated);
        assert_eq!(store.occurrences_of(event.id).await.unwrap().len(), 4);

        let ops = store.pending_operations(&home).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Create);
    }

    #[tokio::test]
    async fn test_edit_before_upload_keeps_single_create() {
        let (editor, store, home, _) = setup().await;
        let event = editor.create_event(&home, weekly(soon())).await.unwrap();

        let mut data = event.data.clone();
        data.summary = "Design review".into();
        let updated = editor.update_event(event.id, data).await.unwrap();
        assert_eq!(updated.data.sequence, 1);

        let ops = store.pending_operations(&home).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Create);
    }

    #[tokio::test]
    async fn test_cancel_occurrence_links_exception() {
        let (editor, store, home, _) = setup().await;
        let master = editor.create_event(&home, weekly(soon())).await.unwrap();
        let second = store.occurrences_of(master.id).await.unwrap()[1].instance_time;

        let exception = editor.cancel_occurrence(master.id, second).await.unwrap();
        assert_eq!(exception.original_event_id, Some(master.id));

        let occs = store.occurrences_of(master.id).await.unwrap();
        assert_eq!(occs.len(), 4);
        assert!(occs[1].cancelled);
        assert_eq!(occs[1].effective_event_id, exception.id);

        editor.delete_event(exception.id).await.unwrap();
        let occs = store.occurrences_of(master.id).await.unwrap();
        assert!(!occs[1].cancelled);
        assert_eq!(occs[1].effective_event_id, master.id);
    }

    #[tokio::test]
    async fn test_deleting_unuploaded_event_drops_everything() {
        let (editor, store, home, _) = setup().await;
        let event = editor.create_event(&home, weekly(soon())).await.unwrap();

        editor.delete_event(event.id).await.unwrap();
        assert!(store.event(event.id).await.unwrap().is_none());
        assert!(store.occurrences_of(event.id).await.unwrap().is_empty());
        assert!(store.pending_operations(&home).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleting_uploaded_event_queues_delete() {
        let (editor, store, home, _) = setup().await;
        let event = editor.create_event(&home, weekly(soon())).await.unwrap();

        // Pretend the create went through
        let mut synced = event.clone();
        synced.href = Some("/dav/home/x.ics".into());
        synced.etag = Some("\"1\"".into());
        synced.sync_state = SyncState::Synced;
        let mut batch = StoreBatch::new();
        batch.push(StoreWrite::PutEvent(synced));
        for op in store.pending_operations(&home).await.unwrap() {
            batch.push(StoreWrite::RemoveOperation(op.id));
        }
        store.apply(batch).await.unwrap();

        editor.delete_event(event.id).await.unwrap();
        let stored = store.event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_state, SyncState::LocallyDeleted);
        assert!(store.occurrences_of(event.id).await.unwrap().is_empty());
        let ops = store.pending_operations(&home).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Delete);
    }

    #[tokio::test]
    async fn test_move_uploaded_event_queues_two_phase_move() {
        let (editor, store, home, work) = setup().await;
        let event = editor.create_event(&home, weekly(soon())).await.unwrap();
        let mut synced = event.clone();
        synced.href = Some("/dav/home/x.ics".into());
        synced.etag = Some("\"1\"".into());
        synced.sync_state = SyncState::Synced;
        let mut batch = StoreBatch::new();
        batch.push(StoreWrite::PutEvent(synced));
        for op in store.pending_operations(&home).await.unwrap() {
            batch.push(StoreWrite::RemoveOperation(op.id));
        }
        store.apply(batch).await.unwrap();

        let moved = editor.move_event(event.id, &work).await.unwrap();
        assert_eq!(moved.calendar_id, work);
        assert!(store.pending_operations(&home).await.unwrap().is_empty());

        let ops = store.pending_operations(&work).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(
            ops[0].kind,
            OperationKind::Move {
                source_calendar: home.clone(),
                source_href: "/dav/home/x.ics".into(),
                source_etag: Some("\"1\"".into()),
                phase: MovePhase::CreateAtDestination,
            }
        );
        assert_eq!(store.occurrences_of(event.id).await.unwrap().len(), 4);
    }
}
