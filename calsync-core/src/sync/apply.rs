//! Turning fetched server resources into one atomic store batch.
//!
//! Every resource is parsed, grouped by UID and diffed against the rows
//! stored under its href. Event ids are reused by import id so pulls never
//! duplicate rows, and occurrences are only rebuilt when the recurrence
//! definition changed; otherwise just the instances touched by changed
//! exceptions are rewritten.

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, warn};

use crate::calendar::Calendar;
use crate::date_range::DateRange;
use crate::error::CalSyncResult;
use crate::event::{Event, EventData, EventId, SyncState};
use crate::ics::{EventGroup, ParseIssue, parse_calendar};
use crate::occurrence::{LinkOutcome, link_exception, materialize, unlink_exception};
use crate::remote::Resource;
use crate::store::{CalendarStore, StoreBatch, StoreWrite};

/// What applying a batch of resources amounted to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ApplyTally {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Documents or components that could not be interpreted
    pub failures: usize,
    /// Groups left alone because they have unpushed local changes
    pub skipped_local: usize,
    /// (uid, href) of exception groups that arrived without a master
    pub orphans: Vec<(String, String)>,
}

enum GroupOutcome {
    Applied,
    Skipped,
}

/// Accumulates the writes of one pull (or one conflict resolution).
pub(crate) struct BatchBuilder<'a, S> {
    store: &'a S,
    calendar: &'a Calendar,
    window: DateRange,
    max_instances: u16,
    batch: StoreBatch,
    /// Rows written by this batch; never deleted by it
    claimed: HashSet<EventId>,
    deletions: Vec<EventId>,
    pub tally: ApplyTally,
}

impl<'a, S: CalendarStore> BatchBuilder<'a, S> {
    pub fn new(store: &'a S, calendar: &'a Calendar, window: DateRange, max_instances: u16) -> Self {
        BatchBuilder {
            store,
            calendar,
            window,
            max_instances,
            batch: StoreBatch::new(),
            claimed: HashSet::new(),
            deletions: Vec::new(),
            tally: ApplyTally::default(),
        }
    }

    /// Append a write that doesn't come from a resource (cursor, queue entry).
    pub fn push(&mut self, write: StoreWrite) {
        self.batch.push(write);
    }

    /// Mirror `resource` locally.
    ///
    /// With `force`, rows with unpushed local changes are overwritten too.
    pub async fn apply_resource(&mut self, resource: &Resource, force: bool) -> CalSyncResult<()> {
        let parsed = match parse_calendar(&resource.data) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(href = %resource.href, error = %e, "Could not parse calendar resource");
                self.tally.failures += 1;
                return Ok(());
            }
        };

        // Rows of these uids are left as they are
        let mut protected: HashSet<String> = HashSet::new();
        let mut protect_all = false;
        for issue in &parsed.issues {
            match issue {
                ParseIssue::InvalidComponent { uid, reason } => {
                    warn!(href = %resource.href, uid = ?uid, %reason, "Skipping invalid VEVENT");
                    self.tally.failures += 1;
                    match uid {
                        Some(uid) => {
                            protected.insert(uid.clone());
                        }
                        None => protect_all = true,
                    }
                }
                other => debug!(href = %resource.href, issue = ?other, "Resource anomaly"),
            }
        }

        let existing = self
            .store
            .events_by_href(&self.calendar.id, &resource.href)
            .await?;

        let mut kept: HashSet<EventId> = HashSet::new();
        for group in &parsed.groups {
            if group.is_orphan() {
                warn!(
                    href = %resource.href,
                    uid = %group.uid,
                    "Exceptions arrived without their master, deferring to the next full resync"
                );
                self.tally
                    .orphans
                    .push((group.uid.clone(), resource.href.clone()));
                protected.insert(group.uid.clone());
                continue;
            }
            match self
                .apply_group(group, &resource.href, &resource.etag, force, &mut kept)
                .await?
            {
                GroupOutcome::Applied => {}
                GroupOutcome::Skipped => {
                    protected.insert(group.uid.clone());
                }
            }
        }

        if protect_all {
            return Ok(());
        }
        // Rows whose uid no longer appears in the resource
        for row in existing {
            if kept.contains(&row.id) || protected.contains(row.uid()) {
                continue;
            }
            if !force && row.sync_state != SyncState::Synced {
                continue;
            }
            if !row.is_exception() {
                self.tally.deleted += 1;
            }
            self.delete(row.id);
        }
        Ok(())
    }

    /// Remove the rows of a resource the server deleted.
    pub async fn remove_href(&mut self, href: &str) -> CalSyncResult<()> {
        for row in self.store.events_by_href(&self.calendar.id, href).await? {
            if row.sync_state != SyncState::Synced {
                debug!(%href, uid = %row.uid(), "Keeping locally changed event deleted on the server");
                continue;
            }
            if !row.is_exception() {
                self.tally.deleted += 1;
            }
            self.delete(row.id);
        }
        Ok(())
    }

    /// Queue a delete. Deleting a master cascades in the store.
    pub fn delete(&mut self, id: EventId) {
        if !self.deletions.contains(&id) {
            self.deletions.push(id);
        }
    }

    pub fn finish(mut self) -> (StoreBatch, ApplyTally) {
        for id in std::mem::take(&mut self.deletions) {
            if !self.claimed.contains(&id) {
                self.batch.push(StoreWrite::DeleteEvent(id));
            }
        }
        (self.batch, self.tally)
    }

    fn put_event(&mut self, event: Event) {
        self.claimed.insert(event.id);
        self.batch.push(StoreWrite::PutEvent(event));
    }

    async fn apply_group(
        &mut self,
        group: &EventGroup,
        href: &str,
        etag: &str,
        force: bool,
        kept: &mut HashSet<EventId>,
    ) -> CalSyncResult<GroupOutcome> {
        let Some(master_data) = group.master.clone() else {
            return Ok(GroupOutcome::Skipped);
        };
        let calendar: &'a Calendar = self.calendar;
        let calendar_id = &calendar.id;

        let previous = self.store.event_by_import_id(calendar_id, &group.uid).await?;
        if let Some(prev) = &previous
            && !force
            && prev.sync_state != SyncState::Synced
        {
            debug!(uid = %group.uid, state = ?prev.sync_state, "Local changes pending, not overwriting");
            self.tally.skipped_local += 1;
            return Ok(GroupOutcome::Skipped);
        }

        let (master, regenerate, changed) = match &previous {
            Some(prev) => {
                let changed = !prev.data.same_content(&master_data);
                let regenerate = force
                    || prev.sync_state != SyncState::Synced
                    || !prev.data.same_recurrence_definition(&master_data);
                let master = Event {
                    id: prev.id,
                    calendar_id: calendar_id.clone(),
                    import_id: master_data.import_id(),
                    href: Some(href.to_string()),
                    etag: Some(etag.to_string()),
                    original_event_id: None,
                    sync_state: SyncState::Synced,
                    data: with_sequence(master_data, &prev.data, changed),
                };
                (master, regenerate, changed)
            }
            None => (
                Event::from_remote(calendar_id.clone(), master_data, href, Some(etag.to_string())),
                true,
                true,
            ),
        };

        let stored_exceptions = match &previous {
            Some(prev) => self.store.exceptions_of(prev.id).await?,
            None => Vec::new(),
        };

        let mut exceptions = Vec::with_capacity(group.exceptions.len());
        let mut changed_exceptions = Vec::new();
        for data in &group.exceptions {
            let import_id = data.import_id();
            let prev = stored_exceptions.iter().find(|e| e.import_id == import_id);
            let exception_changed = prev.is_none_or(|p| !p.data.same_content(data));
            let data = match prev {
                Some(p) => with_sequence(data.clone(), &p.data, exception_changed),
                None => data.clone(),
            };
            let event = Event {
                id: prev.map(|p| p.id).unwrap_or_default(),
                calendar_id: calendar_id.clone(),
                import_id,
                href: Some(href.to_string()),
                etag: Some(etag.to_string()),
                original_event_id: Some(master.id),
                sync_state: SyncState::Synced,
                data,
            };
            if exception_changed {
                changed_exceptions.push(event.clone());
            }
            exceptions.push(event);
        }
        let removed: Vec<&Event> = stored_exceptions
            .iter()
            .filter(|stored| !exceptions.iter().any(|e| e.id == stored.id))
            .collect();

        // Work out occurrences before writing anything, so a bad rule skips the whole group
        let occurrence_writes = if regenerate {
            match materialize(&master, &exceptions, &self.window, self.max_instances) {
                Ok(occurrences) => vec![StoreWrite::ReplaceOccurrences {
                    master: master.id,
                    occurrences,
                }],
                Err(e) => {
                    warn!(uid = %group.uid, %href, error = %e, "Could not expand recurrence");
                    self.tally.failures += 1;
                    return Ok(GroupOutcome::Skipped);
                }
            }
        } else if changed_exceptions.is_empty() && removed.is_empty() {
            Vec::new()
        } else {
            let mut occurrences = self.store.occurrences_of(master.id).await?;
            let mut touched = BTreeSet::new();
            for stale in &removed {
                if let Some(instance) = stale.original_instance_time()
                    && unlink_exception(&mut occurrences, &master, instance)
                {
                    touched.insert(instance);
                }
            }
            for exception in &changed_exceptions {
                if link_exception(&mut occurrences, &master, exception) != LinkOutcome::Unmatched
                    && let Some(instance) = exception.original_instance_time()
                {
                    touched.insert(instance);
                }
            }
            occurrences
                .into_iter()
                .filter(|o| touched.contains(&o.instance_time))
                .map(StoreWrite::PutOccurrence)
                .collect()
        };

        match (&previous, changed || !changed_exceptions.is_empty() || !removed.is_empty()) {
            (None, _) => self.tally.created += 1,
            (Some(_), true) => self.tally.updated += 1,
            (Some(_), false) => {}
        }

        kept.insert(master.id);
        let master_id = master.id;
        self.put_event(master);
        for exception in exceptions {
            kept.insert(exception.id);
            self.put_event(exception);
        }
        self.batch.extend(occurrence_writes);
        for stale in removed {
            debug!(uid = %group.uid, import_id = %stale.import_id, "Exception removed on the server");
            self.delete(stale.id);
        }
        debug!(uid = %group.uid, master = %master_id, regenerate, "Applied event group");
        Ok(GroupOutcome::Applied)
    }
}

/// Keep SEQUENCE monotonic: a content change always moves past the stored value.
fn with_sequence(mut incoming: EventData, stored: &EventData, changed: bool) -> EventData {
    incoming.sequence = if changed {
        incoming.sequence.max(stored.sequence + 1)
    } else {
        incoming.sequence.max(stored.sequence)
    };
    incoming
}
