//! Draining the pending-operation queue to the server.
//!
//! Operations run in creation order. Once an operation for an event fails or
//! is waiting on its backoff, later operations for the same event wait too.
//! An operation is removed only in the same batch that records the server's
//! acknowledgement locally.

use std::collections::HashSet;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::calendar::Calendar;
use crate::error::{CalSyncError, CalSyncResult};
use crate::event::{Event, EventId, SyncState};
use crate::ics::generate_ics;
use crate::pending::{MovePhase, OperationKind, OperationState, PendingOperation};
use crate::remote::{CalendarRemote, DavError};
use crate::store::{CalendarStore, StoreBatch, StoreWrite};
use crate::sync::apply::BatchBuilder;
use crate::sync::conflict::{FailureClass, classify};
use crate::sync::engine::SyncEngine;
use crate::sync::report::{SyncNotice, SyncReport};

impl<R: CalendarRemote, S: CalendarStore> SyncEngine<R, S> {
    pub(crate) async fn push(&self, calendar: &Calendar, report: &mut SyncReport) -> CalSyncResult<()> {
        let operations = self.store.pending_operations(&calendar.id).await?;
        let now = Utc::now();
        let mut blocked: HashSet<EventId> = HashSet::new();

        for op in operations {
            if blocked.contains(&op.event_id) {
                continue;
            }
            if !op.is_due(now) {
                blocked.insert(op.event_id);
                continue;
            }

            debug!(kind = op.kind.label(), event = %op.event_id, seq = op.seq, "Pushing operation");
            let result = match &op.kind {
                OperationKind::Create => self.push_create(calendar, &op, report).await,
                OperationKind::Update => self.push_update(calendar, &op, report).await,
                OperationKind::Delete => self.push_delete(calendar, &op, report).await,
                OperationKind::Move { .. } => self.push_move(calendar, op.clone(), report).await,
            };
            if let Err(error) = result {
                blocked.insert(op.event_id);
                // A move may have persisted its next phase before failing
                let op = if matches!(op.kind, OperationKind::Move { .. }) {
                    let op_id = op.id;
                    self.store
                        .pending_operations(&calendar.id)
                        .await?
                        .into_iter()
                        .find(|stored| stored.id == op_id)
                        .unwrap_or(op)
                } else {
                    op
                };
                self.handle_failure(calendar, op, error, report).await?;
            }
        }
        Ok(())
    }

    async fn handle_failure(
        &self,
        calendar: &Calendar,
        mut op: PendingOperation,
        error: CalSyncError,
        report: &mut SyncReport,
    ) -> CalSyncResult<()> {
        // Local storage failures abort the run
        if matches!(error, CalSyncError::Store(_)) {
            return Err(error);
        }

        let moving = matches!(op.kind, OperationKind::Move { .. });
        match classify(&error, &op.kind) {
            FailureClass::Conflict if !moving => {
                return self.resolve_remote_wins(calendar, op, report).await;
            }
            FailureClass::AlreadyApplied => {
                debug!(kind = op.kind.label(), event = %op.event_id, "Server already reflects operation");
                let mut batch = StoreBatch::new();
                batch.push(StoreWrite::RemoveOperation(op.id));
                return self.store.apply(batch).await;
            }
            FailureClass::Transient => {
                op.record_transient_failure(&error.to_string(), Utc::now(), &self.config.retry.backoff());
                if op.state == OperationState::Queued {
                    info!(
                        kind = op.kind.label(),
                        event = %op.event_id,
                        attempt = op.retry_count,
                        error = %error,
                        "Push failed, will retry"
                    );
                }
            }
            FailureClass::Conflict | FailureClass::Permanent => {
                op.record_permanent_failure(&error.to_string());
            }
        }

        if op.state == OperationState::NeedsAttention {
            warn!(kind = op.kind.label(), event = %op.event_id, error = %error, "Operation needs attention");
            report.notices.push(SyncNotice::OperationFlagged {
                event_id: op.event_id,
                kind: op.kind.label(),
                error: error.to_string(),
            });
        }
        let mut batch = StoreBatch::new();
        batch.push(StoreWrite::PutOperation(op));
        self.store.apply(batch).await
    }

    /// The event and its exceptions, or `None` when the event is gone locally.
    async fn load_resource(&self, event_id: EventId) -> CalSyncResult<Option<(Event, Vec<Event>)>> {
        let Some(event) = self.store.event(event_id).await? else {
            return Ok(None);
        };
        let exceptions = self.store.exceptions_of(event.id).await?;
        Ok(Some((event, exceptions)))
    }

    async fn drop_operation(&self, op: &PendingOperation) -> CalSyncResult<()> {
        debug!(kind = op.kind.label(), event = %op.event_id, "Event no longer exists, dropping operation");
        let mut batch = StoreBatch::new();
        batch.push(StoreWrite::RemoveOperation(op.id));
        self.store.apply(batch).await
    }

    /// Etag of `href` as the server reports it now.
    async fn fetch_etag(&self, calendar: &Calendar, href: &str) -> CalSyncResult<Option<String>> {
        let resources = self
            .remote
            .fetch_resources(&calendar.href, &[href.to_string()])
            .await?;
        Ok(resources.into_iter().find(|r| r.href == href).map(|r| r.etag))
    }

    async fn push_create(
        &self,
        calendar: &Calendar,
        op: &PendingOperation,
        report: &mut SyncReport,
    ) -> CalSyncResult<()> {
        let Some((event, exceptions)) = self.load_resource(op.event_id).await? else {
            return self.drop_operation(op).await;
        };
        let href = event
            .href
            .clone()
            .unwrap_or_else(|| calendar.event_href(event.uid()));
        let body = render(&event, &exceptions)?;

        let etag = match self.remote.create_resource(&href, &body).await {
            Ok(etag) => etag,
            Err(DavError::AlreadyExists(_)) => {
                // An earlier attempt got through before we could record it
                info!(%href, "Resource already exists, adopting the server copy");
                return self.adopt_server_copy(calendar, op, &href, report).await;
            }
            Err(e) => return Err(e.into()),
        };
        let etag = match etag {
            Some(etag) => Some(etag),
            None => self.fetch_etag(calendar, &href).await?,
        };

        let mut batch = StoreBatch::new();
        mark_synced(&mut batch, event, exceptions, &href, etag);
        batch.push(StoreWrite::RemoveOperation(op.id));
        self.store.apply(batch).await?;
        report.pushed.created += 1;
        Ok(())
    }

    async fn push_update(
        &self,
        calendar: &Calendar,
        op: &PendingOperation,
        report: &mut SyncReport,
    ) -> CalSyncResult<()> {
        let Some((event, exceptions)) = self.load_resource(op.event_id).await? else {
            return self.drop_operation(op).await;
        };
        let Some(href) = event.href.clone() else {
            return Err(CalSyncError::InvalidEdit(format!(
                "'{}' was never uploaded, nothing to update",
                event.import_id
            )));
        };
        let body = render(&event, &exceptions)?;
        let etag = match event.etag.clone() {
            Some(etag) => etag,
            None => self
                .fetch_etag(calendar, &href)
                .await?
                .ok_or_else(|| DavError::NotFound(href.clone()))?,
        };

        let new_etag = match self.remote.update_resource(&href, &body, &etag).await? {
            Some(etag) => Some(etag),
            None => self.fetch_etag(calendar, &href).await?,
        };

        let mut batch = StoreBatch::new();
        mark_synced(&mut batch, event, exceptions, &href, new_etag);
        batch.push(StoreWrite::RemoveOperation(op.id));
        self.store.apply(batch).await?;
        report.pushed.updated += 1;
        Ok(())
    }

    async fn push_delete(
        &self,
        _calendar: &Calendar,
        op: &PendingOperation,
        report: &mut SyncReport,
    ) -> CalSyncResult<()> {
        let Some(event) = self.store.event(op.event_id).await? else {
            return self.drop_operation(op).await;
        };
        // A copy that is already gone counts as deleted
        if let Some(href) = &event.href {
            self.remote.delete_resource(href, event.etag.as_deref()).await?;
        }

        let mut batch = StoreBatch::new();
        batch.push(StoreWrite::DeleteEvent(event.id));
        batch.push(StoreWrite::RemoveOperation(op.id));
        self.store.apply(batch).await?;
        report.pushed.deleted += 1;
        Ok(())
    }

    /// Create at the destination, persist the phase, then delete at the source.
    async fn push_move(
        &self,
        calendar: &Calendar,
        mut op: PendingOperation,
        report: &mut SyncReport,
    ) -> CalSyncResult<()> {
        let OperationKind::Move {
            source_href,
            source_etag,
            phase,
            ..
        } = op.kind.clone()
        else {
            return Ok(());
        };

        if phase == MovePhase::CreateAtDestination {
            let Some((event, exceptions)) = self.load_resource(op.event_id).await? else {
                return self.drop_operation(&op).await;
            };
            let href = event
                .href
                .clone()
                .unwrap_or_else(|| calendar.event_href(event.uid()));
            let body = render(&event, &exceptions)?;
            let etag = match self.remote.create_resource(&href, &body).await {
                Ok(etag) => etag,
                Err(DavError::AlreadyExists(_)) => {
                    debug!(%href, "Destination already has the event");
                    None
                }
                Err(e) => return Err(e.into()),
            };
            let etag = match etag {
                Some(etag) => Some(etag),
                None => self.fetch_etag(calendar, &href).await?,
            };

            if let OperationKind::Move { phase, .. } = &mut op.kind {
                *phase = MovePhase::DeleteAtSource;
            }
            let mut batch = StoreBatch::new();
            mark_synced(&mut batch, event, exceptions, &href, etag);
            batch.push(StoreWrite::PutOperation(op.clone()));
            self.store.apply(batch).await?;
        }

        self.remote
            .delete_resource(&source_href, source_etag.as_deref())
            .await?;

        let mut batch = StoreBatch::new();
        batch.push(StoreWrite::RemoveOperation(op.id));
        self.store.apply(batch).await?;
        report.pushed.updated += 1;
        Ok(())
    }

    /// The server rejected our copy as stale: replace local state with the server's.
    async fn resolve_remote_wins(
        &self,
        calendar: &Calendar,
        mut op: PendingOperation,
        report: &mut SyncReport,
    ) -> CalSyncResult<()> {
        let Some(event) = self.store.event(op.event_id).await? else {
            return self.drop_operation(&op).await;
        };
        let Some(href) = event.href.clone() else {
            op.record_permanent_failure("conflict on an event that was never uploaded");
            let mut batch = StoreBatch::new();
            batch.push(StoreWrite::PutOperation(op));
            return self.store.apply(batch).await;
        };

        let resources = self
            .remote
            .fetch_resources(&calendar.href, std::slice::from_ref(&href))
            .await?;
        let mut builder = BatchBuilder::new(
            self.store.as_ref(),
            calendar,
            self.window(),
            self.config.max_instances,
        );
        match resources.into_iter().find(|r| r.href == href) {
            Some(resource) => builder.apply_resource(&resource, true).await?,
            // Gone on the server as well
            None => builder.delete(event.id),
        }

        if builder.tally.failures > 0 {
            op.record_permanent_failure("server copy could not be parsed while resolving a conflict");
            report.notices.push(SyncNotice::OperationFlagged {
                event_id: op.event_id,
                kind: op.kind.label(),
                error: "conflict could not be resolved".into(),
            });
            let mut batch = StoreBatch::new();
            batch.push(StoreWrite::PutOperation(op));
            return self.store.apply(batch).await;
        }

        builder.push(StoreWrite::RemoveOperation(op.id));
        let (batch, _) = builder.finish();
        self.store.apply(batch).await?;

        warn!(%href, summary = %event.data.summary, "Server changed the event, local edit discarded");
        report.notices.push(SyncNotice::RemoteWins {
            summary: event.data.summary,
            href,
        });
        Ok(())
    }

    /// Mirror the server's copy of `href` and consider `op` done.
    async fn adopt_server_copy(
        &self,
        calendar: &Calendar,
        op: &PendingOperation,
        href: &str,
        report: &mut SyncReport,
    ) -> CalSyncResult<()> {
        let resources = self
            .remote
            .fetch_resources(&calendar.href, &[href.to_string()])
            .await?;
        let mut builder = BatchBuilder::new(
            self.store.as_ref(),
            calendar,
            self.window(),
            self.config.max_instances,
        );
        let Some(resource) = resources.into_iter().find(|r| r.href == href) else {
            return Err(DavError::Transient(format!("{href} exists but could not be fetched")).into());
        };
        builder.apply_resource(&resource, true).await?;
        builder.push(StoreWrite::RemoveOperation(op.id));
        let (batch, _) = builder.finish();
        self.store.apply(batch).await?;
        report.pushed.created += 1;
        Ok(())
    }
}

fn render(master: &Event, exceptions: &[Event]) -> CalSyncResult<String> {
    let exceptions: Vec<_> = exceptions.iter().map(|e| e.data.clone()).collect();
    generate_ics(&master.data, &exceptions)
}

fn mark_synced(
    batch: &mut StoreBatch,
    master: Event,
    exceptions: Vec<Event>,
    href: &str,
    etag: Option<String>,
) {
    for mut event in std::iter::once(master).chain(exceptions) {
        event.href = Some(href.to_string());
        event.etag = etag.clone();
        event.sync_state = SyncState::Synced;
        batch.push(StoreWrite::PutEvent(event));
    }
}
