//! Pulling server changes into the local store.
//!
//! A pull walks through these phases:
//!
//! 1. `CheckChangeToken`: compare the collection ctag with the cursor.
//!    Nothing else happens when it matches.
//! 2. `Incremental`: ask for changes since the stored sync token. An expired
//!    token falls through to a full resync.
//! 3. `FullResync`: list every etag in the window and diff it against the
//!    rows stored locally.
//! 4. `ApplyBatch`: fetch changed bodies, build one store batch holding every
//!    row change plus the new cursor, and commit it.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::calendar::Calendar;
use crate::cursor::SyncCursor;
use crate::error::CalSyncResult;
use crate::event::SyncState;
use crate::remote::{CalendarRemote, ChangeReport, DavError};
use crate::store::{CalendarStore, StoreWrite};
use crate::sync::apply::BatchBuilder;
use crate::sync::conflict::{ParseFailureDecision, on_parse_failures};
use crate::sync::engine::SyncEngine;
use crate::sync::report::{SyncNotice, SyncReport};

#[derive(Debug)]
enum PullPhase {
    CheckChangeToken,
    Incremental { token: String },
    FullResync,
    ApplyBatch(FetchPlan),
    Done,
}

/// What the apply phase has to do, and where the cursor goes afterwards.
#[derive(Debug, Default)]
struct FetchPlan {
    full: bool,
    fetch: Vec<String>,
    remove: Vec<String>,
    ctag: Option<String>,
    sync_token: Option<String>,
}

impl<R: CalendarRemote, S: CalendarStore> SyncEngine<R, S> {
    pub(crate) async fn pull(&self, calendar: &Calendar, report: &mut SyncReport) -> CalSyncResult<()> {
        let cursor = self.store.cursor(&calendar.id).await?;
        let mut remote_ctag: Option<String> = None;
        let mut phase = PullPhase::CheckChangeToken;

        loop {
            phase = match phase {
                PullPhase::CheckChangeToken => {
                    remote_ctag = self.remote.get_ctag(&calendar.href).await?;
                    if cursor.is_current(remote_ctag.as_deref()) {
                        debug!(calendar = %calendar.name, "Collection unchanged");
                        report.up_to_date = true;
                        PullPhase::Done
                    } else {
                        match &cursor.sync_token {
                            Some(token) if cursor.deferred_orphans.is_empty() => {
                                PullPhase::Incremental {
                                    token: token.clone(),
                                }
                            }
                            _ => PullPhase::FullResync,
                        }
                    }
                }
                PullPhase::Incremental { token } => {
                    match self.remote.sync_collection(&calendar.href, &token).await {
                        Ok(changes) => PullPhase::ApplyBatch(
                            self.plan_incremental(calendar, changes, &token, remote_ctag.clone())
                                .await?,
                        ),
                        Err(DavError::TokenExpired) => {
                            info!(calendar = %calendar.name, "Sync token expired, running full resync");
                            PullPhase::FullResync
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                PullPhase::FullResync => {
                    PullPhase::ApplyBatch(self.plan_full_resync(calendar, remote_ctag.clone()).await?)
                }
                PullPhase::ApplyBatch(plan) => {
                    self.apply_plan(calendar, &cursor, plan, report).await?;
                    PullPhase::Done
                }
                PullPhase::Done => return Ok(()),
            };
        }
    }

    /// Etag of every href stored locally.
    async fn local_etags(&self, calendar: &Calendar) -> CalSyncResult<HashMap<String, String>> {
        let events = self.store.events(&calendar.id).await?;
        Ok(events
            .into_iter()
            .filter_map(|e| Some((e.href?, e.etag.unwrap_or_default())))
            .collect())
    }

    async fn plan_incremental(
        &self,
        calendar: &Calendar,
        changes: ChangeReport,
        token: &str,
        ctag: Option<String>,
    ) -> CalSyncResult<FetchPlan> {
        let local = self.local_etags(calendar).await?;
        let fetch = changes
            .changed
            .into_iter()
            .filter(|tag| tag.etag.is_empty() || local.get(&tag.href) != Some(&tag.etag))
            .map(|tag| tag.href)
            .collect::<Vec<_>>();
        debug!(
            calendar = %calendar.name,
            changed = fetch.len(),
            deleted = changes.deleted.len(),
            "Incremental changes"
        );
        Ok(FetchPlan {
            full: false,
            fetch,
            remove: changes.deleted,
            ctag,
            sync_token: changes.new_token.or_else(|| Some(token.to_string())),
        })
    }

    async fn plan_full_resync(&self, calendar: &Calendar, ctag: Option<String>) -> CalSyncResult<FetchPlan> {
        // Token first: changes made while listing show up in the next incremental pull
        let sync_token = self.remote.get_sync_token(&calendar.href).await?;
        let window = self.window();
        let remote_tags = self.remote.list_etags(&calendar.href, &window).await?;
        let remote: HashMap<&str, &str> = remote_tags
            .iter()
            .map(|t| (t.href.as_str(), t.etag.as_str()))
            .collect();

        let local = self.local_etags(calendar).await?;
        let fetch: Vec<String> = remote_tags
            .iter()
            .filter(|t| local.get(&t.href) != Some(&t.etag))
            .map(|t| t.href.clone())
            .collect();

        // Only events inside the window can be judged missing; older ones were never listed
        let mut remove = Vec::new();
        for event in self.store.events(&calendar.id).await? {
            let Some(href) = &event.href else { continue };
            if event.is_exception()
                || event.sync_state != SyncState::Synced
                || remote.contains_key(href.as_str())
                || remove.contains(href)
            {
                continue;
            }
            let materialized = !self.store.occurrences_of(event.id).await?.is_empty();
            if materialized || window.overlaps(event.data.start, event.data.end) {
                remove.push(href.clone());
            }
        }

        info!(
            calendar = %calendar.name,
            listed = remote_tags.len(),
            fetch = fetch.len(),
            remove = remove.len(),
            "Full resync"
        );
        Ok(FetchPlan {
            full: true,
            fetch,
            remove,
            ctag,
            sync_token,
        })
    }

    async fn apply_plan(
        &self,
        calendar: &Calendar,
        cursor: &SyncCursor,
        plan: FetchPlan,
        report: &mut SyncReport,
    ) -> CalSyncResult<()> {
        let mut builder = BatchBuilder::new(
            self.store.as_ref(),
            calendar,
            self.window(),
            self.config.max_instances,
        );

        for href in &plan.remove {
            builder.remove_href(href).await?;
        }
        for chunk in plan.fetch.chunks(self.config.multiget_batch_size.max(1)) {
            let resources = self.remote.fetch_resources(&calendar.href, chunk).await?;
            if resources.len() < chunk.len() {
                debug!(
                    requested = chunk.len(),
                    received = resources.len(),
                    "Some resources disappeared before they could be fetched"
                );
            }
            for resource in &resources {
                builder.apply_resource(resource, false).await?;
            }
        }

        let failures = builder.tally.failures;
        let mut next = cursor.clone();
        let advance = if failures == 0 {
            next.parse_failures = 0;
            next.warning = None;
            true
        } else {
            match on_parse_failures(cursor.parse_failures, self.config.parse_failure_threshold) {
                ParseFailureDecision::Hold => {
                    next.parse_failures += 1;
                    warn!(
                        calendar = %calendar.name,
                        failures,
                        attempt = next.parse_failures,
                        "Parse failures, keeping the cursor for a retry"
                    );
                    report.notices.push(SyncNotice::ParseFailures {
                        count: failures,
                        held: true,
                    });
                    false
                }
                ParseFailureDecision::AdvanceWithWarning => {
                    next.parse_failures = 0;
                    let message = format!(
                        "{} item(s) in {} could not be read and were skipped",
                        failures, calendar.name
                    );
                    warn!(calendar = %calendar.name, failures, "Giving up on unparseable items");
                    next.warning = Some(message);
                    report.notices.push(SyncNotice::ParseFailures {
                        count: failures,
                        held: false,
                    });
                    true
                }
            }
        };
        if advance {
            next.ctag = plan.ctag;
            next.sync_token = plan.sync_token;
        }

        let orphans = builder.tally.orphans.clone();
        if plan.full {
            // A full resync was the reconciliation attempt; whatever is still orphaned stays a warning
            next.deferred_orphans.clear();
            if !orphans.is_empty() && next.warning.is_none() {
                next.warning = Some(format!(
                    "{} series in {} have modified instances without their master",
                    orphans.len(),
                    calendar.name
                ));
            }
        } else {
            next.deferred_orphans
                .extend(orphans.iter().map(|(_, href)| href.clone()));
        }
        for (uid, href) in orphans {
            report.notices.push(SyncNotice::OrphanExceptions { uid, href });
        }
        next.last_synced = Some(Utc::now());
        builder.push(StoreWrite::PutCursor(next));

        let (batch, tally) = builder.finish();
        self.store.apply(batch).await?;

        report.full_resync |= plan.full;
        report.pulled.created += tally.created;
        report.pulled.updated += tally.updated;
        report.pulled.deleted += tally.deleted;
        if tally.skipped_local > 0 {
            debug!(skipped = tally.skipped_local, "Left events with pending local changes alone");
        }
        Ok(())
    }
}
