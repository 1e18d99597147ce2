//! Per-account sync orchestration.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::calendar::Calendar;
use crate::config::SyncConfig;
use crate::date_range::DateRange;
use crate::error::{CalSyncError, CalSyncResult};
use crate::event::{CalendarId, SyncState};
use crate::occurrence::materialize;
use crate::remote::CalendarRemote;
use crate::store::{CalendarStore, StoreBatch, StoreWrite};
use crate::sync::edits::LocalEditor;
use crate::sync::report::{SyncNotice, SyncReport};

/// Result of asking for a calendar to be synced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another run for the same calendar was in progress; nothing was done.
    AlreadyRunning,
}

/// Syncs the calendars of one account between a server and the local store.
///
/// Runs for different calendars may proceed concurrently; a second request
/// for a calendar that is already syncing returns [`SyncOutcome::AlreadyRunning`].
pub struct SyncEngine<R, S> {
    pub(crate) account: String,
    pub(crate) remote: R,
    pub(crate) store: Arc<S>,
    pub(crate) config: SyncConfig,
    in_flight: Mutex<HashSet<CalendarId>>,
    discovered: OnceCell<Vec<Calendar>>,
}

/// Marks a calendar as syncing until dropped.
struct InFlight<'a> {
    running: &'a Mutex<HashSet<CalendarId>>,
    calendar_id: CalendarId,
}

impl<'a> InFlight<'a> {
    fn acquire(running: &'a Mutex<HashSet<CalendarId>>, calendar_id: &CalendarId) -> Option<Self> {
        if !running.lock().insert(calendar_id.clone()) {
            return None;
        }
        Some(InFlight {
            running,
            calendar_id: calendar_id.clone(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.running.lock().remove(&self.calendar_id);
    }
}

impl<R: CalendarRemote, S: CalendarStore> SyncEngine<R, S> {
    pub fn new(account: impl Into<String>, remote: R, store: Arc<S>, config: SyncConfig) -> Self {
        SyncEngine {
            account: account.into(),
            remote,
            store,
            config,
            in_flight: Mutex::new(HashSet::new()),
            discovered: OnceCell::new(),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Materialization window around the current time.
    pub fn window(&self) -> DateRange {
        DateRange::around(Utc::now(), self.config.past_days, self.config.future_days)
    }

    /// Entry point for local edits against this account's store.
    pub fn editor(&self) -> LocalEditor<S> {
        LocalEditor::new(Arc::clone(&self.store), self.config.clone())
    }

    /// Find the account's event calendars and record them locally.
    ///
    /// The result is cached after the first success.
    pub async fn discover(&self) -> CalSyncResult<Vec<Calendar>> {
        self.discovered
            .get_or_try_init(|| self.run_discovery())
            .await
            .cloned()
    }

    async fn run_discovery(&self) -> CalSyncResult<Vec<Calendar>> {
        let principal = self.remote.discover_principal().await?;
        let homes = self.remote.discover_calendar_homes(&principal).await?;
        debug!(account = %self.account, %principal, homes = homes.len(), "Found calendar homes");

        let known = self.store.calendars().await?;
        let mut calendars: Vec<Calendar> = Vec::new();
        let mut batch = StoreBatch::new();
        for home in &homes {
            for remote in self.remote.list_calendars(home).await? {
                if !remote.supports_events() {
                    debug!(href = %remote.href, "Skipping collection without events");
                    continue;
                }
                let mut calendar = Calendar::from_remote(&self.account, &remote);
                if calendars.iter().any(|c| c.id == calendar.id) {
                    continue;
                }
                if let Some(existing) = known.iter().find(|c| c.id == calendar.id) {
                    calendar.enabled = existing.enabled;
                }
                batch.push(StoreWrite::PutCalendar(calendar.clone()));
                calendars.push(calendar);
            }
        }
        self.store.apply(batch).await?;

        info!(account = %self.account, calendars = calendars.len(), "Discovered calendars");
        Ok(calendars)
    }

    /// Pull then push one calendar.
    pub async fn sync_now(&self, calendar_id: &CalendarId) -> CalSyncResult<SyncOutcome> {
        let Some(_running) = InFlight::acquire(&self.in_flight, calendar_id) else {
            debug!(calendar = %calendar_id, "Sync already running");
            return Ok(SyncOutcome::AlreadyRunning);
        };

        self.discover().await?;
        let calendar = self
            .store
            .calendar(calendar_id)
            .await?
            .ok_or_else(|| CalSyncError::CalendarNotFound(calendar_id.to_string()))?;

        let mut report = SyncReport::new(calendar.id.clone());
        self.pull(&calendar, &mut report).await?;
        self.push(&calendar, &mut report).await?;

        let cursor = self.store.cursor(&calendar.id).await?;
        if let Some(warning) = cursor.warning {
            let reported = report
                .notices
                .iter()
                .any(|n| matches!(n, SyncNotice::ParseFailures { held: false, .. }));
            if !reported {
                report.notices.push(SyncNotice::CursorWarning(warning));
            }
        }

        info!(
            calendar = %calendar.name,
            pulled = report.pulled.total(),
            pushed = report.pushed.total(),
            full_resync = report.full_resync,
            "Sync complete"
        );
        Ok(SyncOutcome::Completed(report))
    }

    /// Sync every enabled calendar of the account concurrently.
    pub async fn sync_all(&self) -> CalSyncResult<Vec<(CalendarId, CalSyncResult<SyncOutcome>)>> {
        let calendars = self.discover().await?;
        let stored = self.store.calendars().await?;
        let enabled: Vec<CalendarId> = calendars
            .iter()
            .filter(|c| stored.iter().any(|s| s.id == c.id && s.enabled))
            .map(|c| c.id.clone())
            .collect();

        let runs = enabled.into_iter().map(|id| async move {
            let outcome = self.sync_now(&id).await;
            if let Err(e) = &outcome {
                warn!(calendar = %id, error = %e, "Sync failed");
            }
            (id, outcome)
        });
        Ok(join_all(runs).await)
    }

    /// Rebuild every occurrence of a calendar for the current window.
    ///
    /// Returns the number of occurrence rows written.
    pub async fn rematerialize(&self, calendar_id: &CalendarId) -> CalSyncResult<usize> {
        let window = self.window();
        let events = self.store.events(calendar_id).await?;

        let mut batch = StoreBatch::new();
        let mut rows = 0;
        for master in events
            .iter()
            .filter(|e| !e.is_exception() && e.sync_state != SyncState::LocallyDeleted)
        {
            let exceptions: Vec<_> = events
                .iter()
                .filter(|e| e.original_event_id == Some(master.id))
                .cloned()
                .collect();
            let occurrences =
                match materialize(master, &exceptions, &window, self.config.max_instances) {
                    Ok(occurrences) => occurrences,
                    Err(e) => {
                        warn!(uid = %master.uid(), error = %e, "Could not expand recurrence");
                        continue;
                    }
                };
            rows += occurrences.len();
            batch.push(StoreWrite::ReplaceOccurrences {
                master: master.id,
                occurrences,
            });
        }
        self.store.apply(batch).await?;

        debug!(calendar = %calendar_id, rows, "Rematerialized occurrences");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{ChangeReport, DavError, DavResult, RemoteCalendar, Resource, ResourceTag};
    use crate::store::MemoryStore;

    /// A server that can't be reached.
    struct Offline;

    fn offline<T>() -> DavResult<T> {
        Err(DavError::Transient("connection refused".into()))
    }

    impl CalendarRemote for Offline {
        async fn discover_principal(&self) -> DavResult<String> {
            offline()
        }
        async fn discover_calendar_homes(&self, _principal: &str) -> DavResult<Vec<String>> {
            offline()
        }
        async fn list_calendars(&self, _home: &str) -> DavResult<Vec<RemoteCalendar>> {
            offline()
        }
        async fn get_ctag(&self, _calendar: &str) -> DavResult<Option<String>> {
            offline()
        }
        async fn get_sync_token(&self, _calendar: &str) -> DavResult<Option<String>> {
            offline()
        }
        async fn sync_collection(&self, _calendar: &str, _token: &str) -> DavResult<ChangeReport> {
            offline()
        }
        async fn list_etags(&self, _calendar: &str, _range: &DateRange) -> DavResult<Vec<ResourceTag>> {
            offline()
        }
        async fn fetch_resources(&self, _calendar: &str, _hrefs: &[String]) -> DavResult<Vec<Resource>> {
            offline()
        }
        async fn create_resource(&self, _href: &str, _body: &str) -> DavResult<Option<String>> {
            offline()
        }
        async fn update_resource(&self, _href: &str, _body: &str, _etag: &str) -> DavResult<Option<String>> {
            offline()
        }
        async fn delete_resource(&self, _href: &str, _etag: Option<&str>) -> DavResult<()> {
            offline()
        }
    }

    fn engine() -> SyncEngine<Offline, MemoryStore> {
        SyncEngine::new("test", Offline, Arc::new(MemoryStore::new()), SyncConfig::default())
    }

    #[test]
    fn test_in_flight_guard_is_released_on_drop() {
        let running = Mutex::new(HashSet::new());
        let home = CalendarId::new("test:/dav/home/");
        let work = CalendarId::new("test:/dav/work/");

        let guard = InFlight::acquire(&running, &home);
        assert!(guard.is_some());
        assert!(InFlight::acquire(&running, &home).is_none());
        assert!(InFlight::acquire(&running, &work).is_some());

        drop(guard);
        assert!(running.lock().is_empty());
        assert!(InFlight::acquire(&running, &home).is_some());
    }

    #[tokio::test]
    async fn test_second_sync_of_running_calendar_is_coalesced() {
        let engine = engine();
        let home = CalendarId::new("test:/dav/home/");

        let held = InFlight::acquire(&engine.in_flight, &home);
        assert!(held.is_some());
        assert_eq!(engine.sync_now(&home).await.unwrap(), SyncOutcome::AlreadyRunning);

        // Once released, the run reaches the server
        drop(held);
        let err = engine.sync_now(&home).await.unwrap_err();
        assert!(matches!(err, CalSyncError::Remote(DavError::Transient(_))));

        // A failed run releases its guard as well
        assert!(engine.in_flight.lock().is_empty());
    }
}
