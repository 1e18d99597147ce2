//! JSON snapshot of the in-memory tables.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::calendar::Calendar;
use crate::cursor::SyncCursor;
use crate::error::{CalSyncError, CalSyncResult};
use crate::event::Event;
use crate::occurrence::Occurrence;
use crate::pending::PendingOperation;
use crate::store::memory::Tables;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
pub(super) struct Snapshot {
    pub(super) version: u32,
    pub(super) next_seq: u64,
    pub(super) calendars: Vec<Calendar>,
    pub(super) events: Vec<Event>,
    pub(super) occurrences: Vec<Occurrence>,
    pub(super) operations: Vec<PendingOperation>,
    pub(super) cursors: Vec<SyncCursor>,
}

impl Snapshot {
    pub(super) fn from_tables(tables: &Tables) -> Self {
        let mut events: Vec<Event> = tables.events.values().cloned().collect();
        // Masters before their exceptions, for deterministic output
        events.sort_by(|a, b| {
            (&a.calendar_id, &a.import_id).cmp(&(&b.calendar_id, &b.import_id))
        });
        Snapshot {
            version: SNAPSHOT_VERSION,
            next_seq: tables.next_seq,
            calendars: tables.calendars.values().cloned().collect(),
            events,
            occurrences: tables.occurrences.values().cloned().collect(),
            operations: tables.operations.values().cloned().collect(),
            cursors: tables.cursors.values().cloned().collect(),
        }
    }

    pub(super) fn load(path: &Path) -> CalSyncResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&content)
            .map_err(|e| CalSyncError::Serialization(format!("{}: {}", path.display(), e)))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(CalSyncError::Store(format!(
                "Unsupported state file version {} in {}",
                snapshot.version,
                path.display()
            )));
        }
        Ok(Some(snapshot))
    }

    /// Write to a temp file next to `path`, then rename over it.
    pub(super) fn save(&self, path: &Path) -> CalSyncResult<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| CalSyncError::Serialization(e.to_string()))?;

        let temp = path.with_extension("json.tmp");
        std::fs::write(&temp, content)?;
        std::fs::rename(&temp, path)?;
        Ok(())
    }
}
