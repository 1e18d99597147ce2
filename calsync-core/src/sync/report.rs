//! Per-calendar summary of a sync run.

use std::fmt;

use crate::event::{CalendarId, EventId};

/// Counts of changes in one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl ChangeCounts {
    pub fn total(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

/// Something the user should hear about that didn't fail the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotice {
    /// A local edit was rejected by the server and replaced by its version.
    RemoteWins { summary: String, href: String },
    /// Resources that could not be parsed; `held` means the cursor stayed put for a retry.
    ParseFailures { count: usize, held: bool },
    /// Exceptions whose master wasn't in the same resource.
    OrphanExceptions { uid: String, href: String },
    /// A pending operation gave up and needs attention.
    OperationFlagged {
        event_id: EventId,
        kind: &'static str,
        error: String,
    },
    /// Persistent warning carried on the calendar's cursor.
    CursorWarning(String),
}

impl fmt::Display for SyncNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncNotice::RemoteWins { summary, href } => write!(
                f,
                "Local changes to \"{}\" were replaced by the server version ({})",
                summary, href
            ),
            SyncNotice::ParseFailures { count, held } if *held => write!(
                f,
                "{} item(s) could not be parsed, will retry on next sync",
                count
            ),
            SyncNotice::ParseFailures { count, .. } => {
                write!(f, "{} item(s) could not be parsed and were skipped", count)
            }
            SyncNotice::OrphanExceptions { uid, href } => write!(
                f,
                "Modified instances of {} arrived without their series ({})",
                uid, href
            ),
            SyncNotice::OperationFlagged {
                event_id,
                kind,
                error,
            } => write!(f, "Pending {} of {} needs attention: {}", kind, event_id, error),
            SyncNotice::CursorWarning(message) => f.write_str(message),
        }
    }
}

/// Outcome of syncing one calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub calendar_id: CalendarId,
    /// Server changes applied locally
    pub pulled: ChangeCounts,
    /// Local changes confirmed by the server
    pub pushed: ChangeCounts,
    /// Whether the pull enumerated the whole window instead of using the sync token
    pub full_resync: bool,
    /// Whether the ctag showed nothing to pull
    pub up_to_date: bool,
    pub notices: Vec<SyncNotice>,
}

impl SyncReport {
    pub fn new(calendar_id: CalendarId) -> Self {
        SyncReport {
            calendar_id,
            pulled: ChangeCounts::default(),
            pushed: ChangeCounts::default(),
            full_resync: false,
            up_to_date: false,
            notices: Vec::new(),
        }
    }

    pub fn has_changes(&self) -> bool {
        self.pulled.total() + self.pushed.total() > 0
    }
}
