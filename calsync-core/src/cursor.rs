//! Per-calendar sync cursor.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::CalendarId;

/// What the last pull left behind for the next one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub calendar_id: CalendarId,
    pub ctag: Option<String>,
    pub sync_token: Option<String>,
    /// Consecutive pulls that hit parse failures without advancing the cursor
    pub parse_failures: u32,
    /// Persistent warning shown until a clean pull succeeds
    pub warning: Option<String>,
    /// Hrefs whose exceptions arrived without a master; forces the next pull to resync fully
    pub deferred_orphans: BTreeSet<String>,
    pub last_synced: Option<DateTime<Utc>>,
}

impl SyncCursor {
    pub fn new(calendar_id: CalendarId) -> Self {
        SyncCursor {
            calendar_id,
            ctag: None,
            sync_token: None,
            parse_failures: 0,
            warning: None,
            deferred_orphans: BTreeSet::new(),
            last_synced: None,
        }
    }

    /// Whether the server's ctag proves nothing needs pulling.
    pub fn is_current(&self, remote_ctag: Option<&str>) -> bool {
        self.parse_failures == 0
            && self.deferred_orphans.is_empty()
            && remote_ctag.is_some()
            && self.ctag.as_deref() == remote_ctag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_current_requires_matching_ctag_and_clean_state() {
        let mut cursor = SyncCursor::new(CalendarId::new("c"));
        assert!(!cursor.is_current(None));

        cursor.ctag = Some("42".into());
        assert!(cursor.is_current(Some("42")));
        assert!(!cursor.is_current(Some("43")));

        cursor.deferred_orphans.insert("/c/orphan.ics".into());
        assert!(!cursor.is_current(Some("42")));
    }
}
