//! Durable queue of local mutations awaiting server confirmation.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{CalendarId, EventId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub Uuid);

impl OperationId {
    pub fn new() -> Self {
        OperationId(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Step of a cross-calendar move. Persisted between the two server calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovePhase {
    CreateAtDestination,
    DeleteAtSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    /// Move to the operation's calendar from `source_calendar`.
    Move {
        source_calendar: CalendarId,
        source_href: String,
        source_etag: Option<String>,
        phase: MovePhase,
    },
}

impl OperationKind {
    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Move { .. } => "move",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    Queued,
    /// Gave up: permanent failure or retry cap reached. Kept for the user to see.
    NeedsAttention,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: OperationId,
    pub calendar_id: CalendarId,
    pub event_id: EventId,
    pub kind: OperationKind,
    /// Creation order, assigned by the store
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub state: OperationState,
}

impl PendingOperation {
    pub fn new(calendar_id: CalendarId, event_id: EventId, kind: OperationKind, max_retries: u32) -> Self {
        PendingOperation {
            id: OperationId::new(),
            calendar_id,
            event_id,
            kind,
            seq: 0,
            created_at: Utc::now(),
            retry_count: 0,
            max_retries,
            next_attempt_at: None,
            last_error: None,
            state: OperationState::Queued,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == OperationState::Queued && self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Record a transient failure and schedule the next attempt.
    ///
    /// Once the retry cap is reached the operation is flagged instead.
    pub fn record_transient_failure(&mut self, error: &str, now: DateTime<Utc>, backoff: &Backoff) {
        self.retry_count += 1;
        self.last_error = Some(error.to_string());
        if self.retry_count >= self.max_retries {
            self.state = OperationState::NeedsAttention;
            self.next_attempt_at = None;
        } else {
            self.next_attempt_at = Some(now + backoff.delay(self.retry_count));
        }
    }

    pub fn record_permanent_failure(&mut self, error: &str) {
        self.last_error = Some(error.to_string());
        self.state = OperationState::NeedsAttention;
        self.next_attempt_at = None;
    }
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: StdDuration,
    pub max: StdDuration,
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base.saturating_mul(factor).min(self.max);
        Duration::from_std(delay).unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff {
            base: StdDuration::from_secs(30),
            max: StdDuration::from_secs(600),
        }
    }

    #[test]
    fn test_backoff_doubles_until_capped() {
        let b = backoff();
        assert_eq!(b.delay(1), Duration::seconds(30));
        assert_eq!(b.delay(2), Duration::seconds(60));
        assert_eq!(b.delay(4), Duration::seconds(240));
        assert_eq!(b.delay(6), Duration::seconds(600));
        assert_eq!(b.delay(40), Duration::seconds(600));
    }

    #[test]
    fn test_transient_failures_flag_after_cap() {
        let now = Utc::now();
        let mut op = PendingOperation::new(CalendarId::new("c"), EventId::new(), OperationKind::Update, 2);

        op.record_transient_failure("503", now, &backoff());
        assert_eq!(op.state, OperationState::Queued);
        assert!(!op.is_due(now));
        assert!(op.is_due(now + Duration::seconds(30)));

        op.record_transient_failure("503", now, &backoff());
        assert_eq!(op.state, OperationState::NeedsAttention);
        assert!(!op.is_due(now + Duration::days(1)));
        assert_eq!(op.last_error.as_deref(), Some("503"));
    }
}
