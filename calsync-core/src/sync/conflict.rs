//! Classification of push failures and parse-failure policy.

use crate::error::CalSyncError;
use crate::pending::{MovePhase, OperationKind};
use crate::remote::DavError;

/// How a failed pending operation should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry later with backoff.
    Transient,
    /// Keep the operation and flag it.
    Permanent,
    /// The server's copy changed underneath us; the server wins.
    Conflict,
    /// The server already reflects the operation (earlier partial success).
    AlreadyApplied,
}

/// Classify a push failure for the operation that produced it.
pub fn classify(error: &CalSyncError, kind: &OperationKind) -> FailureClass {
    let CalSyncError::Remote(dav) = error else {
        return if error.is_transient() {
            FailureClass::Transient
        } else {
            FailureClass::Permanent
        };
    };

    let creating = matches!(
        kind,
        OperationKind::Create
            | OperationKind::Move {
                phase: MovePhase::CreateAtDestination,
                ..
            }
    );

    match dav {
        DavError::Transient(_) => FailureClass::Transient,
        DavError::Conflict(_) => FailureClass::Conflict,
        DavError::AlreadyExists(_) if creating => FailureClass::AlreadyApplied,
        DavError::AlreadyExists(_)
        | DavError::NotFound(_)
        | DavError::Permanent(_)
        | DavError::TokenExpired
        | DavError::Malformed(_) => FailureClass::Permanent,
    }
}

/// What to do with the cursor after a pull that hit parse failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseFailureDecision {
    /// Keep the previous ctag/token so the next pull fetches the failed items again.
    Hold,
    /// Give up on the failed items: advance and surface a persistent warning.
    AdvanceWithWarning,
}

/// Decide based on how many previous pulls already held the cursor.
pub fn on_parse_failures(previous_failures: u32, threshold: u32) -> ParseFailureDecision {
    if previous_failures + 1 >= threshold.max(1) {
        ParseFailureDecision::AdvanceWithWarning
    } else {
        ParseFailureDecision::Hold
    }
}
