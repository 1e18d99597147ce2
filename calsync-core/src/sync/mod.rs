//! Two-way sync between a CalDAV server and the local store.
//!
//! [`SyncEngine`] runs discovery, then for each calendar a pull followed by a
//! push of the pending-operation queue. [`LocalEditor`] records local edits
//! so the next push can upload them.

mod apply;
pub mod conflict;
mod edits;
mod engine;
mod pull;
mod push;
pub mod report;

pub use conflict::{FailureClass, ParseFailureDecision, classify, on_parse_failures};
pub use edits::LocalEditor;
pub use engine::{SyncEngine, SyncOutcome};
pub use report::{ChangeCounts, SyncNotice, SyncReport};
