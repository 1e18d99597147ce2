//! Core of calsync.
//!
//! This crate holds everything that doesn't speak HTTP:
//! - `ics`: parsing and generating calendar object resources
//! - `recurrence`: RRULE/RDATE/EXDATE expansion
//! - `occurrence`: the materialized timeline of every event
//! - `store`: local persistence behind the `CalendarStore` trait
//! - `sync`: the pull/push orchestrator driving a `CalendarRemote`

pub mod calendar;
pub mod config;
pub mod constants;
pub mod cursor;
pub mod date_range;
pub mod error;
pub mod event;
pub mod ics;
pub mod occurrence;
pub mod pending;
pub mod recurrence;
pub mod remote;
pub mod store;
pub mod sync;

pub use calendar::Calendar;
pub use config::{AccountConfig, CalsyncConfig, SyncConfig};
pub use date_range::DateRange;
pub use error::{CalSyncError, CalSyncResult};
pub use event::{CalendarId, Event, EventData, EventId, EventStatus, SyncState};
pub use occurrence::Occurrence;
pub use remote::{CalendarRemote, DavError, DavResult};
pub use store::{CalendarStore, MemoryStore};
pub use sync::{LocalEditor, SyncEngine, SyncNotice, SyncOutcome, SyncReport};
