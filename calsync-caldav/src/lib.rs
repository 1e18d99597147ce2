//! CalDAV protocol client for calsync.
//!
//! [`CalDavClient`] implements [`calsync_core::CalendarRemote`] over HTTP(S):
//! discovery, ctag and sync-collection change detection, calendar-query etag
//! listing, calendar-multiget and conditional PUT/DELETE. Per-server
//! deviations live in [`Quirks`].

mod client;
pub mod multistatus;
pub mod quirks;
mod requests;

pub use client::{CalDavClient, url_to_href};
pub use quirks::Quirks;
