pub mod agenda;
pub mod calendars;
pub mod pending;
pub mod rematerialize;
pub mod sync;
