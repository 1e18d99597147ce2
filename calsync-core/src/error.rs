//! Error types for calsync.

use thiserror::Error;

use crate::remote::DavError;

/// Errors that can occur in calsync operations.
#[derive(Error, Debug)]
pub enum CalSyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Calendar not found: {0}")]
    CalendarNotFound(String),

    #[error("Event not found: {0}")]
    EventNotFound(String),

    #[error("Invalid edit: {0}")]
    InvalidEdit(String),

    #[error("ICS parse error: {0}")]
    IcsParse(String),

    #[error("ICS generation error: {0}")]
    IcsGenerate(String),

    #[error("Recurrence error: {0}")]
    Recurrence(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Remote error: {0}")]
    Remote(#[from] DavError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CalSyncError {
    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CalSyncError::Remote(e) => e.is_transient(),
            CalSyncError::Io(_) => true,
            _ => false,
        }
    }
}

/// Result type alias for calsync operations.
pub type CalSyncResult<T> = Result<T, CalSyncError>;
