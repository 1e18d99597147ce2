/// Number of days to sync in each direction (past and future)
pub const DEFAULT_SYNC_DAYS: i64 = 365;

/// Upper bound on instances produced for a single recurring master.
pub const DEFAULT_MAX_INSTANCES: u16 = 1000;

/// Hrefs per calendar-multiget REPORT.
pub const DEFAULT_MULTIGET_BATCH_SIZE: usize = 50;

/// Consecutive batches with parse failures tolerated before the cursor advances anyway.
pub const DEFAULT_PARSE_FAILURE_THRESHOLD: u32 = 3;

/// Retry cap for transient push failures.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

pub const PRODID: &str = "-//calsync//calsync 0.3//EN";
