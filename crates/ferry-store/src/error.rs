//! Store error type.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the mapped state records.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A mapped file does not look like what it claims to be.
    #[error("{path}: corrupt record ({what})")]
    Corrupt { path: PathBuf, what: &'static str },

    /// A file or host name does not fit its fixed slot.
    #[error("name of {len} bytes exceeds the {max} byte slot")]
    NameTooLong { len: usize, max: usize },

    /// Row index past the current count.
    #[error("row {index} out of range (count {count})")]
    RowOutOfRange { index: usize, count: usize },

    /// Another supervisor instance owns the active file.
    #[error("another instance is alive (heartbeat advancing in {0})")]
    AlreadyRunning(PathBuf),
}
