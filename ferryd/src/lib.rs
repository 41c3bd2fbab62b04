//! Daemon internals shared by the `ferryd` supervisor binary and the
//! `ferry-fetch` retrieval worker.

pub mod config;
pub mod dirs;
pub mod error;
pub mod fetch;
pub mod fifo;
pub mod process;
pub mod supervisor;

pub use config::DaemonConfig;
pub use dirs::WorkDir;
pub use error::DaemonError;

/// Daemon result type.
pub type Result<T> = std::result::Result<T, DaemonError>;

/// Seconds since the epoch, UTC.
pub fn now_epoch() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
