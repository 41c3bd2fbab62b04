//! The SFTP client session used by fetch and deliver workers.
//!
//! One session owns one [`ferry_transport::Wire`] to a spawned helper and is
//! strictly single-threaded; throughput comes from request pipelining (many
//! outstanding requests on the one stream), not from concurrency.
//!
//! The layering is: [`router::ReplyRouter`] turns the byte stream into
//! matched request/reply pairs, and [`session::SftpSession`] implements the
//! operation state machine on top of it.

#![forbid(unsafe_code)]

use std::time::Duration;

pub mod dir;
pub mod error;
pub mod file;
pub mod multiread;
pub mod router;
pub mod session;

pub use error::SftpError;
pub use file::{OpenMode, ReadOutcome};
pub use multiread::MultiReadOutcome;
pub use session::{SftpSession, StatVfs};

/// SFTP client result type.
pub type Result<T> = std::result::Result<T, SftpError>;

/// Tunables of a session. The defaults match the daemon's transfer
/// defaults; workers override per job.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline applied to every pipe read and write.
    pub transfer_timeout: Duration,
    /// Ceiling for one encoded frame, length prefix included.
    pub max_frame: usize,
    /// How many unmatched replies the router may park before the session
    /// is torn down.
    pub side_buffer_limit: usize,
    /// Hard cap on outstanding write requests.
    pub max_pending_writes: usize,
    /// Total bytes allowed in flight for writes; the effective window is
    /// `min(max_pending_writes, pending_write_buffer / block_size)`.
    pub pending_write_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            transfer_timeout: Duration::from_secs(120),
            max_frame: ferry_proto::DEFAULT_MAX_FRAME,
            side_buffer_limit: 256,
            max_pending_writes: 64,
            pending_write_buffer: 768 * 1024,
        }
    }
}
