//! Byte transport between a worker and its spawned remote-shell helper.
//!
//! A session owns exactly one helper process and talks SFTP over the
//! helper's stdin/stdout pair. Every read and write is bounded by the
//! caller's deadline; there is no global timeout state.

#![forbid(unsafe_code)]

use std::time::Duration;

pub mod error;
pub mod helper;
pub mod pipe;

pub use error::{FailureCause, TransportError};
pub use helper::{HelperProcess, SshConfig};
pub use pipe::ChildPipe;

/// Transport result type.
pub type Result<T> = std::result::Result<T, TransportError>;

/// The byte-stream seam between a session and its peer.
///
/// [`ChildPipe`] is the production implementation; session tests drive an
/// in-memory implementation instead.
pub trait Wire {
    /// Writes the whole buffer or fails; partial progress is not reported.
    fn write_all(&mut self, buf: &[u8], deadline: Duration) -> Result<()>;

    /// Fills the whole buffer or fails. End-of-stream is
    /// [`TransportError::ConnectionClosed`].
    fn read_exact(&mut self, buf: &mut [u8], deadline: Duration) -> Result<()>;

    /// Readiness probe: is at least one byte readable within `timeout`?
    ///
    /// A zero timeout polls without blocking; the write-ack drain loop
    /// depends on that.
    fn readable(&mut self, timeout: Duration) -> Result<bool>;
}
