//! Transport error type.

use std::time::Duration;

use thiserror::Error;

/// Why the pipe last failed. Kept sticky on the pipe so teardown paths can
/// tell a quiet peer from one that reset the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    Timeout,
    Reset,
}

/// Errors surfaced by pipe reads and writes.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The deadline expired before the operation completed.
    #[error("transfer timeout after {0:?}")]
    Timeout(Duration),

    /// The peer reset the connection mid-operation.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// Orderly end of stream where more bytes were required.
    #[error("connection closed")]
    ConnectionClosed,

    /// Any other syscall failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True when retrying on a fresh connection could help.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionReset | TransportError::ConnectionClosed
        )
    }
}
