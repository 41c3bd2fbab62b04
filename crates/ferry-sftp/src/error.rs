//! Session error type.

use ferry_proto::{ProtoError, StatusBody, StatusCode};
use ferry_transport::TransportError;
use thiserror::Error;

/// Errors surfaced by session operations.
///
/// `Remote` keeps the full status body so the worker's transfer log can
/// show the server's own wording next to the mapped code.
#[derive(Debug, Error)]
pub enum SftpError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtoError),

    /// The bounded reply side-buffer overflowed. Fatal for the session.
    #[error("reply side-buffer full ({0} parked frames)")]
    ReplyQueueFull(usize),

    /// The server answered an operation with a non-OK status.
    #[error("remote error: {0}")]
    Remote(StatusBody),

    /// The server answered with a frame type the operation cannot accept.
    #[error("got {got} reply where {expected} was expected")]
    UnexpectedReply {
        expected: &'static str,
        got: &'static str,
    },

    /// The server returned more data than one read requested.
    #[error("server returned {got} bytes for a {want} byte read")]
    OversizedData { want: usize, got: usize },

    /// An operation was called in a state that cannot serve it, e.g. a
    /// read without an open file.
    #[error("invalid session state: {0}")]
    InvalidState(&'static str),
}

impl SftpError {
    /// The mapped remote status code, when this is a remote error.
    pub fn remote_code(&self) -> Option<StatusCode> {
        match self {
            SftpError::Remote(body) => body.code,
            _ => None,
        }
    }

    pub fn is_no_such_file(&self) -> bool {
        matches!(
            self.remote_code(),
            Some(StatusCode::NoSuchFile) | Some(StatusCode::NoSuchPath)
        )
    }

    pub fn is_permission_denied(&self) -> bool {
        self.remote_code() == Some(StatusCode::PermissionDenied)
    }
}
