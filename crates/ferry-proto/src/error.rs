//! Codec error type.

use thiserror::Error;

use crate::packet::PacketType;

/// Errors produced while encoding or decoding SFTP frames.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// A length-prefixed string announced more bytes than the limit allows.
    #[error("string of {len} bytes exceeds the limit of {max} bytes")]
    OversizedString { len: usize, max: usize },

    /// An encoded frame would exceed the session frame limit.
    #[error("frame of {len} bytes exceeds the limit of {max} bytes")]
    OversizedFrame { len: usize, max: usize },

    /// The peer sent a type byte outside the known packet set.
    #[error("unknown packet type {0:#04x}")]
    UnknownPacketType(u8),

    /// The peer sent a packet type that is never a valid reply.
    #[error("unexpected reply packet {0:?}")]
    UnexpectedReply(PacketType),

    /// A reply frame ended before its fixed header was complete.
    #[error("reply frame truncated")]
    TruncatedReply,

    /// Low-level wire decode failure (short payload, bad enum value, ...).
    #[error("wire decode failed: {0}")]
    Wire(#[from] binrw::Error),
}
