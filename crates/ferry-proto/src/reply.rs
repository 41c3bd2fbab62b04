//! Incoming frame splitting and typed reply parsing.

use std::io::Cursor;

use binrw::BinRead;

use crate::attrs::FileAttrs;
use crate::error::ProtoError;
use crate::extensions::Extensions;
use crate::name::{NameBody, NameEntry};
use crate::packet::PacketType;
use crate::status::StatusCode;
use crate::wire::{get_str, get_u32, remaining, WireStr};

/// A framed message as it came off the wire, length prefix stripped.
///
/// `VERSION` carries no request id; its id reads as zero here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReply {
    pub ptype: PacketType,
    pub id: u32,
    pub body: Vec<u8>,
}

/// Splits a frame body (type byte onward) into type, request id and payload.
pub fn split_reply(frame: &[u8]) -> crate::Result<RawReply> {
    let type_byte = *frame.first().ok_or(ProtoError::TruncatedReply)?;
    let ptype = PacketType::from_u8(type_byte).ok_or(ProtoError::UnknownPacketType(type_byte))?;
    if ptype == PacketType::Version {
        return Ok(RawReply {
            ptype,
            id: 0,
            body: frame[1..].to_vec(),
        });
    }
    if frame.len() < 5 {
        return Err(ProtoError::TruncatedReply);
    }
    let id = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
    Ok(RawReply {
        ptype,
        id,
        body: frame[5..].to_vec(),
    })
}

/// A STATUS reply body.
///
/// The raw code is kept so codes outside [`StatusCode`] survive into logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusBody {
    pub code: Option<StatusCode>,
    pub raw_code: u32,
    pub message: String,
    pub language: String,
}

impl StatusBody {
    pub fn is_ok(&self) -> bool {
        self.code == Some(StatusCode::Ok)
    }

    pub fn is_eof(&self) -> bool {
        self.code == Some(StatusCode::Eof)
    }
}

impl std::fmt::Display for StatusBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", StatusCode::describe(self.raw_code))
        } else {
            write!(
                f,
                "{}: {}",
                StatusCode::describe(self.raw_code),
                self.message
            )
        }
    }
}

/// A parsed reply payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Version {
        version: u32,
        extensions: Extensions,
    },
    Status(StatusBody),
    Handle(WireStr),
    Data(Vec<u8>),
    Name(Vec<NameEntry>),
    Attrs(FileAttrs),
    ExtendedReply(Vec<u8>),
}

impl Reply {
    /// Parses a raw reply under the session's negotiated `version`.
    ///
    /// Only reply-side packet types are accepted; a request type here means
    /// the peer is broken.
    pub fn parse(version: u32, raw: &RawReply) -> crate::Result<Reply> {
        let mut cursor = Cursor::new(raw.body.as_slice());
        match raw.ptype {
            PacketType::Version => {
                let negotiated = get_u32(&mut cursor)?;
                let extensions = Extensions::parse(&mut cursor)?;
                Ok(Reply::Version {
                    version: negotiated,
                    extensions,
                })
            }
            PacketType::Status => {
                let raw_code = get_u32(&mut cursor)?;
                // Version 3 always sends message and language tag; some
                // servers truncate after the code, so both are optional.
                let message = if remaining(&mut cursor).map_err(binrw::Error::Io)? >= 4 {
                    WireStr::read_be(&mut cursor)?.to_string_lossy()
                } else {
                    String::new()
                };
                let language = if remaining(&mut cursor).map_err(binrw::Error::Io)? >= 4 {
                    WireStr::read_be(&mut cursor)?.to_string_lossy()
                } else {
                    String::new()
                };
                Ok(Reply::Status(StatusBody {
                    code: StatusCode::from_u32(raw_code),
                    raw_code,
                    message,
                    language,
                }))
            }
            PacketType::Handle => Ok(Reply::Handle(WireStr::read_be(&mut cursor)?)),
            PacketType::Data => Ok(Reply::Data(get_str(&mut cursor)?)),
            PacketType::Name => {
                let body = NameBody::read_be_args(&mut cursor, (version,))?;
                Ok(Reply::Name(body.entries))
            }
            PacketType::Attrs => Ok(Reply::Attrs(FileAttrs::read_be_args(
                &mut cursor,
                (version,),
            )?)),
            PacketType::ExtendedReply => Ok(Reply::ExtendedReply(raw.body.clone())),
            other => Err(ProtoError::UnexpectedReply(other)),
        }
    }

    /// Short name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Version { .. } => "VERSION",
            Reply::Status(_) => "STATUS",
            Reply::Handle(_) => "HANDLE",
            Reply::Data(_) => "DATA",
            Reply::Name(_) => "NAME",
            Reply::Attrs(_) => "ATTRS",
            Reply::ExtendedReply(_) => "EXTENDED_REPLY",
        }
    }
}
