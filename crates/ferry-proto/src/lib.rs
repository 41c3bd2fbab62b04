//! SFTP wire types and codecs for the ferry transfer engine.
//!
//! Everything here is pure: frames go in, typed values come out, and the
//! reverse. The session logic that decides *when* to send what lives in
//! `ferry-sftp`; this crate only knows about bytes.
//!
//! All integers on the wire are big-endian. Frames are
//! `u32 length | u8 type | u32 request-id | payload`, except `INIT` and
//! `VERSION` which carry the protocol version where the request id would be.

#![forbid(unsafe_code)]

pub mod attrs;
pub mod error;
pub mod extensions;
pub mod flags;
pub mod name;
pub mod packet;
pub mod reply;
pub mod status;
pub mod wire;

pub use attrs::{FileAttrs, FileType};
pub use error::ProtoError;
pub use extensions::Extensions;
pub use flags::{AttrFlags, OpenFlags, RenameFlags};
pub use name::{NameBody, NameEntry};
pub use packet::{PacketBuf, PacketType};
pub use reply::{split_reply, RawReply, Reply, StatusBody};
pub use status::StatusCode;
pub use wire::WireStr;

/// SFTP codec result type.
pub type Result<T> = std::result::Result<T, ProtoError>;

/// Highest protocol version this client offers during `INIT`.
pub const MAX_SFTP_VERSION: u32 = 6;

/// Default ceiling for a single encoded frame, length prefix included.
///
/// Sessions may lower this; the codec refuses to build or accept anything
/// larger than the limit it is handed.
pub const DEFAULT_MAX_FRAME: usize = 256 * 1024;
