//! Packet types and the outgoing request builder.

use std::io::Cursor;

use binrw::BinWrite;

use crate::attrs::FileAttrs;
use crate::error::ProtoError;
use crate::wire::WireStr;

/// SFTP packet type codes.
///
/// Reference: draft-ietf-secsh-filexfer-13 section 4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Init = 1,
    Version = 2,
    Open = 3,
    Close = 4,
    Read = 5,
    Write = 6,
    Lstat = 7,
    Fstat = 8,
    Setstat = 9,
    Fsetstat = 10,
    Opendir = 11,
    Readdir = 12,
    Remove = 13,
    Mkdir = 14,
    Rmdir = 15,
    Realpath = 16,
    Stat = 17,
    Rename = 18,
    Readlink = 19,
    Symlink = 20,
    Link = 21,
    Block = 22,
    Unblock = 23,
    Status = 101,
    Handle = 102,
    Data = 103,
    Name = 104,
    Attrs = 105,
    Extended = 200,
    ExtendedReply = 201,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        use PacketType::*;
        Some(match value {
            1 => Init,
            2 => Version,
            3 => Open,
            4 => Close,
            5 => Read,
            6 => Write,
            7 => Lstat,
            8 => Fstat,
            9 => Setstat,
            10 => Fsetstat,
            11 => Opendir,
            12 => Readdir,
            13 => Remove,
            14 => Mkdir,
            15 => Rmdir,
            16 => Realpath,
            17 => Stat,
            18 => Rename,
            19 => Readlink,
            20 => Symlink,
            21 => Link,
            22 => Block,
            23 => Unblock,
            101 => Status,
            102 => Handle,
            103 => Data,
            104 => Name,
            105 => Attrs,
            200 => Extended,
            201 => ExtendedReply,
            _ => return None,
        })
    }
}

/// Builder for one outgoing frame.
///
/// The builder owns the frame body (type byte onward); [`PacketBuf::finish`]
/// prepends the big-endian length and enforces the frame limit.
#[derive(Debug, Clone)]
pub struct PacketBuf {
    body: Vec<u8>,
}

impl PacketBuf {
    /// Starts a request frame: type byte followed by the request id.
    pub fn request(ptype: PacketType, id: u32) -> Self {
        let mut buf = Self::bare(ptype);
        buf.put_u32(id);
        buf
    }

    /// Starts a frame with no request id (`INIT` only, on the client side).
    pub fn bare(ptype: PacketType) -> Self {
        PacketBuf {
            body: vec![ptype as u8],
        }
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.body.push(value);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.body.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.body.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Appends a length-prefixed byte string.
    pub fn put_str(&mut self, value: impl AsRef<[u8]>) -> &mut Self {
        let bytes = value.as_ref();
        self.put_u32(bytes.len() as u32);
        self.body.extend_from_slice(bytes);
        self
    }

    /// Appends an attribute block encoded for `version`.
    pub fn put_attrs(&mut self, attrs: &FileAttrs, version: u32) -> crate::Result<&mut Self> {
        let mut cursor = Cursor::new(Vec::new());
        attrs.write_be_args(&mut cursor, (version,))?;
        self.body.extend_from_slice(cursor.get_ref());
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Finishes the frame: length prefix plus body.
    pub fn finish(self, max_frame: usize) -> crate::Result<Vec<u8>> {
        let total = self.body.len() + 4;
        if total > max_frame {
            return Err(ProtoError::OversizedFrame {
                len: total,
                max: max_frame,
            });
        }
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&(self.body.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.body);
        Ok(out)
    }
}

impl PacketBuf {
    /// Appends a [`WireStr`] without copying through an intermediate slice.
    pub fn put_wire_str(&mut self, value: &WireStr) -> &mut Self {
        self.put_str(value.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        (0..cleaned.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&cleaned[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn realpath_request_bytes() {
        let mut buf = PacketBuf::request(PacketType::Realpath, 7);
        buf.put_str(".");
        let frame = buf.finish(crate::DEFAULT_MAX_FRAME).unwrap();
        assert_eq!(frame, hex("0000000a 10 00000007 00000001 2e"));
    }

    #[test]
    fn init_carries_no_request_id() {
        let mut buf = PacketBuf::bare(PacketType::Init);
        buf.put_u32(6);
        let frame = buf.finish(crate::DEFAULT_MAX_FRAME).unwrap();
        assert_eq!(frame, hex("00000005 01 00000006"));
    }

    #[test]
    fn read_request_bytes() {
        let mut buf = PacketBuf::request(PacketType::Read, 3);
        buf.put_str(b"h0").put_u64(0x1000).put_u32(16384);
        let frame = buf.finish(crate::DEFAULT_MAX_FRAME).unwrap();
        assert_eq!(
            frame,
            hex("00000017 05 00000003 00000002 6830 0000000000001000 00004000")
        );
    }

    #[test]
    fn finish_rejects_oversized_frame() {
        let mut buf = PacketBuf::request(PacketType::Write, 1);
        buf.put_str(vec![0u8; 64]);
        match buf.finish(32) {
            Err(ProtoError::OversizedFrame { max: 32, .. }) => {}
            other => panic!("expected OversizedFrame, got {other:?}"),
        }
    }

    #[test]
    fn packet_type_round_trip() {
        for raw in 0u8..=255 {
            if let Some(ptype) = PacketType::from_u8(raw) {
                assert_eq!(ptype as u8, raw);
            }
        }
        assert_eq!(PacketType::from_u8(101), Some(PacketType::Status));
        assert_eq!(PacketType::from_u8(0), None);
        assert_eq!(PacketType::from_u8(42), None);
    }
}
