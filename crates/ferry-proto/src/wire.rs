//! Elementary wire pieces: big-endian integers and length-prefixed strings.

use std::io::{Read, Seek, SeekFrom, Write};

use binrw::{BinRead, BinResult, BinWrite, Endian};

/// Hard ceiling for a single length-prefixed string.
///
/// A string can never be larger than the frame that carries it, so the
/// default frame limit doubles as the string sanity cap.
pub const MAX_STR_LEN: usize = crate::DEFAULT_MAX_FRAME;

/// A length-prefixed byte string (`u32 length | bytes`).
///
/// SFTP strings are raw octets; file names on the wire are whatever the
/// server's filesystem holds, so no UTF-8 requirement is imposed here.
///
/// Reference: draft-ietf-secsh-filexfer-13 section 4.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireStr(pub Vec<u8>);

impl WireStr {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        WireStr(bytes.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lossy UTF-8 view, for logging and path bookkeeping.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl From<&str> for WireStr {
    fn from(value: &str) -> Self {
        WireStr(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for WireStr {
    fn from(value: Vec<u8>) -> Self {
        WireStr(value)
    }
}

impl From<&[u8]> for WireStr {
    fn from(value: &[u8]) -> Self {
        WireStr(value.to_vec())
    }
}

impl std::fmt::Display for WireStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl BinRead for WireStr {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        _: Self::Args<'_>,
    ) -> BinResult<Self> {
        let pos = reader.stream_position()?;
        let len = u32::read_options(reader, endian, ())? as usize;
        if len > MAX_STR_LEN {
            return Err(binrw::Error::AssertFail {
                pos,
                message: format!("string of {len} bytes exceeds the {MAX_STR_LEN} byte limit"),
            });
        }
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data).map_err(binrw::Error::Io)?;
        Ok(WireStr(data))
    }
}

impl BinWrite for WireStr {
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        endian: Endian,
        _: Self::Args<'_>,
    ) -> BinResult<()> {
        (self.0.len() as u32).write_options(writer, endian, ())?;
        writer.write_all(&self.0).map_err(binrw::Error::Io)?;
        Ok(())
    }
}

/// Reads a big-endian `u32`.
pub fn get_u32<R: Read + Seek>(reader: &mut R) -> crate::Result<u32> {
    Ok(u32::read_be(reader)?)
}

/// Reads a big-endian `u64`.
pub fn get_u64<R: Read + Seek>(reader: &mut R) -> crate::Result<u64> {
    Ok(u64::read_be(reader)?)
}

/// Reads a length-prefixed byte string.
pub fn get_str<R: Read + Seek>(reader: &mut R) -> crate::Result<Vec<u8>> {
    let len = u32::read_be(reader)? as usize;
    if len > MAX_STR_LEN {
        return Err(crate::ProtoError::OversizedString {
            len,
            max: MAX_STR_LEN,
        });
    }
    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .map_err(|e| crate::ProtoError::Wire(binrw::Error::Io(e)))?;
    Ok(data)
}

/// Reads a length-prefixed string as lossy UTF-8.
pub fn get_string<R: Read + Seek>(reader: &mut R) -> crate::Result<String> {
    Ok(String::from_utf8_lossy(&get_str(reader)?).into_owned())
}

/// Bytes left between the current position and the end of the stream.
pub(crate) fn remaining<R: Read + Seek>(reader: &mut R) -> std::io::Result<u64> {
    let pos = reader.stream_position()?;
    let end = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(pos))?;
    Ok(end.saturating_sub(pos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn wire_str_round_trip() {
        let s = WireStr::from("foo.dat");
        let mut cursor = Cursor::new(Vec::new());
        s.write_be(&mut cursor).unwrap();
        assert_eq!(
            cursor.get_ref().as_slice(),
            b"\x00\x00\x00\x07foo.dat".as_slice()
        );
        cursor.set_position(0);
        assert_eq!(WireStr::read_be(&mut cursor).unwrap(), s);
    }

    #[test]
    fn wire_str_empty() {
        let mut cursor = Cursor::new(vec![0u8, 0, 0, 0]);
        let s = WireStr::read_be(&mut cursor).unwrap();
        assert!(s.is_empty());
    }

    #[test]
    fn wire_str_rejects_oversized_length() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&((MAX_STR_LEN as u32) + 1).to_be_bytes());
        bytes.extend_from_slice(b"x");
        let mut cursor = Cursor::new(bytes);
        assert!(WireStr::read_be(&mut cursor).is_err());
    }

    #[test]
    fn wire_str_rejects_short_payload() {
        // Announces 8 bytes, delivers 3.
        let mut cursor = Cursor::new(b"\x00\x00\x00\x08abc".to_vec());
        assert!(WireStr::read_be(&mut cursor).is_err());
    }

    #[test]
    fn get_str_reports_oversized_lengths() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&((MAX_STR_LEN as u32) + 1).to_be_bytes());
        let mut cursor = Cursor::new(bytes);
        match get_str(&mut cursor) {
            Err(crate::ProtoError::OversizedString { .. }) => {}
            other => panic!("expected OversizedString, got {other:?}"),
        }
    }

    #[test]
    fn integers_are_big_endian() {
        let mut cursor = Cursor::new(b"\x00\x00\x01\x02".to_vec());
        assert_eq!(get_u32(&mut cursor).unwrap(), 0x102);
        let mut cursor = Cursor::new(b"\x00\x00\x00\x01\x00\x00\x00\x00".to_vec());
        assert_eq!(get_u64(&mut cursor).unwrap(), 1 << 32);
    }
}
