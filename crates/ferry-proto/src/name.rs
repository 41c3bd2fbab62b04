//! `SSH_FXP_NAME` reply bodies.

use std::io::{Read, Seek};

use binrw::{BinRead, BinResult, Endian};

use crate::attrs::FileAttrs;
use crate::wire::{remaining, WireStr};

/// One entry of a NAME reply: a file name with its attributes.
///
/// Version <= 3 servers also send an `ls -l` style long form which this
/// client ignores but must consume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameEntry {
    pub filename: WireStr,
    pub long_name: Option<WireStr>,
    pub attrs: FileAttrs,
}

/// A full NAME reply body: entry count followed by the entries.
///
/// Reference: draft-ietf-secsh-filexfer-13 section 9.4.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameBody {
    pub entries: Vec<NameEntry>,
}

impl BinRead for NameBody {
    type Args<'a> = (u32,);

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        (version,): Self::Args<'_>,
    ) -> BinResult<Self> {
        let count = u32::read_options(reader, endian, ())?;
        let mut entries = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            let filename = WireStr::read_options(reader, endian, ())?;
            let long_name = if version < 4 {
                Some(WireStr::read_options(reader, endian, ())?)
            } else {
                None
            };
            let attrs = FileAttrs::read_options(reader, endian, (version,))?;
            entries.push(NameEntry {
                filename,
                long_name,
                attrs,
            });
        }
        // Version 6 may append an optional end-of-list byte.
        if remaining(reader).map_err(binrw::Error::Io)? >= 1 {
            let _ = u8::read_options(reader, endian, ())?;
        }
        Ok(NameBody { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn put_str(out: &mut Vec<u8>, s: &[u8]) {
        out.extend_from_slice(&(s.len() as u32).to_be_bytes());
        out.extend_from_slice(s);
    }

    #[test]
    fn v3_entries_carry_long_names() {
        let mut body = Vec::new();
        body.extend_from_slice(&2u32.to_be_bytes());
        for name in [b"a.bufr".as_slice(), b"b.bufr".as_slice()] {
            put_str(&mut body, name);
            put_str(&mut body, b"-rw-r--r-- ...");
            // flags = SIZE
            body.extend_from_slice(&1u32.to_be_bytes());
            body.extend_from_slice(&512u64.to_be_bytes());
        }
        let mut cursor = Cursor::new(body);
        let parsed = NameBody::read_be_args(&mut cursor, (3,)).unwrap();
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.entries[0].filename, WireStr::from("a.bufr"));
        assert!(parsed.entries[0].long_name.is_some());
        assert_eq!(parsed.entries[1].attrs.size, Some(512));
    }

    #[test]
    fn v6_entries_have_no_long_name() {
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_be_bytes());
        put_str(&mut body, b"report.txt");
        body.extend_from_slice(&0u32.to_be_bytes()); // empty attr flags
        body.push(1); // type byte: regular
        body.push(1); // optional end-of-list marker
        let mut cursor = Cursor::new(body);
        let parsed = NameBody::read_be_args(&mut cursor, (6,)).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert!(parsed.entries[0].long_name.is_none());
        assert_eq!(cursor.position() as usize, cursor.get_ref().len());
    }

    #[test]
    fn empty_listing() {
        let mut cursor = Cursor::new(0u32.to_be_bytes().to_vec());
        let parsed = NameBody::read_be_args(&mut cursor, (3,)).unwrap();
        assert!(parsed.entries.is_empty());
    }
}
