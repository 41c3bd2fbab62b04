//! Extension pairs announced by the server's `VERSION` reply.

use std::io::{Read, Seek};

use crate::wire::{get_string, remaining};

pub const EXT_POSIX_RENAME: &str = "posix-rename@openssh.com";
pub const EXT_STATVFS: &str = "statvfs@openssh.com";
pub const EXT_FSTATVFS: &str = "fstatvfs@openssh.com";
pub const EXT_HARDLINK: &str = "hardlink@openssh.com";
pub const EXT_FSYNC: &str = "fsync@openssh.com";

/// The extension versions a server announced during the handshake.
///
/// `None` means not announced; announcements outside the recognized set are
/// skipped. The version strings are numeric in practice ("1", "2"); anything
/// unparsable counts as version 0, which is still "announced".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Extensions {
    pub posix_rename: Option<u32>,
    pub statvfs: Option<u32>,
    pub fstatvfs: Option<u32>,
    pub hardlink: Option<u32>,
    pub fsync: Option<u32>,
}

impl Extensions {
    /// Parses `name, data` pairs until the VERSION payload is exhausted.
    pub fn parse<R: Read + Seek>(reader: &mut R) -> crate::Result<Self> {
        let mut ext = Extensions::default();
        while remaining(reader).map_err(binrw::Error::Io)? >= 8 {
            let name = get_string(reader)?;
            let data = get_string(reader)?;
            let version = data.trim().parse::<u32>().unwrap_or(0);
            match name.as_str() {
                EXT_POSIX_RENAME => ext.posix_rename = Some(version),
                EXT_STATVFS => ext.statvfs = Some(version),
                EXT_FSTATVFS => ext.fstatvfs = Some(version),
                EXT_HARDLINK => ext.hardlink = Some(version),
                EXT_FSYNC => ext.fsync = Some(version),
                other => log::debug!("skipping unknown extension {other:?} = {data:?}"),
            }
        }
        Ok(ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn put_str(out: &mut Vec<u8>, s: &str) {
        out.extend_from_slice(&(s.len() as u32).to_be_bytes());
        out.extend_from_slice(s.as_bytes());
    }

    #[test]
    fn parses_known_pairs_and_skips_others() {
        let mut body = Vec::new();
        put_str(&mut body, EXT_POSIX_RENAME);
        put_str(&mut body, "1");
        put_str(&mut body, "nobody@example.com");
        put_str(&mut body, "7");
        put_str(&mut body, EXT_FSYNC);
        put_str(&mut body, "2");
        let mut cursor = Cursor::new(body);
        let ext = Extensions::parse(&mut cursor).unwrap();
        assert_eq!(ext.posix_rename, Some(1));
        assert_eq!(ext.fsync, Some(2));
        assert_eq!(ext.statvfs, None);
        assert_eq!(ext.hardlink, None);
    }

    #[test]
    fn empty_payload_means_no_extensions() {
        let mut cursor = Cursor::new(Vec::new());
        assert_eq!(Extensions::parse(&mut cursor).unwrap(), Extensions::default());
    }
}
