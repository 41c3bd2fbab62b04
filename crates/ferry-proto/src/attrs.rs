//! File attribute blocks, decoded and encoded per negotiated version.

use std::io::{Read, Seek, Write};

use binrw::{BinRead, BinResult, BinWrite, Endian};

use crate::flags::AttrFlags;
use crate::wire::WireStr;

// Flag bit values, matching [`AttrFlags`].
const ATTR_SIZE: u32 = 0x0000_0001;
const ATTR_UID_GID: u32 = 0x0000_0002;
const ATTR_PERMISSIONS: u32 = 0x0000_0004;
const ATTR_ACCESS_TIME: u32 = 0x0000_0008;
const ATTR_CREATE_TIME: u32 = 0x0000_0010;
const ATTR_MODIFY_TIME: u32 = 0x0000_0020;
const ATTR_SUBSECOND: u32 = 0x0000_0040;
const ATTR_OWNER_GROUP: u32 = 0x0000_0080;
const ATTR_BITS: u32 = 0x0000_0200;
const ATTR_ALLOCATION: u32 = 0x0000_0400;
const ATTR_CTIME: u32 = 0x0000_8000;
const ATTR_EXTENDED: u32 = 0x8000_0000;

// Flag bits with a documented width that this client has no use for.
// They are skipped on decode so a chatty server does not desynchronize us.
const ATTR_TEXT_HINT: u32 = 0x0000_0800; // byte
const ATTR_MIME_TYPE: u32 = 0x0000_1000; // string
const ATTR_LINK_COUNT: u32 = 0x0000_2000; // uint32
const ATTR_UNTRANSLATED_NAME: u32 = 0x0000_4000; // string

/// File type byte carried by version >= 4 attribute blocks.
///
/// Reference: draft-ietf-secsh-filexfer-13 section 7.2.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    Regular = 1,
    Directory = 2,
    Symlink = 3,
    Special = 4,
    #[default]
    Unknown = 5,
    Socket = 6,
    CharDevice = 7,
    BlockDevice = 8,
    Fifo = 9,
}

impl FileType {
    pub fn from_byte(value: u8) -> Self {
        use FileType::*;
        match value {
            1 => Regular,
            2 => Directory,
            3 => Symlink,
            4 => Special,
            6 => Socket,
            7 => CharDevice,
            8 => BlockDevice,
            9 => Fifo,
            _ => Unknown,
        }
    }

    /// Derives the type from unix permission bits (version <= 3 blocks).
    pub fn from_permissions(mode: u32) -> Self {
        match mode & 0o170000 {
            0o100000 => FileType::Regular,
            0o040000 => FileType::Directory,
            0o120000 => FileType::Symlink,
            0o140000 => FileType::Socket,
            0o020000 => FileType::CharDevice,
            0o060000 => FileType::BlockDevice,
            0o010000 => FileType::Fifo,
            _ => FileType::Unknown,
        }
    }
}

/// A decoded attribute block.
///
/// Every field is optional because the present-fields word says what the
/// peer sent. Version 3 times are widened to `u64` on decode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttrs {
    pub file_type: FileType,
    pub size: Option<u64>,
    pub allocation_size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub owner: Option<WireStr>,
    pub group: Option<WireStr>,
    pub permissions: Option<u32>,
    pub atime: Option<u64>,
    pub atime_nsec: Option<u32>,
    pub createtime: Option<u64>,
    pub createtime_nsec: Option<u32>,
    pub mtime: Option<u64>,
    pub mtime_nsec: Option<u32>,
    pub ctime: Option<u64>,
    pub ctime_nsec: Option<u32>,
    pub bits: Option<u32>,
    pub bits_valid: Option<u32>,
    pub extended: Vec<(WireStr, WireStr)>,
}

impl FileAttrs {
    /// Empty block: nothing present. Encodes as a lone zero flag word
    /// (plus the type byte from version 4 on).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Block carrying only a permission word, as sent with mkdir and open.
    pub fn with_mode(mode: u32) -> Self {
        FileAttrs {
            permissions: Some(mode),
            ..Default::default()
        }
    }

    /// Block carrying access and modification time, as sent by set-time.
    pub fn with_times(atime: u64, mtime: u64) -> Self {
        FileAttrs {
            atime: Some(atime),
            mtime: Some(mtime),
            ..Default::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_regular(&self) -> bool {
        self.file_type == FileType::Regular
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }

    /// The present-fields word this block encodes to for `version`.
    fn present_flags(&self, version: u32) -> AttrFlags {
        let mut flags = AttrFlags::new();
        flags.set_size(self.size.is_some());
        if version <= 3 {
            flags.set_uid_gid(self.uid.is_some() && self.gid.is_some());
            // v3 folds both times into one ACMODTIME bit.
            flags.set_access_time(self.atime.is_some() && self.mtime.is_some());
        } else {
            flags.set_owner_group(self.owner.is_some() && self.group.is_some());
            flags.set_access_time(self.atime.is_some());
            flags.set_create_time(self.createtime.is_some());
            flags.set_modify_time(self.mtime.is_some());
            flags.set_subsecond_times(
                self.atime_nsec.is_some()
                    || self.createtime_nsec.is_some()
                    || self.mtime_nsec.is_some()
                    || self.ctime_nsec.is_some(),
            );
            if version >= 5 {
                flags.set_bits(self.bits.is_some());
            }
            if version >= 6 {
                flags.set_allocation_size(self.allocation_size.is_some());
                flags.set_ctime(self.ctime.is_some());
            }
        }
        flags.set_permissions(self.permissions.is_some());
        flags.set_extended(!self.extended.is_empty());
        flags
    }
}

impl BinRead for FileAttrs {
    type Args<'a> = (u32,);

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        (version,): Self::Args<'_>,
    ) -> BinResult<Self> {
        let raw = u32::read_options(reader, endian, ())?;
        let flags = AttrFlags::from_u32(raw);
        let mut attrs = FileAttrs::default();
        // Bits whose fields were actually consumed; the remainder is
        // reported as leftover below.
        let mut handled = 0u32;

        if version >= 4 {
            let type_byte = u8::read_options(reader, endian, ())?;
            attrs.file_type = FileType::from_byte(type_byte);
        }
        if flags.size() {
            attrs.size = Some(u64::read_options(reader, endian, ())?);
            handled |= ATTR_SIZE;
        }
        if flags.allocation_size() && version >= 6 {
            attrs.allocation_size = Some(u64::read_options(reader, endian, ())?);
            handled |= ATTR_ALLOCATION;
        }
        if version <= 3 && flags.uid_gid() {
            attrs.uid = Some(u32::read_options(reader, endian, ())?);
            attrs.gid = Some(u32::read_options(reader, endian, ())?);
            handled |= ATTR_UID_GID;
        }
        if version >= 4 && flags.owner_group() {
            attrs.owner = Some(WireStr::read_options(reader, endian, ())?);
            attrs.group = Some(WireStr::read_options(reader, endian, ())?);
            handled |= ATTR_OWNER_GROUP;
        }
        if flags.permissions() {
            let mode = u32::read_options(reader, endian, ())?;
            attrs.permissions = Some(mode);
            if version <= 3 {
                attrs.file_type = FileType::from_permissions(mode);
            }
            handled |= ATTR_PERMISSIONS;
        }
        if version <= 3 {
            if flags.access_time() {
                // ACMODTIME: two 32-bit seconds values.
                attrs.atime = Some(u32::read_options(reader, endian, ())? as u64);
                attrs.mtime = Some(u32::read_options(reader, endian, ())? as u64);
                handled |= ATTR_ACCESS_TIME;
            }
        } else {
            let subsec = flags.subsecond_times();
            if subsec {
                handled |= ATTR_SUBSECOND;
            }
            if flags.access_time() {
                attrs.atime = Some(u64::read_options(reader, endian, ())?);
                if subsec {
                    attrs.atime_nsec = Some(u32::read_options(reader, endian, ())?);
                }
                handled |= ATTR_ACCESS_TIME;
            }
            if flags.create_time() {
                attrs.createtime = Some(u64::read_options(reader, endian, ())?);
                if subsec {
                    attrs.createtime_nsec = Some(u32::read_options(reader, endian, ())?);
                }
                handled |= ATTR_CREATE_TIME;
            }
            if flags.modify_time() {
                attrs.mtime = Some(u64::read_options(reader, endian, ())?);
                if subsec {
                    attrs.mtime_nsec = Some(u32::read_options(reader, endian, ())?);
                }
                handled |= ATTR_MODIFY_TIME;
            }
            if flags.ctime() && version >= 6 {
                attrs.ctime = Some(u64::read_options(reader, endian, ())?);
                if subsec {
                    attrs.ctime_nsec = Some(u32::read_options(reader, endian, ())?);
                }
                handled |= ATTR_CTIME;
            }
        }
        if flags.bits() && version >= 5 {
            attrs.bits = Some(u32::read_options(reader, endian, ())?);
            if version >= 6 {
                attrs.bits_valid = Some(u32::read_options(reader, endian, ())?);
            }
            handled |= ATTR_BITS;
        }

        // Fields we know the width of but have no use for.
        if raw & ATTR_TEXT_HINT != 0 {
            let _ = u8::read_options(reader, endian, ())?;
            handled |= ATTR_TEXT_HINT;
        }
        if raw & ATTR_MIME_TYPE != 0 {
            let _ = WireStr::read_options(reader, endian, ())?;
            handled |= ATTR_MIME_TYPE;
        }
        if raw & ATTR_LINK_COUNT != 0 {
            let _ = u32::read_options(reader, endian, ())?;
            handled |= ATTR_LINK_COUNT;
        }
        if raw & ATTR_UNTRANSLATED_NAME != 0 {
            let _ = WireStr::read_options(reader, endian, ())?;
            handled |= ATTR_UNTRANSLATED_NAME;
        }

        if flags.extended() {
            let count = u32::read_options(reader, endian, ())?;
            for _ in 0..count {
                let name = WireStr::read_options(reader, endian, ())?;
                let data = WireStr::read_options(reader, endian, ())?;
                attrs.extended.push((name, data));
            }
            handled |= ATTR_EXTENDED;
        }

        let leftover = raw & !handled;
        if leftover != 0 {
            log::debug!("attribute block carries unhandled flag bits {leftover:#010x}");
        }

        Ok(attrs)
    }
}

impl BinWrite for FileAttrs {
    type Args<'a> = (u32,);

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        endian: Endian,
        (version,): Self::Args<'_>,
    ) -> BinResult<()> {
        let flags = self.present_flags(version);
        flags.write_options(writer, endian, ())?;

        if version >= 4 {
            (self.file_type as u8).write_options(writer, endian, ())?;
        }
        if flags.size() {
            self.size.unwrap_or(0).write_options(writer, endian, ())?;
        }
        if flags.allocation_size() {
            self.allocation_size
                .unwrap_or(0)
                .write_options(writer, endian, ())?;
        }
        if flags.uid_gid() {
            self.uid.unwrap_or(0).write_options(writer, endian, ())?;
            self.gid.unwrap_or(0).write_options(writer, endian, ())?;
        }
        if flags.owner_group() {
            self.owner
                .as_ref()
                .cloned()
                .unwrap_or_default()
                .write_options(writer, endian, ())?;
            self.group
                .as_ref()
                .cloned()
                .unwrap_or_default()
                .write_options(writer, endian, ())?;
        }
        if flags.permissions() {
            self.permissions
                .unwrap_or(0)
                .write_options(writer, endian, ())?;
        }
        if version <= 3 {
            if flags.access_time() {
                (self.atime.unwrap_or(0) as u32).write_options(writer, endian, ())?;
                (self.mtime.unwrap_or(0) as u32).write_options(writer, endian, ())?;
            }
        } else {
            let subsec = flags.subsecond_times();
            if flags.access_time() {
                self.atime.unwrap_or(0).write_options(writer, endian, ())?;
                if subsec {
                    self.atime_nsec
                        .unwrap_or(0)
                        .write_options(writer, endian, ())?;
                }
            }
            if flags.create_time() {
                self.createtime
                    .unwrap_or(0)
                    .write_options(writer, endian, ())?;
                if subsec {
                    self.createtime_nsec
                        .unwrap_or(0)
                        .write_options(writer, endian, ())?;
                }
            }
            if flags.modify_time() {
                self.mtime.unwrap_or(0).write_options(writer, endian, ())?;
                if subsec {
                    self.mtime_nsec
                        .unwrap_or(0)
                        .write_options(writer, endian, ())?;
                }
            }
            if flags.ctime() {
                self.ctime.unwrap_or(0).write_options(writer, endian, ())?;
                if subsec {
                    self.ctime_nsec
                        .unwrap_or(0)
                        .write_options(writer, endian, ())?;
                }
            }
        }
        if flags.bits() {
            self.bits.unwrap_or(0).write_options(writer, endian, ())?;
            if version >= 6 {
                self.bits_valid
                    .or(self.bits)
                    .unwrap_or(0)
                    .write_options(writer, endian, ())?;
            }
        }
        if flags.extended() {
            (self.extended.len() as u32).write_options(writer, endian, ())?;
            for (name, data) in &self.extended {
                name.write_options(writer, endian, ())?;
                data.write_options(writer, endian, ())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(attrs: &FileAttrs, version: u32) -> FileAttrs {
        let mut cursor = Cursor::new(Vec::new());
        attrs.write_be_args(&mut cursor, (version,)).unwrap();
        cursor.set_position(0);
        let decoded = FileAttrs::read_be_args(&mut cursor, (version,)).unwrap();
        assert_eq!(
            cursor.position() as usize,
            cursor.get_ref().len(),
            "decoder left bytes behind"
        );
        decoded
    }

    #[test]
    fn v3_size_and_times_round_trip() {
        let attrs = FileAttrs {
            file_type: FileType::Unknown,
            size: Some(123_456),
            atime: Some(1_600_000_000),
            mtime: Some(1_600_000_100),
            ..Default::default()
        };
        assert_eq!(round_trip(&attrs, 3), attrs);
    }

    #[test]
    fn v3_permissions_imply_file_type() {
        let attrs = FileAttrs {
            permissions: Some(0o100644),
            ..Default::default()
        };
        let decoded = round_trip(
            &FileAttrs {
                file_type: FileType::Regular,
                ..attrs.clone()
            },
            3,
        );
        assert_eq!(decoded.file_type, FileType::Regular);
        assert_eq!(decoded.permissions, Some(0o100644));
    }

    #[test]
    fn v6_full_block_round_trip() {
        let attrs = FileAttrs {
            file_type: FileType::Directory,
            size: Some(4096),
            allocation_size: Some(8192),
            owner: Some(WireStr::from("wmo")),
            group: Some(WireStr::from("traffic")),
            permissions: Some(0o755),
            atime: Some(1_700_000_000),
            atime_nsec: Some(250_000_000),
            createtime: Some(1_650_000_000),
            createtime_nsec: Some(0),
            mtime: Some(1_700_000_050),
            mtime_nsec: Some(500),
            ctime: Some(1_700_000_060),
            ctime_nsec: Some(1),
            bits: Some(0x5),
            bits_valid: Some(0x7),
            extended: vec![(WireStr::from("x@example"), WireStr::from("1"))],
            ..Default::default()
        };
        assert_eq!(round_trip(&attrs, 6), attrs);
    }

    #[test]
    fn v3_known_wire_bytes() {
        // flags = SIZE | ACMODTIME, size = 0x200, atime = 1, mtime = 2.
        let bytes = b"\x00\x00\x00\x09\x00\x00\x00\x00\x00\x00\x02\x00\x00\x00\x00\x01\x00\x00\x00\x02";
        let mut cursor = Cursor::new(bytes.to_vec());
        let attrs = FileAttrs::read_be_args(&mut cursor, (3,)).unwrap();
        assert_eq!(attrs.size, Some(0x200));
        assert_eq!(attrs.atime, Some(1));
        assert_eq!(attrs.mtime, Some(2));
    }

    #[test]
    fn version_gated_bits_are_leftover_not_fatal() {
        // OWNERGROUP on a v3 block has no fields to read there; decode
        // must survive and simply report the bit.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x81u32.to_be_bytes()); // SIZE | OWNERGROUP
        bytes.extend_from_slice(&9u64.to_be_bytes());
        let mut cursor = Cursor::new(bytes);
        let attrs = FileAttrs::read_be_args(&mut cursor, (3,)).unwrap();
        assert_eq!(attrs.size, Some(9));
        assert_eq!(attrs.owner, None);
        assert_eq!(cursor.position() as usize, cursor.get_ref().len());
    }

    #[test]
    fn unknown_flag_bits_are_tolerated() {
        // flags = SIZE | LINK_COUNT: the link count u32 must be skipped.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x2001u32.to_be_bytes());
        bytes.push(1); // type byte (v6)
        bytes.extend_from_slice(&77u64.to_be_bytes());
        bytes.extend_from_slice(&3u32.to_be_bytes()); // link count, skipped
        let mut cursor = Cursor::new(bytes);
        let attrs = FileAttrs::read_be_args(&mut cursor, (6,)).unwrap();
        assert_eq!(attrs.size, Some(77));
        assert_eq!(cursor.position() as usize, cursor.get_ref().len());
    }

    #[test]
    fn randomized_v6_round_trips() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5f74_70);
        for _ in 0..200 {
            let subsec: bool = rng.gen();
            let mk_time = |rng: &mut rand::rngs::StdRng| -> (Option<u64>, Option<u32>) {
                if rng.gen() {
                    (
                        Some(rng.gen_range(0..4_000_000_000u64)),
                        subsec.then(|| rng.gen_range(0..1_000_000_000u32)),
                    )
                } else {
                    (None, None)
                }
            };
            let (atime, atime_nsec) = mk_time(&mut rng);
            let (createtime, createtime_nsec) = mk_time(&mut rng);
            let (mtime, mtime_nsec) = mk_time(&mut rng);
            let (ctime, ctime_nsec) = mk_time(&mut rng);
            // The subsecond flag is only meaningful when some time is present.
            let any_time = atime.is_some() || createtime.is_some() || mtime.is_some() || ctime.is_some();
            let attrs = FileAttrs {
                file_type: FileType::from_byte(rng.gen_range(1..=9)),
                size: rng.gen::<bool>().then(|| rng.gen()),
                allocation_size: rng.gen::<bool>().then(|| rng.gen()),
                permissions: rng.gen::<bool>().then(|| rng.gen_range(0..0o7777)),
                atime,
                atime_nsec: atime_nsec.filter(|_| any_time),
                createtime,
                createtime_nsec: createtime_nsec.filter(|_| any_time),
                mtime,
                mtime_nsec: mtime_nsec.filter(|_| any_time),
                ctime,
                ctime_nsec: ctime_nsec.filter(|_| any_time),
                bits: rng.gen::<bool>().then(|| rng.gen()),
                ..Default::default()
            };
            let attrs = FileAttrs {
                bits_valid: attrs.bits,
                ..attrs
            };
            assert_eq!(round_trip(&attrs, 6), attrs);
        }
    }
}
