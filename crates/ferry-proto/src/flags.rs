//! Flag words used by open, rename and attribute blocks.

use std::io::{Read, Seek, Write};

use binrw::{BinRead, BinResult, BinWrite, Endian};
use modular_bitfield::prelude::*;

/// Present-fields word of an attribute block.
///
/// Bit 3 is `ACMODTIME` for protocol version <= 3 and `ACCESSTIME` from
/// version 4 on; the field keeps the v4 name and the attribute codec decides
/// by version.
///
/// Reference: draft-ietf-secsh-filexfer-13 section 7.1.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrFlags {
    pub size: bool,
    pub uid_gid: bool,
    pub permissions: bool,
    pub access_time: bool,
    pub create_time: bool,
    pub modify_time: bool,
    pub subsecond_times: bool,
    pub owner_group: bool,
    #[skip]
    __: B1,
    pub bits: bool,
    pub allocation_size: bool,
    #[skip]
    __: B4,
    pub ctime: bool,
    #[skip]
    __: B15,
    pub extended: bool,
}

impl AttrFlags {
    pub fn from_u32(value: u32) -> Self {
        Self::from_bytes(value.to_le_bytes())
    }

    pub fn as_u32(&self) -> u32 {
        u32::from_le_bytes(self.into_bytes())
    }
}

/// Open flags for protocol version <= 4.
///
/// Reference: draft-ietf-secsh-filexfer-02 section 6.3.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub creat: bool,
    pub trunc: bool,
    pub excl: bool,
    #[skip]
    __: B26,
}

impl OpenFlags {
    pub fn as_u32(&self) -> u32 {
        u32::from_le_bytes(self.into_bytes())
    }
}

/// Rename flags for protocol version > 5.
///
/// Reference: draft-ietf-secsh-filexfer-13 section 8.3.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenameFlags {
    pub overwrite: bool,
    pub atomic: bool,
    pub native: bool,
    #[skip]
    __: B29,
}

impl RenameFlags {
    pub fn as_u32(&self) -> u32 {
        u32::from_le_bytes(self.into_bytes())
    }
}

macro_rules! binrw_as_u32 {
    ($($name:ident),+) => {
        $(
            impl BinRead for $name {
                type Args<'a> = ();

                fn read_options<R: Read + Seek>(
                    reader: &mut R,
                    endian: Endian,
                    _: Self::Args<'_>,
                ) -> BinResult<Self> {
                    let value = u32::read_options(reader, endian, ())?;
                    Ok(Self::from_bytes(value.to_le_bytes()))
                }
            }

            impl BinWrite for $name {
                type Args<'a> = ();

                fn write_options<W: Write + Seek>(
                    &self,
                    writer: &mut W,
                    endian: Endian,
                    _: Self::Args<'_>,
                ) -> BinResult<()> {
                    u32::from_le_bytes(self.into_bytes()).write_options(writer, endian, ())
                }
            }
        )+
    };
}

binrw_as_u32!(AttrFlags, OpenFlags, RenameFlags);

/// ACE mask bits requested on `SSH_FXP_OPEN` for version > 4.
///
/// Reference: draft-ietf-secsh-filexfer-13 section 7.8.
pub mod ace {
    pub const READ_DATA: u32 = 0x0000_0001;
    pub const WRITE_DATA: u32 = 0x0000_0002;
    pub const APPEND_DATA: u32 = 0x0000_0004;
}

/// Open disposition and modifier bits for version > 4.
///
/// The low three bits select the disposition; `APPEND_DATA` is a modifier.
///
/// Reference: draft-ietf-secsh-filexfer-13 section 8.1.1.
pub mod disposition {
    pub const CREATE_NEW: u32 = 0x0000_0000;
    pub const CREATE_TRUNCATE: u32 = 0x0000_0001;
    pub const OPEN_EXISTING: u32 = 0x0000_0002;
    pub const OPEN_OR_CREATE: u32 = 0x0000_0003;
    pub const TRUNCATE_EXISTING: u32 = 0x0000_0004;
    pub const APPEND_DATA: u32 = 0x0000_0008;
}
