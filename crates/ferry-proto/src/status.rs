//! SFTP status codes.

/// Status codes carried by `SSH_FXP_STATUS` replies.
///
/// Codes 0-8 are the protocol version 3 set; the rest were added by the
/// later filexfer drafts. Servers may still send codes we do not know, so
/// conversion from the wire goes through [`StatusCode::from_u32`] and the
/// raw value is kept alongside.
///
/// Reference: draft-ietf-secsh-filexfer-13 section 9.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    Eof = 1,
    NoSuchFile = 2,
    PermissionDenied = 3,
    Failure = 4,
    BadMessage = 5,
    NoConnection = 6,
    ConnectionLost = 7,
    OpUnsupported = 8,
    InvalidHandle = 9,
    NoSuchPath = 10,
    FileAlreadyExists = 11,
    WriteProtect = 12,
    NoMedia = 13,
    NoSpaceOnFilesystem = 14,
    QuotaExceeded = 15,
    UnknownPrincipal = 16,
    LockConflict = 17,
    DirNotEmpty = 18,
    NotADirectory = 19,
    InvalidFilename = 20,
    LinkLoop = 21,
    CannotDelete = 22,
    InvalidParameter = 23,
    FileIsADirectory = 24,
    ByteRangeLockConflict = 25,
    ByteRangeLockRefused = 26,
    DeletePending = 27,
    FileCorrupt = 28,
    OwnerInvalid = 29,
    GroupInvalid = 30,
    NoMatchingByteRangeLock = 31,
}

impl StatusCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        use StatusCode::*;
        Some(match value {
            0 => Ok,
            1 => Eof,
            2 => NoSuchFile,
            3 => PermissionDenied,
            4 => Failure,
            5 => BadMessage,
            6 => NoConnection,
            7 => ConnectionLost,
            8 => OpUnsupported,
            9 => InvalidHandle,
            10 => NoSuchPath,
            11 => FileAlreadyExists,
            12 => WriteProtect,
            13 => NoMedia,
            14 => NoSpaceOnFilesystem,
            15 => QuotaExceeded,
            16 => UnknownPrincipal,
            17 => LockConflict,
            18 => DirNotEmpty,
            19 => NotADirectory,
            20 => InvalidFilename,
            21 => LinkLoop,
            22 => CannotDelete,
            23 => InvalidParameter,
            24 => FileIsADirectory,
            25 => ByteRangeLockConflict,
            26 => ByteRangeLockRefused,
            27 => DeletePending,
            28 => FileCorrupt,
            29 => OwnerInvalid,
            30 => GroupInvalid,
            31 => NoMatchingByteRangeLock,
            _ => return None,
        })
    }

    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }

    /// End-of-data marker; benign for read and readdir.
    pub fn is_eof(self) -> bool {
        self == StatusCode::Eof
    }

    /// Human wording for a raw wire value, hex for codes we do not know.
    pub fn describe(value: u32) -> String {
        match Self::from_u32(value) {
            Some(code) => format!("{code}"),
            None => format!("unknown status {value:#x}"),
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            StatusCode::Ok => "no error",
            StatusCode::Eof => "end of file",
            StatusCode::NoSuchFile => "no such file",
            StatusCode::PermissionDenied => "permission denied",
            StatusCode::Failure => "failure",
            StatusCode::BadMessage => "bad message",
            StatusCode::NoConnection => "no connection",
            StatusCode::ConnectionLost => "connection lost",
            StatusCode::OpUnsupported => "operation unsupported",
            StatusCode::InvalidHandle => "invalid handle",
            StatusCode::NoSuchPath => "no such path",
            StatusCode::FileAlreadyExists => "file already exists",
            StatusCode::WriteProtect => "write protect",
            StatusCode::NoMedia => "no media",
            StatusCode::NoSpaceOnFilesystem => "no space on filesystem",
            StatusCode::QuotaExceeded => "quota exceeded",
            StatusCode::UnknownPrincipal => "unknown principal",
            StatusCode::LockConflict => "lock conflict",
            StatusCode::DirNotEmpty => "directory not empty",
            StatusCode::NotADirectory => "not a directory",
            StatusCode::InvalidFilename => "invalid filename",
            StatusCode::LinkLoop => "link loop",
            StatusCode::CannotDelete => "cannot delete",
            StatusCode::InvalidParameter => "invalid parameter",
            StatusCode::FileIsADirectory => "file is a directory",
            StatusCode::ByteRangeLockConflict => "byte range lock conflict",
            StatusCode::ByteRangeLockRefused => "byte range lock refused",
            StatusCode::DeletePending => "delete pending",
            StatusCode::FileCorrupt => "file corrupt",
            StatusCode::OwnerInvalid => "owner invalid",
            StatusCode::GroupInvalid => "group invalid",
            StatusCode::NoMatchingByteRangeLock => "no matching byte range lock",
        };
        write!(f, "{} ({})", text, *self as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_known_code() {
        for value in 0..=31u32 {
            let code = StatusCode::from_u32(value).unwrap();
            assert_eq!(code as u32, value);
        }
        assert_eq!(StatusCode::from_u32(32), None);
    }

    #[test]
    fn describes_unknown_codes_as_hex() {
        assert_eq!(StatusCode::describe(0x100), "unknown status 0x100");
        assert_eq!(StatusCode::describe(2), "no such file (2)");
    }

    #[test]
    fn eof_is_not_ok() {
        assert!(StatusCode::Eof.is_eof());
        assert!(!StatusCode::Eof.is_ok());
        assert!(StatusCode::Ok.is_ok());
    }
}
