//! The SFTP session state machine.
//!
//! One value of [`SftpSession`] is one connection: handshake at
//! construction, operations while `READY`, [`SftpSession::quit`] at the
//! end. Operations follow the propagation policy of the transfer engine:
//! one opportunistic retry exactly where documented (directory creation on
//! `cd` and `move`), nothing else.

use std::collections::VecDeque;
use std::io::Cursor;

use ferry_proto::{
    extensions::{EXT_FSYNC, EXT_HARDLINK, EXT_POSIX_RENAME, EXT_STATVFS},
    wire, AttrFlags, Extensions, FileAttrs, NameEntry, PacketBuf, PacketType, RawReply, Reply,
    StatusBody, StatusCode, WireStr, MAX_SFTP_VERSION,
};
use ferry_transport::Wire;

use crate::multiread::MultiRead;
use crate::router::ReplyRouter;
use crate::{Result, SessionConfig, SftpError};

/// Filesystem usage as returned by the `statvfs@openssh.com` extension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatVfs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub fsid: u64,
    pub flag: u64,
    pub namemax: u64,
}

impl StatVfs {
    /// Bytes available to the unprivileged user.
    pub fn bytes_available(&self) -> u64 {
        self.frsize.saturating_mul(self.bavail)
    }
}

/// A connected SFTP session.
pub struct SftpSession<W: Wire> {
    pub(crate) router: ReplyRouter<W>,
    pub(crate) config: SessionConfig,
    version: u32,
    extensions: Extensions,
    next_id: u32,
    cwd: Option<String>,

    // Open-file state.
    pub(crate) file_handle: Option<WireStr>,
    pub(crate) file_offset: u64,
    pub(crate) pending_writes: Vec<u32>,
    pub(crate) max_pending_writes: usize,

    // Open-directory state.
    pub(crate) dir_handle: Option<WireStr>,
    pub(crate) dir_cache: VecDeque<NameEntry>,
    pub(crate) dir_eof: bool,

    // Pipelined-read engine, present while a multi-read is active.
    pub(crate) reader: Option<MultiRead>,

    stat_cache: Option<FileAttrs>,
}

impl<W: Wire> SftpSession<W> {
    /// Performs the INIT/VERSION handshake and returns a ready session.
    ///
    /// The negotiated version is `min(ours, theirs)`; extension
    /// announcements are cached regardless of the negotiated number.
    pub fn handshake(wire: W, config: SessionConfig) -> Result<Self> {
        let mut router = ReplyRouter::new(wire, &config);
        let mut init = PacketBuf::bare(PacketType::Init);
        init.put_u32(MAX_SFTP_VERSION);
        router.send(init.finish(config.max_frame)?)?;

        let frame = router.read_frame()?;
        let reply = Reply::parse(MAX_SFTP_VERSION, &frame)?;
        let (theirs, extensions) = match reply {
            Reply::Version {
                version,
                extensions,
            } => (version, extensions),
            other => {
                return Err(SftpError::UnexpectedReply {
                    expected: "VERSION",
                    got: other.kind(),
                })
            }
        };
        let version = theirs.min(MAX_SFTP_VERSION);
        log::debug!("sftp handshake done, version {version}, extensions {extensions:?}");

        Ok(SftpSession {
            router,
            config,
            version,
            extensions,
            next_id: 0,
            cwd: None,
            file_handle: None,
            file_offset: 0,
            pending_writes: Vec::new(),
            max_pending_writes: 0,
            dir_handle: None,
            dir_cache: VecDeque::new(),
            dir_eof: false,
            reader: None,
            stat_cache: None,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    /// The attributes returned by the most recent stat-family call.
    pub fn cached_stat(&self) -> Option<&FileAttrs> {
        self.stat_cache.as_ref()
    }

    pub(crate) fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn send(&mut self, buf: PacketBuf) -> Result<()> {
        let frame = buf.finish(self.config.max_frame)?;
        self.router.send(frame)
    }

    pub(crate) fn reply_for(&mut self, id: u32) -> Result<Reply> {
        let raw = self.router.get_reply(id)?;
        self.parse(&raw)
    }

    pub(crate) fn parse(&self, raw: &RawReply) -> Result<Reply> {
        Ok(Reply::parse(self.version, raw)?)
    }

    pub(crate) fn expect_status(&mut self, id: u32) -> Result<StatusBody> {
        match self.reply_for(id)? {
            Reply::Status(status) => Ok(status),
            other => Err(SftpError::UnexpectedReply {
                expected: "STATUS",
                got: other.kind(),
            }),
        }
    }

    pub(crate) fn expect_ok(&mut self, id: u32) -> Result<()> {
        let status = self.expect_status(id)?;
        if status.is_ok() {
            Ok(())
        } else {
            Err(SftpError::Remote(status))
        }
    }

    pub(crate) fn expect_handle(&mut self, id: u32) -> Result<WireStr> {
        match self.reply_for(id)? {
            Reply::Handle(handle) => Ok(handle),
            Reply::Status(status) => Err(SftpError::Remote(status)),
            other => Err(SftpError::UnexpectedReply {
                expected: "HANDLE",
                got: other.kind(),
            }),
        }
    }

    fn expect_single_name(&mut self, id: u32) -> Result<NameEntry> {
        match self.reply_for(id)? {
            Reply::Name(mut entries) => {
                if entries.len() == 1 {
                    Ok(entries.remove(0))
                } else {
                    Err(SftpError::UnexpectedReply {
                        expected: "NAME with one entry",
                        got: "NAME",
                    })
                }
            }
            Reply::Status(status) => Err(SftpError::Remote(status)),
            other => Err(SftpError::UnexpectedReply {
                expected: "NAME",
                got: other.kind(),
            }),
        }
    }

    /// `REALPATH` for one path.
    fn realpath(&mut self, path: &str) -> Result<String> {
        let id = self.next_id();
        let mut buf = PacketBuf::request(PacketType::Realpath, id);
        buf.put_str(path);
        self.send(buf)?;
        let entry = self.expect_single_name(id)?;
        Ok(entry.filename.to_string_lossy())
    }

    /// Resolves and stores the working directory of the login account.
    pub fn pwd(&mut self) -> Result<String> {
        let resolved = self.realpath(".")?;
        self.cwd = Some(resolved.clone());
        Ok(resolved)
    }

    /// Changes the working directory, optionally creating the path.
    ///
    /// Servers speaking version < 4 resolve names that do not exist, so the
    /// resolved path is verified with `stat` there. When `create` is set
    /// and the directory is missing, the path is walked component by
    /// component (`stat` + `mkdir` with `mode`) and the `cd` retried once.
    /// Every component the walk touches is appended to `created`.
    pub fn cd(
        &mut self,
        dir: &str,
        create: bool,
        mode: u32,
        mut created: Option<&mut String>,
    ) -> Result<()> {
        match self.try_cd(dir) {
            Ok(resolved) => {
                self.cwd = Some(resolved);
                Ok(())
            }
            Err(ref e) if e.is_no_such_file() && create => {
                self.create_path(dir, mode, &mut created)?;
                // One retry after the walk, verification included.
                let resolved = self.try_cd(dir)?;
                self.cwd = Some(resolved);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// One `cd` attempt: resolve, and verify on servers that resolve
    /// names which do not exist.
    fn try_cd(&mut self, dir: &str) -> Result<String> {
        let resolved = self.realpath(dir)?;
        if self.version < 4 {
            self.stat(&resolved)?;
        }
        Ok(resolved)
    }

    /// Walks `dir` component by component, creating what is missing.
    pub(crate) fn create_path(
        &mut self,
        dir: &str,
        mode: u32,
        created: &mut Option<&mut String>,
    ) -> Result<()> {
        let absolute = dir.starts_with('/');
        let mut prefix = String::new();
        let mut first = true;
        for component in dir.split('/').filter(|c| !c.is_empty() && *c != ".") {
            if absolute || !first {
                prefix.push('/');
            }
            prefix.push_str(component);
            first = false;
            match self.stat(&prefix) {
                Ok(_) => {}
                Err(ref e) if e.is_no_such_file() => {
                    self.mkdir(&prefix, mode)?;
                }
                Err(e) => return Err(e),
            }
            if let Some(buf) = created.as_mut() {
                if !buf.is_empty() {
                    buf.push('/');
                }
                buf.push_str(component);
            }
        }
        Ok(())
    }

    /// The attribute mask requested with stat-family calls.
    fn stat_flags(&self) -> u32 {
        if self.version > 4 {
            AttrFlags::new()
                .with_size(true)
                .with_modify_time(true)
                .as_u32()
        } else {
            AttrFlags::new()
                .with_size(true)
                .with_access_time(true)
                .as_u32()
        }
    }

    /// `STAT` on a path.
    pub fn stat(&mut self, path: &str) -> Result<FileAttrs> {
        let id = self.next_id();
        let mut buf = PacketBuf::request(PacketType::Stat, id);
        buf.put_str(path);
        if self.version >= 4 {
            buf.put_u32(self.stat_flags());
        }
        self.send(buf)?;
        match self.reply_for(id)? {
            Reply::Attrs(attrs) => {
                self.stat_cache = Some(attrs.clone());
                Ok(attrs)
            }
            Reply::Status(status) => Err(SftpError::Remote(status)),
            other => Err(SftpError::UnexpectedReply {
                expected: "ATTRS",
                got: other.kind(),
            }),
        }
    }

    /// `FSTAT` on the open file handle.
    pub fn fstat(&mut self) -> Result<FileAttrs> {
        let handle = self
            .file_handle
            .clone()
            .ok_or(SftpError::InvalidState("no open file for fstat"))?;
        let id = self.next_id();
        let mut buf = PacketBuf::request(PacketType::Fstat, id);
        buf.put_wire_str(&handle);
        if self.version >= 4 {
            buf.put_u32(self.stat_flags());
        }
        self.send(buf)?;
        match self.reply_for(id)? {
            Reply::Attrs(attrs) => {
                self.stat_cache = Some(attrs.clone());
                Ok(attrs)
            }
            Reply::Status(status) => Err(SftpError::Remote(status)),
            other => Err(SftpError::UnexpectedReply {
                expected: "ATTRS",
                got: other.kind(),
            }),
        }
    }

    pub fn mkdir(&mut self, path: &str, mode: u32) -> Result<()> {
        let id = self.next_id();
        let mut buf = PacketBuf::request(PacketType::Mkdir, id);
        buf.put_str(path);
        buf.put_attrs(&FileAttrs::with_mode(mode), self.version)?;
        self.send(buf)?;
        self.expect_ok(id)
    }

    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        let id = self.next_id();
        let mut buf = PacketBuf::request(PacketType::Rmdir, id);
        buf.put_str(path);
        self.send(buf)?;
        self.expect_ok(id)
    }

    /// Removes a remote file.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let id = self.next_id();
        let mut buf = PacketBuf::request(PacketType::Remove, id);
        buf.put_str(path);
        self.send(buf)?;
        self.expect_ok(id)
    }

    /// `chmod`.
    pub fn set_mode(&mut self, path: &str, mode: u32) -> Result<()> {
        let id = self.next_id();
        let mut buf = PacketBuf::request(PacketType::Setstat, id);
        buf.put_str(path);
        buf.put_attrs(&FileAttrs::with_mode(mode), self.version)?;
        self.send(buf)?;
        self.expect_ok(id)
    }

    /// Sets access and modification time, seconds since the epoch.
    pub fn set_times(&mut self, path: &str, atime: u64, mtime: u64) -> Result<()> {
        let id = self.next_id();
        let mut buf = PacketBuf::request(PacketType::Setstat, id);
        buf.put_str(path);
        buf.put_attrs(&FileAttrs::with_times(atime, mtime), self.version)?;
        self.send(buf)?;
        self.expect_ok(id)
    }

    /// Renames `from` to `to`, with the documented legacy workarounds.
    ///
    /// With the posix-rename extension this is a single atomic operation.
    /// Otherwise `RENAME` is used, with `OVERWRITE | ATOMIC` on version > 5.
    /// Two legacy failures each earn exactly one retry: `FAILURE` on a
    /// version < 5 server (destination removed first, when `create_dir` is
    /// set), and `NO_SUCH_FILE` for a destination with a missing parent
    /// chain (parents created first).
    pub fn move_file(
        &mut self,
        from: &str,
        to: &str,
        create_dir: bool,
        mode: u32,
        mut created: Option<&mut String>,
    ) -> Result<()> {
        match self.rename_once(from, to) {
            Ok(()) => Ok(()),
            Err(first) => {
                let retry = match first.remote_code() {
                    Some(StatusCode::Failure) if self.version < 5 && create_dir => {
                        self.remove(to)?;
                        true
                    }
                    Some(StatusCode::NoSuchFile) | Some(StatusCode::NoSuchPath) => {
                        match to.rfind('/') {
                            Some(slash) if slash > 0 => {
                                let parent = &to[..slash];
                                let parent = parent.to_string();
                                self.create_path(&parent, mode, &mut created)?;
                                true
                            }
                            _ => false,
                        }
                    }
                    _ => false,
                };
                if retry {
                    self.rename_once(from, to)
                } else {
                    Err(first)
                }
            }
        }
    }

    fn rename_once(&mut self, from: &str, to: &str) -> Result<()> {
        let id = self.next_id();
        if self.extensions.posix_rename.is_some() {
            let mut buf = PacketBuf::request(PacketType::Extended, id);
            buf.put_str(EXT_POSIX_RENAME).put_str(from).put_str(to);
            self.send(buf)?;
        } else {
            let mut buf = PacketBuf::request(PacketType::Rename, id);
            buf.put_str(from).put_str(to);
            if self.version > 5 {
                buf.put_u32(
                    ferry_proto::RenameFlags::new()
                        .with_overwrite(true)
                        .with_atomic(true)
                        .as_u32(),
                );
            }
            self.send(buf)?;
        }
        self.expect_ok(id)
    }

    /// `READLINK`, returning the link target.
    pub fn readlink(&mut self, path: &str) -> Result<String> {
        let id = self.next_id();
        let mut buf = PacketBuf::request(PacketType::Readlink, id);
        buf.put_str(path);
        self.send(buf)?;
        let entry = self.expect_single_name(id)?;
        Ok(entry.filename.to_string_lossy())
    }

    /// `hardlink@openssh.com`.
    pub fn hardlink(&mut self, existing: &str, link: &str) -> Result<()> {
        if self.extensions.hardlink.is_none() {
            return Err(SftpError::InvalidState("hardlink extension not advertised"));
        }
        let id = self.next_id();
        let mut buf = PacketBuf::request(PacketType::Extended, id);
        buf.put_str(EXT_HARDLINK).put_str(existing).put_str(link);
        self.send(buf)?;
        self.expect_ok(id)
    }

    /// `statvfs@openssh.com`: free-space query before large fetches.
    pub fn statvfs(&mut self, path: &str) -> Result<StatVfs> {
        if self.extensions.statvfs.is_none() {
            return Err(SftpError::InvalidState("statvfs extension not advertised"));
        }
        let id = self.next_id();
        let mut buf = PacketBuf::request(PacketType::Extended, id);
        buf.put_str(EXT_STATVFS).put_str(path);
        self.send(buf)?;
        match self.reply_for(id)? {
            Reply::ExtendedReply(body) => {
                let mut cursor = Cursor::new(body.as_slice());
                Ok(StatVfs {
                    bsize: wire::get_u64(&mut cursor)?,
                    frsize: wire::get_u64(&mut cursor)?,
                    blocks: wire::get_u64(&mut cursor)?,
                    bfree: wire::get_u64(&mut cursor)?,
                    bavail: wire::get_u64(&mut cursor)?,
                    files: wire::get_u64(&mut cursor)?,
                    ffree: wire::get_u64(&mut cursor)?,
                    favail: wire::get_u64(&mut cursor)?,
                    fsid: wire::get_u64(&mut cursor)?,
                    flag: wire::get_u64(&mut cursor)?,
                    namemax: wire::get_u64(&mut cursor)?,
                })
            }
            Reply::Status(status) => Err(SftpError::Remote(status)),
            other => Err(SftpError::UnexpectedReply {
                expected: "EXTENDED_REPLY",
                got: other.kind(),
            }),
        }
    }

    /// `fsync@openssh.com` on the open file. A no-op when the server did
    /// not advertise the extension.
    pub fn fsync(&mut self) -> Result<()> {
        if self.extensions.fsync.is_none() {
            return Ok(());
        }
        let handle = self
            .file_handle
            .clone()
            .ok_or(SftpError::InvalidState("no open file for fsync"))?;
        let id = self.next_id();
        let mut buf = PacketBuf::request(PacketType::Extended, id);
        buf.put_str(EXT_FSYNC).put_wire_str(&handle);
        self.send(buf)?;
        self.expect_ok(id)
    }

    /// Keep-alive. The protocol has no dedicated no-op, so this stats ".".
    pub fn noop(&mut self) -> Result<()> {
        self.stat(".").map(|_| ())
    }

    /// Ends the session: closes whatever is still open and hands the wire
    /// back so the owner can shut the helper down.
    pub fn quit(mut self) -> W {
        if self.reader.is_some() {
            if let Err(e) = self.multi_read_discard() {
                log::debug!("discarding pipelined reads at quit failed: {e}");
            }
        }
        if self.file_handle.is_some() {
            if let Err(e) = self.close_file() {
                log::debug!("closing file at quit failed: {e}");
            }
        }
        if self.dir_handle.is_some() {
            if let Err(e) = self.close_dir() {
                log::debug!("closing directory at quit failed: {e}");
            }
        }
        self.router.into_wire()
    }
}
