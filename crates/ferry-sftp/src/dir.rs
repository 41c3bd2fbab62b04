//! Directory listing: OPENDIR, READDIR with an entry cache, CLOSEDIR.

use std::collections::VecDeque;

use ferry_proto::{NameEntry, PacketBuf, PacketType, Reply};
use ferry_transport::Wire;

use crate::session::SftpSession;
use crate::{Result, SftpError};

impl<W: Wire> SftpSession<W> {
    /// Opens a directory for enumeration.
    pub fn open_dir(&mut self, path: &str) -> Result<()> {
        if self.dir_handle.is_some() {
            return Err(SftpError::InvalidState("a directory is already open"));
        }
        let id = self.next_id();
        let mut buf = PacketBuf::request(PacketType::Opendir, id);
        buf.put_str(path);
        self.send(buf)?;
        let handle = self.expect_handle(id)?;
        self.dir_handle = Some(handle);
        self.dir_cache.clear();
        self.dir_eof = false;
        Ok(())
    }

    /// Returns the next directory entry, refilling the cache with one
    /// `READDIR` when it runs dry. `None` means the listing is exhausted.
    pub fn read_dir_entry(&mut self) -> Result<Option<NameEntry>> {
        loop {
            if let Some(entry) = self.dir_cache.pop_front() {
                return Ok(Some(entry));
            }
            if self.dir_eof {
                return Ok(None);
            }
            let handle = self
                .dir_handle
                .clone()
                .ok_or(SftpError::InvalidState("no open directory"))?;
            let id = self.next_id();
            let mut buf = PacketBuf::request(PacketType::Readdir, id);
            buf.put_wire_str(&handle);
            self.send(buf)?;
            match self.reply_for(id)? {
                Reply::Name(entries) => {
                    if entries.is_empty() {
                        self.dir_eof = true;
                        return Ok(None);
                    }
                    self.dir_cache = VecDeque::from(entries);
                }
                Reply::Status(status) if status.is_eof() => {
                    self.dir_eof = true;
                    return Ok(None);
                }
                Reply::Status(status) => return Err(SftpError::Remote(status)),
                other => {
                    return Err(SftpError::UnexpectedReply {
                        expected: "NAME",
                        got: other.kind(),
                    })
                }
            }
        }
    }

    /// Closes the open directory and frees the entry cache. A remote
    /// close error is logged, not fatal.
    pub fn close_dir(&mut self) -> Result<()> {
        let handle = match self.dir_handle.take() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        self.dir_cache.clear();
        self.dir_eof = false;
        let id = self.next_id();
        let mut buf = PacketBuf::request(PacketType::Close, id);
        buf.put_wire_str(&handle);
        self.send(buf)?;
        let status = self.expect_status(id)?;
        if !status.is_ok() {
            log::warn!("remote closedir failed ({status}), releasing the handle anyway");
        }
        Ok(())
    }

    /// Convenience: a full listing of `path`.
    pub fn list_dir(&mut self, path: &str) -> Result<Vec<NameEntry>> {
        self.open_dir(path)?;
        let mut entries = Vec::new();
        loop {
            match self.read_dir_entry() {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => break,
                Err(e) => {
                    // Free the handle before surfacing the listing error.
                    if let Err(close_err) = self.close_dir() {
                        log::debug!("closedir after listing failure also failed: {close_err}");
                    }
                    return Err(e);
                }
            }
        }
        self.close_dir()?;
        Ok(entries)
    }
}
