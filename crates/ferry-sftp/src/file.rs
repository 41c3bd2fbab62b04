//! File transfer operations: open, read, write, flush, close.
//!
//! Writes are pipelined through a bounded window of outstanding request
//! ids. A write returns as soon as its frame is on the wire; acks are
//! credited opportunistically (zero-timeout probe) and the caller only
//! blocks when the window is full or at flush time.

use ferry_proto::{
    flags::{ace, disposition},
    FileAttrs, OpenFlags, PacketBuf, PacketType, RawReply, Reply,
};
use ferry_transport::Wire;

use crate::session::SftpSession;
use crate::{Result, SftpError};

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Write, creating the file with `mode` when it does not exist.
    Write { mode: u32 },
}

/// Result of a single [`SftpSession::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were copied into the caller's buffer.
    Data(usize),
    /// The server reported end of file.
    Eof,
}

impl<W: Wire> SftpSession<W> {
    /// Opens a remote file and primes the transfer state.
    ///
    /// For writes, a zero `offset` truncates; a non-zero offset appends
    /// (explicitly from version 5 on, by offset arithmetic below that).
    /// `block_size` is the intended transfer block, used to size the
    /// pending-write window.
    pub fn open_file(
        &mut self,
        path: &str,
        mode: OpenMode,
        offset: u64,
        block_size: u32,
    ) -> Result<()> {
        if self.file_handle.is_some() {
            return Err(SftpError::InvalidState("a file is already open"));
        }
        let id = self.next_id();
        let mut buf = PacketBuf::request(PacketType::Open, id);
        buf.put_str(path);
        if self.version() <= 4 {
            let pflags = match mode {
                OpenMode::Read => OpenFlags::new().with_read(true),
                OpenMode::Write { .. } => {
                    let flags = OpenFlags::new().with_write(true).with_creat(true);
                    if offset == 0 {
                        flags.with_trunc(true)
                    } else {
                        flags
                    }
                }
            };
            buf.put_u32(pflags.as_u32());
        } else {
            let (access, flags) = match mode {
                OpenMode::Read => (ace::READ_DATA, disposition::OPEN_EXISTING),
                OpenMode::Write { .. } => {
                    if offset == 0 {
                        (ace::WRITE_DATA, disposition::CREATE_TRUNCATE)
                    } else {
                        (
                            ace::WRITE_DATA | ace::APPEND_DATA,
                            disposition::OPEN_OR_CREATE | disposition::APPEND_DATA,
                        )
                    }
                }
            };
            buf.put_u32(access);
            buf.put_u32(flags);
        }
        let attrs = match mode {
            OpenMode::Write { mode } => FileAttrs::with_mode(mode),
            OpenMode::Read => FileAttrs::empty(),
        };
        buf.put_attrs(&attrs, self.version())?;
        self.send(buf)?;

        let handle = self.expect_handle(id)?;
        self.file_handle = Some(handle);
        self.file_offset = offset;
        self.pending_writes.clear();
        self.max_pending_writes = self
            .config
            .max_pending_writes
            .min(self.config.pending_write_buffer / block_size.max(1) as usize)
            .max(1);
        Ok(())
    }

    /// Sends one block at the current offset and advances optimistically.
    ///
    /// Blocks only when the pending window is full. Any non-OK ack seen
    /// while draining aborts the transfer.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let handle = self
            .file_handle
            .clone()
            .ok_or(SftpError::InvalidState("no open file for write"))?;
        let id = self.next_id();
        let mut buf = PacketBuf::request(PacketType::Write, id);
        buf.put_wire_str(&handle)
            .put_u64(self.file_offset)
            .put_str(data);
        self.send(buf)?;
        self.file_offset += data.len() as u64;
        self.pending_writes.push(id);

        self.drain_ready_write_acks()?;
        while self.pending_writes.len() > self.max_pending_writes {
            self.wait_one_write_ack()?;
        }
        Ok(())
    }

    /// Credits every ack that is already available without blocking.
    fn drain_ready_write_acks(&mut self) -> Result<()> {
        while let Some(raw) = self.router.take_parked_from(&self.pending_writes) {
            self.credit_write_ack(raw)?;
        }
        while !self.pending_writes.is_empty() {
            match self.router.poll_frame()? {
                Some(raw) => {
                    if self.pending_writes.contains(&raw.id) {
                        self.credit_write_ack(raw)?;
                    } else {
                        self.router.park(raw)?;
                    }
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Blocks until any one pending write is acked.
    fn wait_one_write_ack(&mut self) -> Result<()> {
        let ids = self.pending_writes.clone();
        let raw = self.router.get_reply_from(&ids)?;
        self.credit_write_ack(raw)
    }

    fn credit_write_ack(&mut self, raw: RawReply) -> Result<()> {
        self.pending_writes.retain(|&id| id != raw.id);
        match self.parse(&raw)? {
            Reply::Status(status) if status.is_ok() => Ok(()),
            Reply::Status(status) => Err(SftpError::Remote(status)),
            other => Err(SftpError::UnexpectedReply {
                expected: "STATUS",
                got: other.kind(),
            }),
        }
    }

    /// Drains every outstanding write ack. The first remote failure is
    /// reported after the window is empty; transport failures abort
    /// immediately.
    pub fn flush(&mut self) -> Result<()> {
        let mut failed: Option<SftpError> = None;
        while !self.pending_writes.is_empty() {
            match self.wait_one_write_ack() {
                Ok(()) => {}
                Err(e @ SftpError::Remote(_)) => {
                    if failed.is_none() {
                        failed = Some(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        match failed {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reads up to `buf.len()` bytes at the current offset.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        let handle = self
            .file_handle
            .clone()
            .ok_or(SftpError::InvalidState("no open file for read"))?;
        let id = self.next_id();
        let mut packet = PacketBuf::request(PacketType::Read, id);
        packet
            .put_wire_str(&handle)
            .put_u64(self.file_offset)
            .put_u32(buf.len() as u32);
        self.send(packet)?;
        match self.reply_for(id)? {
            Reply::Data(data) => {
                if data.len() > buf.len() {
                    return Err(SftpError::OversizedData {
                        want: buf.len(),
                        got: data.len(),
                    });
                }
                buf[..data.len()].copy_from_slice(&data);
                self.file_offset += data.len() as u64;
                Ok(ReadOutcome::Data(data.len()))
            }
            Reply::Status(status) if status.is_eof() => Ok(ReadOutcome::Eof),
            Reply::Status(status) => Err(SftpError::Remote(status)),
            other => Err(SftpError::UnexpectedReply {
                expected: "DATA",
                got: other.kind(),
            }),
        }
    }

    /// Closes the open file. Pending writes are flushed first; a close-time
    /// remote error is logged but the handle slot is freed regardless.
    pub fn close_file(&mut self) -> Result<()> {
        if !self.pending_writes.is_empty() {
            self.flush()?;
        }
        let handle = match self.file_handle.take() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        let id = self.next_id();
        let mut buf = PacketBuf::request(PacketType::Close, id);
        buf.put_wire_str(&handle);
        self.send(buf)?;
        let status = self.expect_status(id)?;
        if !status.is_ok() {
            log::warn!("remote close failed ({status}), releasing the handle anyway");
        }
        Ok(())
    }

    /// Offset of the next read or write.
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    /// Outstanding write count, for transfer-log accounting.
    pub fn pending_write_count(&self) -> usize {
        self.pending_writes.len()
    }
}
