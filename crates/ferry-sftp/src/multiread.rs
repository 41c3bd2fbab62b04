//! The pipelined multi-read engine.
//!
//! The caller declares the total transfer size and the block size; the
//! engine keeps a ring of outstanding `READ` requests and delivers their
//! payloads strictly in dispatch order. The window starts small and grows
//! on successful retirement, so a slow link is not flooded up front.
//!
//! A short chunk that is not the final one breaks the contiguity
//! assumption; the engine rolls the file offset back to the start of that
//! chunk and reports [`MultiReadOutcome::Downgrade`] so the caller falls
//! back to sequential [`SftpSession::read`] calls.

use std::collections::VecDeque;

use ferry_proto::{PacketBuf, PacketType, Reply, WireStr};
use ferry_transport::Wire;

use crate::session::SftpSession;
use crate::{Result, SftpError};

/// Outstanding reads to start with.
const INITIAL_PENDING_READS: u32 = 4;
/// Window growth per retired read.
const PENDING_READ_STEP: u32 = 2;
/// Hard ceiling of the window.
const MAX_PENDING_READS: u32 = 64;

/// One result of [`SftpSession::multi_read_catch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiReadOutcome {
    /// `n` bytes landed in the caller's buffer.
    Chunk(usize),
    /// End of file, or every scheduled read retired.
    Eof,
    /// Contiguity broken; discard and switch to sequential reads.
    Downgrade,
}

/// State of an active pipelined read.
pub(crate) struct MultiRead {
    handle: WireStr,
    block_size: u32,
    reads_todo: u32,
    dispatched: u32,
    done: u32,
    /// Dispatch-ordered ring of (request id, file offset of that read).
    pending: VecDeque<(u32, u64)>,
    current_max: u32,
}

impl<W: Wire> SftpSession<W> {
    /// Starts a pipelined read of `total_bytes` in `block_size` blocks on
    /// the open file, dispatching the initial window.
    pub fn multi_read_start(&mut self, total_bytes: u64, block_size: u32) -> Result<()> {
        let handle = self
            .file_handle
            .clone()
            .ok_or(SftpError::InvalidState("no open file for multi-read"))?;
        if self.reader.is_some() {
            return Err(SftpError::InvalidState("multi-read already active"));
        }
        if block_size == 0 {
            return Err(SftpError::InvalidState("multi-read with zero block size"));
        }
        let reads_todo = total_bytes.div_ceil(block_size as u64).min(u32::MAX as u64) as u32;
        let engine = MultiRead {
            handle,
            block_size,
            reads_todo,
            dispatched: 0,
            done: 0,
            pending: VecDeque::new(),
            current_max: INITIAL_PENDING_READS.min(MAX_PENDING_READS),
        };
        self.reader = Some(engine);
        self.multi_read_dispatch()
    }

    /// Tops the window up when it has fallen below the low-water mark.
    pub fn multi_read_dispatch(&mut self) -> Result<()> {
        let mut engine = self
            .reader
            .take()
            .ok_or(SftpError::InvalidState("no active multi-read"))?;
        let result = self.dispatch_inner(&mut engine);
        self.reader = Some(engine);
        result
    }

    fn dispatch_inner(&mut self, engine: &mut MultiRead) -> Result<()> {
        let low_water = (engine.current_max / 2).max(1);
        if engine.pending.len() as u32 >= low_water {
            return Ok(());
        }
        while (engine.pending.len() as u32) < engine.current_max
            && engine.dispatched < engine.reads_todo
        {
            let id = self.next_id();
            let mut buf = PacketBuf::request(PacketType::Read, id);
            buf.put_wire_str(&engine.handle)
                .put_u64(self.file_offset)
                .put_u32(engine.block_size);
            self.send(buf)?;
            engine.pending.push_back((id, self.file_offset));
            self.file_offset += engine.block_size as u64;
            engine.dispatched += 1;
        }
        Ok(())
    }

    /// Delivers the next chunk in dispatch order.
    pub fn multi_read_catch(&mut self, buf: &mut [u8]) -> Result<MultiReadOutcome> {
        let mut engine = self
            .reader
            .take()
            .ok_or(SftpError::InvalidState("no active multi-read"))?;
        let result = self.catch_inner(&mut engine, buf);
        match &result {
            // The engine dissolves once everything is retired.
            Ok(MultiReadOutcome::Eof) if engine.pending.is_empty() => {
                self.reader = None;
            }
            _ => self.reader = Some(engine),
        }
        result
    }

    fn catch_inner(&mut self, engine: &mut MultiRead, buf: &mut [u8]) -> Result<MultiReadOutcome> {
        self.dispatch_inner(engine)?;
        let (id, offset) = match engine.pending.pop_front() {
            Some(slot) => slot,
            None => return Ok(MultiReadOutcome::Eof),
        };
        let raw = self.router.get_reply(id)?;
        match self.parse(&raw)? {
            Reply::Data(data) => {
                if data.len() > buf.len() {
                    return Err(SftpError::OversizedData {
                        want: buf.len(),
                        got: data.len(),
                    });
                }
                let is_final = engine.done + 1 == engine.reads_todo;
                if data.len() != engine.block_size as usize && !is_final {
                    // Mid-stream short chunk. Roll the offset back to this
                    // chunk so sequential reads resume exactly here.
                    self.file_offset = offset;
                    return Ok(MultiReadOutcome::Downgrade);
                }
                buf[..data.len()].copy_from_slice(&data);
                engine.done += 1;
                engine.current_max = (engine.current_max + PENDING_READ_STEP).min(MAX_PENDING_READS);
                Ok(MultiReadOutcome::Chunk(data.len()))
            }
            Reply::Status(status) if status.is_eof() => {
                self.file_offset = offset;
                Ok(MultiReadOutcome::Eof)
            }
            Reply::Status(status) => {
                self.file_offset = offset;
                Err(SftpError::Remote(status))
            }
            other => {
                self.file_offset = offset;
                Err(SftpError::UnexpectedReply {
                    expected: "DATA",
                    got: other.kind(),
                })
            }
        }
    }

    /// Drains every queued read unconditionally and rolls the offset back
    /// to the first undelivered chunk. Used for cleanup after an error or
    /// a downgrade.
    pub fn multi_read_discard(&mut self) -> Result<()> {
        let engine = match self.reader.take() {
            Some(engine) => engine,
            None => return Ok(()),
        };
        if let Some(&(_, first_offset)) = engine.pending.front() {
            // Resume at the earliest undelivered byte. After a downgrade
            // the failed chunk's offset is already lower than any pending
            // read's, so never move forward here.
            self.file_offset = self.file_offset.min(first_offset);
        }
        for (id, _) in engine.pending {
            let raw = self.router.get_reply(id)?;
            // Payload content no longer matters; only the drain does.
            if let Err(e) = self.parse(&raw) {
                log::debug!("discarded multi-read reply {id} failed to parse: {e}");
            }
        }
        Ok(())
    }

    /// True when a pipelined read is active.
    pub fn multi_read_active(&self) -> bool {
        self.reader.is_some()
    }
}
