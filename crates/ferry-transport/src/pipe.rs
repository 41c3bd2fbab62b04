//! Deadline-bounded reads and writes on the helper's pipe pair.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::error::{FailureCause, TransportError};
use crate::Wire;

/// Per-syscall write ceiling.
///
/// `POLLOUT` on a pipe guarantees room for at least `PIPE_BUF` bytes, so a
/// chunk of this size cannot block once the poll reported writable. That is
/// what bounds the inner syscall instead of the legacy alarm trick.
const WRITE_CHUNK: usize = 4096;

/// The two pipe ends of a spawned helper, with deadline enforcement.
pub struct ChildPipe {
    reader: File,
    writer: File,
    last_failure: Option<FailureCause>,
}

impl ChildPipe {
    /// Wraps the helper's stdout (`reader`) and stdin (`writer`).
    pub fn new(reader: File, writer: File) -> Self {
        ChildPipe {
            reader,
            writer,
            last_failure: None,
        }
    }

    /// The sticky cause of the last timeout or reset, if any.
    pub fn last_failure(&self) -> Option<FailureCause> {
        self.last_failure
    }

    fn fail(&mut self, cause: FailureCause, err: TransportError) -> TransportError {
        self.last_failure = Some(cause);
        err
    }

    /// Readiness wait bounded by `remaining`. `Ok(false)` means the wait
    /// timed out.
    fn wait(fd: &File, flags: PollFlags, remaining: Duration) -> crate::Result<bool> {
        let millis = remaining.as_millis().min(i32::MAX as u128) as i32;
        let timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);
        let mut fds = [PollFd::new(fd.as_fd(), flags)];
        loop {
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(errno) => {
                    return Err(TransportError::Io(io::Error::from_raw_os_error(
                        errno as i32,
                    )))
                }
            }
        }
    }

    fn remaining(start: Instant, deadline: Duration) -> Option<Duration> {
        deadline.checked_sub(start.elapsed())
    }
}

impl Wire for ChildPipe {
    fn write_all(&mut self, buf: &[u8], deadline: Duration) -> crate::Result<()> {
        let start = Instant::now();
        let mut sent = 0;
        while sent < buf.len() {
            let remaining = match Self::remaining(start, deadline) {
                Some(d) => d,
                None => {
                    return Err(self.fail(FailureCause::Timeout, TransportError::Timeout(deadline)))
                }
            };
            if !Self::wait(&self.writer, PollFlags::POLLOUT, remaining)? {
                return Err(self.fail(FailureCause::Timeout, TransportError::Timeout(deadline)));
            }
            let end = (sent + WRITE_CHUNK).min(buf.len());
            match self.writer.write(&buf[sent..end]) {
                Ok(0) => {
                    return Err(self.fail(FailureCause::Reset, TransportError::ConnectionReset))
                }
                Ok(n) => sent += n,
                Err(e)
                    if e.kind() == io::ErrorKind::Interrupted
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    continue
                }
                Err(e)
                    if e.kind() == io::ErrorKind::BrokenPipe
                        || e.kind() == io::ErrorKind::ConnectionReset =>
                {
                    return Err(self.fail(FailureCause::Reset, TransportError::ConnectionReset))
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8], deadline: Duration) -> crate::Result<()> {
        let start = Instant::now();
        let mut filled = 0;
        while filled < buf.len() {
            let remaining = match Self::remaining(start, deadline) {
                Some(d) => d,
                None => {
                    return Err(self.fail(FailureCause::Timeout, TransportError::Timeout(deadline)))
                }
            };
            if !Self::wait(&self.reader, PollFlags::POLLIN, remaining)? {
                return Err(self.fail(FailureCause::Timeout, TransportError::Timeout(deadline)));
            }
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => return Err(TransportError::ConnectionClosed),
                Ok(n) => filled += n,
                Err(e)
                    if e.kind() == io::ErrorKind::Interrupted
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    continue
                }
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    return Err(self.fail(FailureCause::Reset, TransportError::ConnectionReset))
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
        Ok(())
    }

    fn readable(&mut self, timeout: Duration) -> crate::Result<bool> {
        Self::wait(&self.reader, PollFlags::POLLIN, timeout)
    }
}
