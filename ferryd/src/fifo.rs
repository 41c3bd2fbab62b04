//! Command channels: named pipes carrying one-byte commands.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::stat::Mode;

use crate::{DaemonError, Result};

/// The supervisor's own command channel inside `fifo/`.
pub const SUPERVISOR_FIFO: &str = "ferryd.cmd";
/// The mask agent listens here for stop/start.
pub const MASK_AGENT_FIFO: &str = "ferry-maskd.cmd";
/// The dispatcher's channel.
pub const DISPATCHER_FIFO: &str = "ferry-dispatch.cmd";
/// The auxiliary worker helper's channel.
pub const WORKER_FIFO: &str = "ferry-workerd.cmd";

/// Commands understood by the supervisor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Shutdown,
    Stop,
    StopMaskAgent,
    StartMaskAgent,
    StopDispatcher,
    StartDispatcher,
    MaskAgentReady,
    IsAlive,
}

impl Command {
    pub fn to_byte(self) -> u8 {
        match self {
            Command::Shutdown => b'S',
            Command::Stop => b'Q',
            Command::StopMaskAgent => b'm',
            Command::StartMaskAgent => b'M',
            Command::StopDispatcher => b'd',
            Command::StartDispatcher => b'D',
            Command::MaskAgentReady => b'r',
            Command::IsAlive => b'a',
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            b'S' => Command::Shutdown,
            b'Q' => Command::Stop,
            b'm' => Command::StopMaskAgent,
            b'M' => Command::StartMaskAgent,
            b'd' => Command::StopDispatcher,
            b'D' => Command::StartDispatcher,
            b'r' => Command::MaskAgentReady,
            b'a' => Command::IsAlive,
            _ => return None,
        })
    }
}

/// Creates the fifo when missing; an existing one is fine.
pub fn create_fifo(path: &Path) -> Result<()> {
    match nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o600)) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(errno) => Err(DaemonError::Fifo(io::Error::from_raw_os_error(errno as i32))),
    }
}

/// Parses a received chunk into commands.
///
/// Senders may terminate a command with CR or LF; the probe for that
/// trailing byte is bounds-checked, a message ending exactly at the CR
/// cannot read past the buffer.
pub fn parse_commands(buf: &[u8]) -> Vec<Command> {
    let mut commands = Vec::new();
    let mut i = 0;
    while i < buf.len() {
        let byte = buf[i];
        i += 1;
        if byte == b'\r' || byte == b'\n' {
            continue;
        }
        match Command::from_byte(byte) {
            Some(cmd) => {
                commands.push(cmd);
                // Swallow one optional CR/LF following the command.
                if matches!(buf.get(i), Some(b'\r') | Some(b'\n')) {
                    i += 1;
                }
            }
            None => log::warn!("ignoring unknown command byte {byte:#04x}"),
        }
    }
    commands
}

/// The reading end of a command channel.
///
/// Opened read-write so the fifo never reports end-of-file when the last
/// writer disappears.
pub struct CommandChannel {
    fifo: File,
}

impl CommandChannel {
    pub fn open(path: &Path) -> Result<Self> {
        create_fifo(path)?;
        let fifo = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(DaemonError::Fifo)?;
        Ok(CommandChannel { fifo })
    }

    /// Waits up to `timeout` for commands; an empty vec means the wait
    /// timed out quietly.
    pub fn wait(&mut self, timeout: Duration) -> Result<Vec<Command>> {
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        let poll_timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);
        let mut fds = [PollFd::new(self.fifo.as_fd(), PollFlags::POLLIN)];
        let ready = loop {
            match poll(&mut fds, poll_timeout) {
                Ok(n) => break n > 0,
                Err(nix::errno::Errno::EINTR) => break false,
                Err(errno) => {
                    return Err(DaemonError::Fifo(io::Error::from_raw_os_error(errno as i32)))
                }
            }
        };
        if !ready {
            return Ok(Vec::new());
        }
        let mut buf = [0u8; 256];
        match self.fifo.read(&mut buf) {
            Ok(n) => Ok(parse_commands(&buf[..n])),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Vec::new()),
            Err(e) => Err(DaemonError::Fifo(e)),
        }
    }
}

/// Writes one command into a fifo, without blocking on a missing reader.
pub fn send_command(path: &Path, cmd: Command) -> Result<()> {
    let mut fifo = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(DaemonError::Fifo)?;
    fifo.write_all(&[cmd.to_byte()])
        .map_err(DaemonError::Fifo)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_round_trip() {
        for cmd in [
            Command::Shutdown,
            Command::Stop,
            Command::StopMaskAgent,
            Command::StartMaskAgent,
            Command::StopDispatcher,
            Command::StartDispatcher,
            Command::MaskAgentReady,
            Command::IsAlive,
        ] {
            assert_eq!(Command::from_byte(cmd.to_byte()), Some(cmd));
        }
        assert_eq!(Command::from_byte(b'x'), None);
    }

    #[test]
    fn parses_mixed_chunks() {
        let cmds = parse_commands(b"S\nQ\r\nM");
        assert_eq!(
            cmds,
            vec![Command::Shutdown, Command::Stop, Command::StartMaskAgent]
        );
    }

    #[test]
    fn trailing_cr_at_end_of_buffer_is_safe() {
        // The message ends exactly at the CR; the probe for the byte
        // after it must not read past the end.
        let cmds = parse_commands(b"a\r");
        assert_eq!(cmds, vec![Command::IsAlive]);
        let cmds = parse_commands(b"a");
        assert_eq!(cmds, vec![Command::IsAlive]);
    }

    #[test]
    fn unknown_bytes_are_skipped() {
        let cmds = parse_commands(b"zSz");
        assert_eq!(cmds, vec![Command::Shutdown]);
    }

    #[test]
    fn channel_delivers_commands() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd.fifo");
        let mut channel = CommandChannel::open(&path).unwrap();

        assert!(channel.wait(Duration::from_millis(20)).unwrap().is_empty());

        send_command(&path, Command::MaskAgentReady).unwrap();
        send_command(&path, Command::Shutdown).unwrap();
        let got = channel.wait(Duration::from_millis(200)).unwrap();
        assert_eq!(got, vec![Command::MaskAgentReady, Command::Shutdown]);
    }
}
