//! Spawning and reaping the remote-shell helper process.

use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use crate::pipe::ChildPipe;
use crate::TransportError;

/// How the remote-shell helper is launched.
///
/// Authentication is the helper's business (keys, agent, host config); this
/// side only assembles the argv and owns the pipes.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub program: PathBuf,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub identity: Option<PathBuf>,
    /// Extra `-o` style options, passed through verbatim.
    pub options: Vec<String>,
    pub subsystem: String,
}

impl SshConfig {
    pub fn new(host: impl Into<String>) -> Self {
        SshConfig {
            program: PathBuf::from("ssh"),
            host: host.into(),
            port: 22,
            user: None,
            identity: None,
            options: Vec::new(),
            subsystem: "sftp".to_string(),
        }
    }

    fn argv(&self) -> Vec<OsString> {
        let mut argv: Vec<OsString> = vec!["-oBatchMode=yes".into(), "-x".into()];
        for option in &self.options {
            argv.push("-o".into());
            argv.push(option.into());
        }
        if self.port != 22 {
            argv.push("-p".into());
            argv.push(self.port.to_string().into());
        }
        if let Some(user) = &self.user {
            argv.push("-l".into());
            argv.push(user.into());
        }
        if let Some(identity) = &self.identity {
            argv.push("-i".into());
            argv.push(identity.into());
        }
        argv.push("-s".into());
        argv.push(self.host.clone().into());
        argv.push(self.subsystem.clone().into());
        argv
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.argv());
        cmd
    }
}

/// A running helper. The pipe must be dropped (closing both ends) before
/// [`HelperProcess::reap`] so the helper sees EOF and can exit on its own.
pub struct HelperProcess {
    child: Child,
}

impl HelperProcess {
    /// Spawns the helper described by `config`.
    pub fn spawn(config: &SshConfig) -> crate::Result<(Self, ChildPipe)> {
        let mut cmd = config.command();
        Self::spawn_command(&mut cmd)
    }

    /// Spawns an arbitrary command as the helper. The session tests use
    /// this with `cat` to get a loopback peer.
    pub fn spawn_command(cmd: &mut Command) -> crate::Result<(Self, ChildPipe)> {
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("helper stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("helper stdout not piped"))?;
        let pipe = ChildPipe::new(
            File::from(OwnedFd::from(stdout)),
            File::from(OwnedFd::from(stdin)),
        );
        Ok((HelperProcess { child }, pipe))
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Waits for the helper to exit, force-killing it when it overstays
    /// `transfer_timeout x 5` tenths of a second.
    pub fn reap(mut self, transfer_timeout: Duration) -> crate::Result<ExitStatus> {
        let grace = transfer_timeout.mul_f32(0.5);
        let start = Instant::now();
        loop {
            if let Some(status) = self.child.try_wait().map_err(TransportError::Io)? {
                return Ok(status);
            }
            if start.elapsed() >= grace {
                log::warn!(
                    "helper process {} still running after {:?}, killing it",
                    self.child.id(),
                    grace
                );
                if let Err(e) = self.child.kill() {
                    log::warn!("kill of helper {} failed: {e}", self.child.id());
                }
                return Ok(self.child.wait().map_err(TransportError::Io)?);
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Wire;

    #[test]
    fn cat_helper_echoes_frames() {
        let (helper, mut pipe) = HelperProcess::spawn_command(&mut Command::new("cat")).unwrap();
        pipe.write_all(b"\x00\x00\x00\x01\x01", Duration::from_secs(5))
            .unwrap();
        let mut buf = [0u8; 5];
        pipe.read_exact(&mut buf, Duration::from_secs(5)).unwrap();
        assert_eq!(&buf, b"\x00\x00\x00\x01\x01");
        drop(pipe);
        let status = helper.reap(Duration::from_secs(5)).unwrap();
        assert!(status.success());
    }

    #[test]
    fn reap_kills_a_stuck_helper() {
        let (helper, pipe) =
            HelperProcess::spawn_command(Command::new("sleep").arg("30")).unwrap();
        drop(pipe);
        let start = Instant::now();
        let status = helper.reap(Duration::from_millis(400)).unwrap();
        assert!(!status.success());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn ssh_argv_shape() {
        let mut config = SshConfig::new("ingest.example.net");
        config.port = 2222;
        config.user = Some("wmo".into());
        let argv = config.argv();
        let strings: Vec<String> = argv
            .iter()
            .map(|s| s.to_string_lossy().into_owned())
            .collect();
        assert!(strings.contains(&"-oBatchMode=yes".to_string()));
        assert!(strings.windows(2).any(|w| w[0] == "-p" && w[1] == "2222"));
        assert!(strings.windows(2).any(|w| w[0] == "-l" && w[1] == "wmo"));
        let tail: Vec<_> = strings.iter().rev().take(3).rev().collect();
        assert_eq!(tail, ["-s", "ingest.example.net", "sftp"]);
    }
}
