//! The supervised process table and its restart policy.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::config::{
    EXIT_PLEASE_RESTART, EXIT_RESTART_SIGNAL, EXIT_SHARED_AREA_GONE, EXIT_SUCCESS, EXIT_USER_STOP,
};

/// The closed set of supervised roles. One entry per role, fixed at
/// build time; the index doubles as the status-byte slot in the shared
/// status block and the pid slot in the active file (offset by one, the
/// supervisor itself holds slot 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    MaskAgent,
    Dispatcher,
    SystemLog,
    EventLog,
    ReceiveLog,
    TransferLog,
    TransferDebugLog,
    ArchiveWatch,
    Statistics,
    InfoDaemon,
    InputLog,
    OutputLog,
    ConfirmLog,
    DeleteLog,
    ProductionLog,
    DistributionLog,
    RateLog,
    WorkerHelper,
    Aggregator,
}

pub const ALL_ROLES: [ProcessRole; 19] = [
    ProcessRole::MaskAgent,
    ProcessRole::Dispatcher,
    ProcessRole::SystemLog,
    ProcessRole::EventLog,
    ProcessRole::ReceiveLog,
    ProcessRole::TransferLog,
    ProcessRole::TransferDebugLog,
    ProcessRole::ArchiveWatch,
    ProcessRole::Statistics,
    ProcessRole::InfoDaemon,
    ProcessRole::InputLog,
    ProcessRole::OutputLog,
    ProcessRole::ConfirmLog,
    ProcessRole::DeleteLog,
    ProcessRole::ProductionLog,
    ProcessRole::DistributionLog,
    ProcessRole::RateLog,
    ProcessRole::WorkerHelper,
    ProcessRole::Aggregator,
];

impl ProcessRole {
    pub fn index(self) -> usize {
        ALL_ROLES
            .iter()
            .position(|&r| r == self)
            .unwrap_or_default()
    }

    /// Executable name of the role's binary.
    pub fn binary_name(self) -> &'static str {
        match self {
            ProcessRole::MaskAgent => "ferry-maskd",
            ProcessRole::Dispatcher => "ferry-dispatch",
            ProcessRole::SystemLog => "ferry-syslog",
            ProcessRole::EventLog => "ferry-eventlog",
            ProcessRole::ReceiveLog => "ferry-receivelog",
            ProcessRole::TransferLog => "ferry-translog",
            ProcessRole::TransferDebugLog => "ferry-transdebuglog",
            ProcessRole::ArchiveWatch => "ferry-archwatch",
            ProcessRole::Statistics => "ferry-statd",
            ProcessRole::InfoDaemon => "ferry-infod",
            ProcessRole::InputLog => "ferry-inputlog",
            ProcessRole::OutputLog => "ferry-outputlog",
            ProcessRole::ConfirmLog => "ferry-confirmlog",
            ProcessRole::DeleteLog => "ferry-deletelog",
            ProcessRole::ProductionLog => "ferry-prodlog",
            ProcessRole::DistributionLog => "ferry-distlog",
            ProcessRole::RateLog => "ferry-ratelog",
            ProcessRole::WorkerHelper => "ferry-workerd",
            ProcessRole::Aggregator => "ferry-logcollect",
        }
    }

    /// Roles the supervisor restarts even after an abnormal exit.
    pub fn protected(self) -> bool {
        !matches!(self, ProcessRole::MaskAgent)
    }
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.binary_name())
    }
}

/// What `zombie_check` does with a reaped child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Clean exit; mark stopped.
    MarkStopped,
    /// Operator stop; leave it down.
    LeaveStopped,
    /// The documented restart codes.
    Restart,
    /// Abnormal, but the role is protected: log, rescue a core, respawn.
    AbnormalRestart,
    /// Abnormal and unprotected: mark off and leave it down.
    AbnormalOff,
}

/// Maps an exit status to the restart policy.
pub fn restart_decision(role: ProcessRole, status: ExitStatus) -> RestartDecision {
    match status.code() {
        Some(EXIT_SUCCESS) => RestartDecision::MarkStopped,
        Some(EXIT_USER_STOP) => RestartDecision::LeaveStopped,
        Some(EXIT_RESTART_SIGNAL) | Some(EXIT_SHARED_AREA_GONE) | Some(EXIT_PLEASE_RESTART) => {
            RestartDecision::Restart
        }
        // Unknown codes and signal deaths.
        _ => {
            if role.protected() {
                RestartDecision::AbnormalRestart
            } else {
                RestartDecision::AbnormalOff
            }
        }
    }
}

/// One supervised child.
pub struct ProcessEntry {
    pub role: ProcessRole,
    pub child: Option<Child>,
}

/// The fixed process table.
pub struct ProcessTable {
    entries: Vec<ProcessEntry>,
    work_dir: PathBuf,
    bin_dir: Option<PathBuf>,
}

impl ProcessTable {
    pub fn new(work_dir: &Path, bin_dir: Option<PathBuf>) -> Self {
        ProcessTable {
            entries: ALL_ROLES
                .iter()
                .map(|&role| ProcessEntry { role, child: None })
                .collect(),
            work_dir: work_dir.to_path_buf(),
            bin_dir,
        }
    }

    fn slot(&mut self, role: ProcessRole) -> &mut ProcessEntry {
        &mut self.entries[role.index()]
    }

    pub fn pid(&self, role: ProcessRole) -> u32 {
        self.entries[role.index()]
            .child
            .as_ref()
            .map(|c| c.id())
            .unwrap_or(0)
    }

    pub fn running(&self, role: ProcessRole) -> bool {
        self.entries[role.index()].child.is_some()
    }

    /// Spawns the role's binary with the work directory argument.
    pub fn spawn(&mut self, role: ProcessRole) -> std::io::Result<u32> {
        let program = match &self.bin_dir {
            Some(dir) => dir.join(role.binary_name()),
            None => PathBuf::from(role.binary_name()),
        };
        let child = Command::new(&program)
            .arg("-w")
            .arg(&self.work_dir)
            .stdin(Stdio::null())
            .spawn()?;
        let pid = child.id();
        log::info!("started {role} (pid {pid})");
        self.slot(role).child = Some(child);
        Ok(pid)
    }

    /// Non-blocking reap of one role. `Some(status)` when it exited; the
    /// child slot is cleared in that case.
    pub fn reap(&mut self, role: ProcessRole) -> std::io::Result<Option<ExitStatus>> {
        let entry = self.slot(role);
        let Some(child) = entry.child.as_mut() else {
            return Ok(None);
        };
        match child.try_wait()? {
            Some(status) => {
                entry.child = None;
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    /// Sends `sig` to the role's process group leader.
    pub fn signal(&self, role: ProcessRole, sig: Signal) {
        let pid = self.pid(role);
        if pid == 0 {
            return;
        }
        if let Err(e) = kill(Pid::from_raw(pid as i32), sig) {
            log::debug!("signal {sig} to {role} (pid {pid}) failed: {e}");
        }
    }

    /// Blocks until the role exits or `deadline` passes; returns whether
    /// it is gone.
    pub fn wait_for_exit(&mut self, role: ProcessRole, deadline: std::time::Duration) -> bool {
        let start = std::time::Instant::now();
        loop {
            match self.reap(role) {
                Ok(Some(_)) => return true,
                Ok(None) if !self.running(role) => return true,
                Ok(None) => {}
                Err(_) => return true,
            }
            if start.elapsed() >= deadline {
                return false;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
    }

    pub fn roles_running(&self) -> impl Iterator<Item = ProcessRole> + '_ {
        self.entries
            .iter()
            .filter(|e| e.child.is_some())
            .map(|e| e.role)
    }
}

/// Rescues a core file left in the work directory by renaming it with a
/// timestamp suffix, up to the configured cap.
pub fn rescue_core_file(work_dir: &Path, saved_so_far: u32, cap: u32, now: i64) -> Option<PathBuf> {
    if saved_so_far >= cap {
        return None;
    }
    let core = work_dir.join("core");
    if !core.is_file() {
        return None;
    }
    let target = work_dir.join(format!("core.{now}"));
    match std::fs::rename(&core, &target) {
        Ok(()) => {
            log::warn!("saved core file as {}", target.display());
            Some(target)
        }
        Err(e) => {
            log::warn!("cannot save core file: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::process::ExitStatusExt;

    fn status(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    fn signalled(sig: i32) -> ExitStatus {
        ExitStatus::from_raw(sig)
    }

    #[test]
    fn role_indices_are_stable_and_dense() {
        for (i, role) in ALL_ROLES.iter().enumerate() {
            assert_eq!(role.index(), i);
        }
        assert_eq!(ALL_ROLES.len(), ferry_store::status::ROLE_SLOTS);
    }

    #[test]
    fn restart_policy_mapping() {
        use RestartDecision::*;
        let dispatcher = ProcessRole::Dispatcher;
        assert_eq!(restart_decision(dispatcher, status(0)), MarkStopped);
        assert_eq!(restart_decision(dispatcher, status(1)), LeaveStopped);
        assert_eq!(restart_decision(dispatcher, status(2)), Restart);
        assert_eq!(restart_decision(dispatcher, status(3)), Restart);
        assert_eq!(restart_decision(dispatcher, status(7)), Restart);
        assert_eq!(restart_decision(dispatcher, status(42)), AbnormalRestart);
        assert_eq!(restart_decision(dispatcher, signalled(9)), AbnormalRestart);
        // The mask agent is not in the protected set.
        assert_eq!(
            restart_decision(ProcessRole::MaskAgent, signalled(11)),
            AbnormalOff
        );
        assert_eq!(restart_decision(ProcessRole::MaskAgent, status(2)), Restart);
    }

    fn stub_binary(dir: &Path, name: &str, script: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn spawn_reap_cycle_with_stub_binaries() {
        let bin = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        stub_binary(bin.path(), "ferry-syslog", "exit 0");
        stub_binary(bin.path(), "ferry-dispatch", "sleep 30");

        let mut table = ProcessTable::new(work.path(), Some(bin.path().to_path_buf()));
        let pid = table.spawn(ProcessRole::SystemLog).unwrap();
        assert!(pid > 0);
        assert!(table.wait_for_exit(ProcessRole::SystemLog, std::time::Duration::from_secs(5)));
        assert!(!table.running(ProcessRole::SystemLog));

        table.spawn(ProcessRole::Dispatcher).unwrap();
        assert!(table.running(ProcessRole::Dispatcher));
        assert_eq!(table.reap(ProcessRole::Dispatcher).unwrap(), None);
        table.signal(ProcessRole::Dispatcher, Signal::SIGKILL);
        assert!(table.wait_for_exit(ProcessRole::Dispatcher, std::time::Duration::from_secs(5)));
    }

    #[test]
    fn missing_binary_is_an_error() {
        let work = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        let mut table = ProcessTable::new(work.path(), Some(bin.path().to_path_buf()));
        assert!(table.spawn(ProcessRole::Statistics).is_err());
        assert_eq!(table.pid(ProcessRole::Statistics), 0);
    }

    #[test]
    fn core_files_are_rescued_up_to_the_cap() {
        let work = tempfile::tempdir().unwrap();
        std::fs::write(work.path().join("core"), b"dump").unwrap();
        let saved = rescue_core_file(work.path(), 0, 10, 1_700_000_000).unwrap();
        assert!(saved.ends_with("core.1700000000"));
        assert!(!work.path().join("core").exists());

        // Cap reached: the next core stays where it is.
        std::fs::write(work.path().join("core"), b"dump").unwrap();
        assert!(rescue_core_file(work.path(), 10, 10, 1_700_000_001).is_none());
        assert!(work.path().join("core").exists());
    }
}
