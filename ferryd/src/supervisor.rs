//! The supervisor: startup, main loop, restart policy enforcement and
//! orderly shutdown.

use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use time::OffsetDateTime;

use ferry_store::{ActiveFile, HostTable, RoleStatus, StatusBlock, HOST_JOB_SLOTS};

use crate::config::DaemonConfig;
use crate::dirs::WorkDir;
use crate::fifo::{
    send_command, Command, CommandChannel, DISPATCHER_FIFO, MASK_AGENT_FIFO, SUPERVISOR_FIFO,
    WORKER_FIFO,
};
use crate::process::{
    rescue_core_file, restart_decision, ProcessRole, ProcessTable, RestartDecision, ALL_ROLES,
};
use crate::{now_epoch, Result};

/// Roles started in the first stage, before the mask agent.
const LOG_STAGE: [ProcessRole; 15] = [
    ProcessRole::SystemLog,
    ProcessRole::EventLog,
    ProcessRole::ReceiveLog,
    ProcessRole::TransferLog,
    ProcessRole::TransferDebugLog,
    ProcessRole::InputLog,
    ProcessRole::OutputLog,
    ProcessRole::ConfirmLog,
    ProcessRole::DeleteLog,
    ProcessRole::ProductionLog,
    ProcessRole::DistributionLog,
    ProcessRole::RateLog,
    ProcessRole::ArchiveWatch,
    ProcessRole::Statistics,
    ProcessRole::Aggregator,
];

/// Optional daemons; a missing binary marks them Neither instead of
/// failing startup.
const OPTIONAL_ROLES: [ProcessRole; 2] = [ProcessRole::InfoDaemon, ProcessRole::WorkerHelper];

/// What the spool link-count watermarks ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrakeAction {
    StopMaskAgent,
    StartMaskAgent,
}

/// The queue-overflow brake decision, kept pure for testing.
pub fn brake_decision(links: u64, mask_running: bool, config: &DaemonConfig) -> Option<BrakeAction> {
    let stop_at = config
        .link_max
        .saturating_sub(config.stop_amg_threshold)
        .saturating_sub(config.dirs_in_file_dir);
    let start_at = config.link_max.saturating_sub(config.start_amg_threshold);
    if mask_running && links > stop_at {
        Some(BrakeAction::StopMaskAgent)
    } else if !mask_running && links < start_at {
        Some(BrakeAction::StartMaskAgent)
    } else {
        None
    }
}

pub struct Supervisor {
    work: WorkDir,
    config: DaemonConfig,
    active: ActiveFile,
    status: StatusBlock,
    hosts: HostTable,
    table: ProcessTable,
    cmd: CommandChannel,
    shutdown_flag: Arc<AtomicBool>,
    stop_requested: bool,
    mask_stopped_by_brake: bool,
    saved_cores: u32,
    last_dir_check: Instant,
    current_day: (i32, u16),
    current_month: (i32, u8),
    disabled_sources: HashSet<String>,
}

impl Supervisor {
    /// Runs the deterministic startup sequence of the engine.
    pub fn start(
        work: WorkDir,
        config: DaemonConfig,
        shutdown_flag: Arc<AtomicBool>,
    ) -> Result<Self> {
        // 1. Directory tree, each missing piece created with the
        //    configured mode.
        work.verify(config.dir_mode)?;

        // 2. Single-instance gate: the active file refuses to be taken
        //    over while its heartbeat still advances.
        let mut active = ActiveFile::create(&work.fifo_dir(), config.takeover_wait)?;
        active.set_pid(0, std::process::id() as i32);

        // 3. Versioned status record; a layout change starts fresh.
        let (mut status, fresh) = StatusBlock::attach(&work.fifo_dir())?;
        if fresh {
            log::info!("created fresh status record {}", StatusBlock::file_name());
        }
        status.set_start_time(now_epoch());
        status.set_uid(nix::unistd::getuid().as_raw());
        match nix::unistd::gethostname() {
            Ok(name) => status.set_hostname(&name.to_string_lossy()),
            Err(e) => log::warn!("cannot determine hostname: {e}"),
        }

        // 4. Host status array.
        let hosts = HostTable::attach(&work.host_status_path())?;

        // 5. Process table: every role present exactly once, stopped.
        let table = ProcessTable::new(work.root(), config.bin_dir.clone());
        for role in ALL_ROLES {
            status.set_role_status(role.index(), RoleStatus::Off);
        }

        // 6. Command channel.
        let cmd = CommandChannel::open(&work.fifo_dir().join(SUPERVISOR_FIFO))?;

        let now = OffsetDateTime::now_utc();
        let mut supervisor = Supervisor {
            work,
            config,
            active,
            status,
            hosts,
            table,
            cmd,
            shutdown_flag,
            stop_requested: false,
            mask_stopped_by_brake: false,
            saved_cores: 0,
            last_dir_check: Instant::now(),
            current_day: (now.year(), now.ordinal()),
            current_month: (now.year(), now.month() as u8),
            disabled_sources: HashSet::new(),
        };

        // 7. Staged spawning: logs, mask agent, optional daemons, then
        //    the dispatcher.
        for role in LOG_STAGE {
            supervisor.spawn_role(role);
        }
        supervisor.spawn_role(ProcessRole::MaskAgent);
        for role in OPTIONAL_ROLES {
            supervisor.spawn_role(role);
        }
        supervisor.spawn_role(ProcessRole::Dispatcher);

        supervisor.disabled_sources_check();
        Ok(supervisor)
    }

    fn spawn_role(&mut self, role: ProcessRole) {
        match self.table.spawn(role) {
            Ok(pid) => {
                self.status.set_role_status(role.index(), RoleStatus::On);
                self.active.set_pid(role.index() + 1, pid as i32);
                self.status.count_fork();
            }
            Err(e) => {
                let optional = OPTIONAL_ROLES.contains(&role);
                if optional {
                    log::info!("{role} not available ({e}); marking unmanaged");
                    self.status
                        .set_role_status(role.index(), RoleStatus::Neither);
                } else {
                    log::warn!("cannot start {role}: {e}");
                    self.status.set_role_status(role.index(), RoleStatus::Off);
                }
                self.active.set_pid(role.index() + 1, 0);
            }
        }
    }

    /// The cooperative main loop. Returns the process exit code.
    pub fn run(mut self) -> i32 {
        loop {
            if let Err(e) = self.iterate() {
                log::error!("supervisor loop error: {e}");
            }
            if self.should_stop() {
                break;
            }
        }
        self.shutdown();
        0
    }

    fn should_stop(&self) -> bool {
        self.stop_requested
            || self.shutdown_flag.load(Ordering::Relaxed)
            || self.active.shutdown_requested()
    }

    /// One loop turn: heartbeat, periodic checks, command handling.
    fn iterate(&mut self) -> Result<()> {
        self.active.tick();

        if self.last_dir_check.elapsed() >= self.config.dir_check_interval {
            self.last_dir_check = Instant::now();
            self.disabled_sources_check();
        }

        self.calendar_rollover();
        self.link_count_brake();
        self.zombie_check();
        self.stuck_transfer_check(now_epoch());

        let commands = self.cmd.wait(self.config.loop_interval)?;
        for command in commands {
            self.handle_command(command);
        }
        Ok(())
    }

    fn handle_command(&mut self, command: Command) {
        log::debug!("command: {command:?}");
        match command {
            Command::Shutdown | Command::Stop => self.stop_requested = true,
            Command::StopMaskAgent => self.stop_mask_agent(),
            Command::StartMaskAgent => {
                self.mask_stopped_by_brake = false;
                self.start_role_if_down(ProcessRole::MaskAgent);
            }
            Command::StopDispatcher => {
                self.status
                    .set_role_status(ProcessRole::Dispatcher.index(), RoleStatus::Shutdown);
                self.send_stop(ProcessRole::Dispatcher, DISPATCHER_FIFO);
            }
            Command::StartDispatcher => self.start_role_if_down(ProcessRole::Dispatcher),
            Command::MaskAgentReady => {
                self.status
                    .set_role_status(ProcessRole::MaskAgent.index(), RoleStatus::On);
            }
            Command::IsAlive => {
                // The advancing heartbeat is the answer.
            }
        }
    }

    fn start_role_if_down(&mut self, role: ProcessRole) {
        if !self.table.running(role) {
            self.spawn_role(role);
        }
    }

    fn stop_mask_agent(&mut self) {
        self.status
            .set_role_status(ProcessRole::MaskAgent.index(), RoleStatus::Shutdown);
        self.send_stop(ProcessRole::MaskAgent, MASK_AGENT_FIFO);
    }

    /// Asks a role to stop via its command channel, falling back to a
    /// terminate signal when the channel is gone.
    fn send_stop(&mut self, role: ProcessRole, fifo_name: &str) {
        let path = self.work.fifo_dir().join(fifo_name);
        if let Err(e) = send_command(&path, Command::Stop) {
            log::debug!("stop command to {role} failed ({e}); sending SIGTERM");
            self.table.signal(role, Signal::SIGTERM);
        }
    }

    /// Non-blocking reap of every role with the documented restart
    /// policy applied.
    fn zombie_check(&mut self) {
        for role in ALL_ROLES {
            let status = match self.table.reap(role) {
                Ok(Some(status)) => status,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("reaping {role} failed: {e}");
                    continue;
                }
            };
            self.active.set_pid(role.index() + 1, 0);
            match restart_decision(role, status) {
                RestartDecision::MarkStopped | RestartDecision::LeaveStopped => {
                    self.status
                        .set_role_status(role.index(), RoleStatus::Stopped);
                }
                RestartDecision::Restart => {
                    log::info!("{role} exited with {status}, restarting");
                    self.spawn_role(role);
                }
                RestartDecision::AbnormalRestart => {
                    log::warn!("{role} terminated abnormally ({status}), restarting");
                    if rescue_core_file(
                        self.work.root(),
                        self.saved_cores,
                        self.config.max_saved_cores,
                        now_epoch(),
                    )
                    .is_some()
                    {
                        self.saved_cores += 1;
                    }
                    self.status.set_role_status(role.index(), RoleStatus::Off);
                    self.spawn_role(role);
                }
                RestartDecision::AbnormalOff => {
                    log::warn!("{role} terminated abnormally ({status}), leaving it off");
                    self.status.set_role_status(role.index(), RoleStatus::Off);
                }
            }
        }
    }

    /// Interrupts transfer slots that show errors but no byte activity
    /// within the stuck window.
    fn stuck_transfer_check(&mut self, now: i64) {
        let window = self.config.stuck_window();
        for index in 0..self.hosts.count() {
            let entry = match self.hosts.get(index) {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("host {index}: {e}");
                    continue;
                }
            };
            if entry.active_transfers == 0
                || entry.error_counter == 0
                || entry.queue_stopped
                || now - entry.last_retry <= window
            {
                continue;
            }
            for slot in 0..HOST_JOB_SLOTS {
                let job = entry.slots[slot];
                if job.pid != 0 && now - job.last_activity > window {
                    log::warn!(
                        "host {}: transfer slot {slot} (pid {}) stuck, interrupting",
                        entry.alias,
                        job.pid
                    );
                    if let Err(e) = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(job.pid),
                        Signal::SIGINT,
                    ) {
                        log::debug!("interrupt of pid {} failed: {e}", job.pid);
                    }
                }
            }
        }
    }

    /// Watches the spool directory's hard-link count and stops or
    /// restarts the mask agent at the configured watermarks.
    fn link_count_brake(&mut self) {
        let links = match std::fs::metadata(self.work.files_dir()) {
            Ok(meta) => meta.nlink(),
            Err(e) => {
                log::warn!("cannot stat spool directory: {e}");
                return;
            }
        };
        self.status.note_queue_length(links as u32);
        let mask_running = self.table.running(ProcessRole::MaskAgent);
        match brake_decision(links, mask_running, &self.config) {
            Some(BrakeAction::StopMaskAgent) if !self.mask_stopped_by_brake => {
                log::warn!("spool link count {links} over the stop watermark, pausing the mask agent");
                self.status.count_burst();
                self.mask_stopped_by_brake = true;
                self.stop_mask_agent();
            }
            Some(BrakeAction::StartMaskAgent) if self.mask_stopped_by_brake => {
                log::info!("spool link count {links} back below the start watermark, resuming the mask agent");
                self.mask_stopped_by_brake = false;
                self.start_role_if_down(ProcessRole::MaskAgent);
            }
            _ => {}
        }
    }

    /// Daily counter logging/reset and the month banner.
    fn calendar_rollover(&mut self) {
        let now = OffsetDateTime::now_utc();
        let day = (now.year(), now.ordinal());
        if day != self.current_day {
            self.current_day = day;
            log::info!(
                "daily counters: forks {}, bursts {}, dir scans {}, max queue {}",
                self.status.fork_count(),
                self.status.burst_count(),
                self.status.dir_scan_count(),
                self.status.max_queue_length(),
            );
            self.status.reset_daily_counters();
        }
        let month = (now.year(), now.month() as u8);
        if month != self.current_month {
            self.current_month = month;
            log::info!("=====> {} {} <=====", now.month(), now.year());
        }
    }

    /// Re-reads the disabled-sources configuration and flips the
    /// per-host flag under the host-status lock, with an audit event per
    /// change.
    fn disabled_sources_check(&mut self) {
        let configured: HashSet<String> = std::fs::read_to_string(self.work.disabled_sources_path())
            .map(|text| {
                text.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if configured == self.disabled_sources {
            return;
        }
        for index in 0..self.hosts.count() {
            let entry = match self.hosts.get(index) {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let should_disable = configured.contains(&entry.alias);
            if should_disable != entry.dir_disabled {
                let locked = self.hosts.lock_status(index).is_ok();
                if let Err(e) = self.hosts.set_dir_disabled(index, should_disable) {
                    log::warn!("cannot flip disable flag of {}: {e}", entry.alias);
                } else if should_disable {
                    log::info!("source {} disabled by configuration", entry.alias);
                } else {
                    log::info!("source {} re-enabled by configuration", entry.alias);
                }
                if locked {
                    let _ = self.hosts.unlock_status(index);
                }
            }
        }
        self.disabled_sources = configured;
    }

    /// The orderly shutdown sequence.
    fn shutdown(mut self) {
        log::info!("shutting down");

        // Worker helper first.
        if self.table.running(ProcessRole::WorkerHelper) {
            self.status
                .set_role_status(ProcessRole::WorkerHelper.index(), RoleStatus::Shutdown);
            let path = self.work.fifo_dir().join(WORKER_FIFO);
            if let Err(e) = send_command(&path, Command::Shutdown) {
                log::debug!("worker helper shutdown command failed: {e}");
            }
            if !self
                .table
                .wait_for_exit(ProcessRole::WorkerHelper, self.config.shutdown_wait)
            {
                self.table.signal(ProcessRole::WorkerHelper, Signal::SIGTERM);
            }
        }

        // Then the mask agent and the dispatcher over their channels.
        for (role, fifo) in [
            (ProcessRole::MaskAgent, MASK_AGENT_FIFO),
            (ProcessRole::Dispatcher, DISPATCHER_FIFO),
        ] {
            if self.table.running(role) {
                self.status
                    .set_role_status(role.index(), RoleStatus::Shutdown);
                self.send_stop(role, fifo);
            }
        }
        for role in [ProcessRole::MaskAgent, ProcessRole::Dispatcher] {
            if !self.table.wait_for_exit(role, self.config.shutdown_wait) {
                self.table.signal(role, Signal::SIGTERM);
                self.table.wait_for_exit(role, self.config.shutdown_wait);
            }
            self.status
                .set_role_status(role.index(), RoleStatus::Stopped);
        }

        // External down marker, then persist the counters.
        self.status.clear_hostname();
        if let Err(e) = self.status.flush() {
            log::warn!("cannot persist status record: {e}");
        }

        // Everything else, system log excepted, may go now.
        let remaining: Vec<ProcessRole> = self
            .table
            .roles_running()
            .filter(|&r| r != ProcessRole::SystemLog)
            .collect();
        for role in remaining {
            self.table.signal(role, Signal::SIGTERM);
            self.table.wait_for_exit(role, self.config.shutdown_wait);
            self.status
                .set_role_status(role.index(), RoleStatus::Stopped);
        }

        // Unmap and drop the beacon.
        if let Err(e) = self.active.unlink() {
            log::warn!("cannot remove active file: {e}");
        }

        // Give the system log a moment to drain, then end it last.
        if self.table.running(ProcessRole::SystemLog) {
            std::thread::sleep(Duration::from_millis(300));
            self.table.signal(ProcessRole::SystemLog, Signal::SIGTERM);
            self.table
                .wait_for_exit(ProcessRole::SystemLog, self.config.shutdown_wait);
        }
        log::info!("shutdown complete");
    }

    // Accessors used by the loop tests.

    #[cfg(test)]
    fn role_status(&self, role: ProcessRole) -> RoleStatus {
        self.status.role_status(role.index())
    }

    #[cfg(test)]
    fn pid_slot(&self, role: ProcessRole) -> i32 {
        self.active.pid(role.index() + 1)
    }
}
