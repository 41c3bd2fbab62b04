//! Daemon tunables and the exit-code contract between supervisor and
//! workers.

use std::path::PathBuf;
use std::time::Duration;

// Exit codes the restart policy understands.
pub const EXIT_SUCCESS: i32 = 0;
/// Stopped on operator request; stay down.
pub const EXIT_USER_STOP: i32 = 1;
/// Signal-equivalent termination reported as an exit code.
pub const EXIT_RESTART_SIGNAL: i32 = 2;
/// The shared mappings vanished underneath the process.
pub const EXIT_SHARED_AREA_GONE: i32 = 3;
/// The process asks to be respawned with fresh state.
pub const EXIT_PLEASE_RESTART: i32 = 7;

// Worker failure codes, one per failure stage. These travel from a
// worker to the supervisor's restart policy; the supervisor's own
// process exit status is plain 0/1.
pub const EXIT_CONNECT_ERROR: i32 = 10;
pub const EXIT_LIST_ERROR: i32 = 11;
pub const EXIT_TRANSFER_ERROR: i32 = 12;
pub const EXIT_STORE_ERROR: i32 = 13;

/// Environment variable naming the work directory root.
pub const WORK_DIR_ENV: &str = "FERRY_WORK_DIR";

/// Supervisor tunables. Defaults match a production spool; tests shrink
/// the timing values.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Command-channel wait per loop turn; also the heartbeat period.
    pub loop_interval: Duration,
    /// How long a starting instance watches an existing heartbeat before
    /// concluding the active file is stale.
    pub takeover_wait: Duration,
    /// Re-read interval of the disabled-sources configuration.
    pub dir_check_interval: Duration,
    /// Default per-operation transfer deadline.
    pub transfer_timeout: Duration,
    /// Pause between retries of a failing host.
    pub retry_interval: Duration,
    /// Slack added on top of retry interval + transfer timeout before a
    /// transfer counts as stuck.
    pub stuck_grace: Duration,
    /// How long shutdown waits for a child to honor its stop command
    /// before escalating to a signal.
    pub shutdown_wait: Duration,
    /// Hard-link ceiling of the spool filesystem.
    pub link_max: u64,
    /// Stop the mask agent when spool links exceed
    /// `link_max - stop_amg_threshold - dirs_in_file_dir`.
    pub stop_amg_threshold: u64,
    /// Restart it when links fall below `link_max - start_amg_threshold`.
    pub start_amg_threshold: u64,
    /// Directories that always live under `files/`.
    pub dirs_in_file_dir: u64,
    /// Cap on core files rescued with a timestamped suffix.
    pub max_saved_cores: u32,
    /// Mode for directories the startup check creates.
    pub dir_mode: u32,
    /// Where the worker binaries live; `None` trusts `PATH`.
    pub bin_dir: Option<PathBuf>,
    pub daemonize: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            loop_interval: Duration::from_secs(1),
            takeover_wait: Duration::from_secs(5),
            dir_check_interval: Duration::from_secs(60),
            transfer_timeout: Duration::from_secs(120),
            retry_interval: Duration::from_secs(120),
            stuck_grace: Duration::from_secs(60),
            shutdown_wait: Duration::from_secs(5),
            link_max: 32_000,
            stop_amg_threshold: 100,
            start_amg_threshold: 300,
            dirs_in_file_dir: 4,
            max_saved_cores: 10,
            dir_mode: 0o755,
            bin_dir: None,
            daemonize: true,
        }
    }
}

impl DaemonConfig {
    /// Window after which an active, erroring transfer counts as stuck.
    pub fn stuck_window(&self) -> i64 {
        (self.retry_interval + self.transfer_timeout + self.stuck_grace).as_secs() as i64
    }
}
