//! `ferryd` - the supervisor binary.

use std::ffi::OsString;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use ferryd::config::{DaemonConfig, WORK_DIR_ENV};
use ferryd::supervisor::Supervisor;
use ferryd::WorkDir;

#[derive(Parser)]
#[command(version, about = "Automatic file distribution daemon")]
struct Cli {
    /// Work directory root; defaults to $FERRY_WORK_DIR.
    #[arg(short = 'w', value_name = "DIR")]
    work_dir: Option<PathBuf>,

    /// Stay in the foreground instead of daemonizing.
    #[arg(long = "nd")]
    no_daemon: bool,
}

/// External tooling invokes the no-daemonize switch as the single-dash
/// `-nd`, which clap's short/long split cannot express. Rewrite that one
/// token to the long spelling before parsing; everything else passes
/// through untouched.
fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| {
            if arg == "-nd" {
                OsString::from("--nd")
            } else {
                arg
            }
        })
        .collect()
}

/// Classic double fork + setsid, stdio pointed at /dev/null.
fn daemonize() -> std::io::Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};
    match unsafe { fork() }.map_err(std::io::Error::other)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid().map_err(std::io::Error::other)?;
    match unsafe { fork() }.map_err(std::io::Error::other)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for fd in 0..=2 {
        if unsafe { libc::dup2(devnull.as_raw_fd(), fd) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse_from(normalize_args(std::env::args_os()));

    let work_root = cli
        .work_dir
        .or_else(|| std::env::var_os(WORK_DIR_ENV).map(PathBuf::from));
    let Some(work_root) = work_root else {
        eprintln!("no work directory: pass -w <dir> or set {WORK_DIR_ENV}");
        std::process::exit(1);
    };

    let config = DaemonConfig {
        daemonize: !cli.no_daemon,
        ..Default::default()
    };
    if config.daemonize {
        if let Err(e) = daemonize() {
            eprintln!("cannot daemonize: {e}");
            std::process::exit(1);
        }
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || shutdown.store(true, Ordering::Relaxed)) {
            log::warn!("cannot install the interrupt handler: {e}");
        }
    }

    match Supervisor::start(WorkDir::new(work_root), config, shutdown) {
        Ok(supervisor) => std::process::exit(supervisor.run()),
        Err(e) => {
            // The error names the failing startup step; the process exit
            // status stays within the 0/1 contract external tooling sees.
            log::error!("startup failed: {e}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn single_dash_nd_is_accepted() {
        let parsed = Cli::parse_from(normalize_args(args(&["ferryd", "-nd", "-w", "/tmp/w"])));
        assert!(parsed.no_daemon);
        assert_eq!(parsed.work_dir.as_deref(), Some(std::path::Path::new("/tmp/w")));
    }

    #[test]
    fn long_spelling_still_works() {
        let parsed = Cli::parse_from(normalize_args(args(&["ferryd", "--nd"])));
        assert!(parsed.no_daemon);
        let parsed = Cli::parse_from(normalize_args(args(&["ferryd"])));
        assert!(!parsed.no_daemon);
    }

    #[test]
    fn only_the_exact_token_is_rewritten() {
        let normalized = normalize_args(args(&["ferryd", "-w", "-nd-ish"]));
        assert_eq!(normalized[2], OsString::from("-nd-ish"));
        let normalized = normalize_args(args(&["ferryd", "-nd"]));
        assert_eq!(normalized[1], OsString::from("--nd"));
    }
}
