//! `ferry-status` - sibling view of a running engine, plus the command
//! sender external tooling uses.
//!
//! This process never creates shared state: it maps what the supervisor
//! left behind, tells "alive" from "stale" by watching the heartbeat,
//! and writes single-byte commands into the supervisor's channel.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use ferry_store::active::{heartbeat_advances, ACTIVE_FILE_NAME};
use ferry_store::{ActiveFile, StatusBlock};
use ferryd::config::WORK_DIR_ENV;
use ferryd::fifo::{send_command, Command, SUPERVISOR_FIFO};
use ferryd::process::ALL_ROLES;
use ferryd::WorkDir;

#[derive(Parser)]
#[command(version, about = "Inspect or control a running ferryd")]
struct Cli {
    /// Work directory root; defaults to $FERRY_WORK_DIR.
    #[arg(short = 'w', value_name = "DIR")]
    work_dir: Option<PathBuf>,

    /// Exit 0 when the supervisor's heartbeat advances, 1 otherwise.
    #[arg(long)]
    is_alive: bool,

    /// Ask the supervisor to shut down.
    #[arg(long)]
    stop: bool,

    #[arg(long)]
    stop_mask_agent: bool,

    #[arg(long)]
    start_mask_agent: bool,

    #[arg(long)]
    stop_dispatcher: bool,

    #[arg(long)]
    start_dispatcher: bool,

    /// Seconds to watch the heartbeat for --is-alive.
    #[arg(long, default_value_t = 3)]
    wait: u64,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let work_root = cli
        .work_dir
        .clone()
        .or_else(|| std::env::var_os(WORK_DIR_ENV).map(PathBuf::from));
    let Some(work_root) = work_root else {
        eprintln!("no work directory: pass -w <dir> or set {WORK_DIR_ENV}");
        std::process::exit(1);
    };
    let work = WorkDir::new(work_root);
    let fifo_dir = work.fifo_dir();

    if cli.is_alive {
        let path = fifo_dir.join(ACTIVE_FILE_NAME);
        if path.exists() && heartbeat_advances(&path, Duration::from_secs(cli.wait)) {
            println!("alive");
            std::process::exit(0);
        }
        println!("stale");
        std::process::exit(1);
    }

    let command = [
        (cli.stop, Command::Shutdown),
        (cli.stop_mask_agent, Command::StopMaskAgent),
        (cli.start_mask_agent, Command::StartMaskAgent),
        (cli.stop_dispatcher, Command::StopDispatcher),
        (cli.start_dispatcher, Command::StartDispatcher),
    ]
    .into_iter()
    .find(|(flag, _)| *flag)
    .map(|(_, cmd)| cmd);

    if let Some(command) = command {
        if let Err(e) = send_command(&fifo_dir.join(SUPERVISOR_FIFO), command) {
            eprintln!("cannot send command: {e}");
            std::process::exit(1);
        }
        std::process::exit(0);
    }

    // Plain status dump.
    let status = match StatusBlock::attach_existing(&fifo_dir) {
        Ok(status) => status,
        Err(e) => {
            eprintln!("no engine state under {}: {e}", work.root().display());
            std::process::exit(1);
        }
    };
    let active = ActiveFile::open(&fifo_dir).ok();

    let hostname = status.hostname();
    if hostname.is_empty() {
        println!("system      : down (no hostname set)");
    } else {
        println!("system      : up on {hostname}");
    }
    println!("started     : {} (epoch)", status.start_time());
    println!("user id     : {}", status.uid());
    if let Some(active) = &active {
        println!("supervisor  : pid {}, heartbeat {}", active.pid(0), active.heartbeat());
    } else {
        println!("supervisor  : no active file");
    }
    println!(
        "counters    : forks {}, bursts {}, dir scans {}, max queue {}",
        status.fork_count(),
        status.burst_count(),
        status.dir_scan_count(),
        status.max_queue_length(),
    );
    println!("roles:");
    for role in ALL_ROLES {
        let pid = active.as_ref().map(|a| a.pid(role.index() + 1)).unwrap_or(0);
        println!(
            "  {:<22} {:?} (pid {})",
            role.binary_name(),
            status.role_status(role.index()),
            pid
        );
    }
}
