//! `ferry-fetch` - one retrieval cycle against one remote source.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use ferry_scan::{DiffPolicy, MaskList};
use ferry_transport::SshConfig;
use ferryd::config::WORK_DIR_ENV;
use ferryd::fetch::{self, parse_ignore_rule, FetchJob};
use ferryd::WorkDir;

#[derive(Parser)]
#[command(version, about = "Fetch files from one remote source")]
struct Cli {
    /// Work directory root; defaults to $FERRY_WORK_DIR.
    #[arg(short = 'w', value_name = "DIR")]
    work_dir: Option<PathBuf>,

    /// Source alias (keys the retrieve list and the incoming dir).
    #[arg(long)]
    source: String,

    /// Remote host to fetch from.
    #[arg(long)]
    host: String,

    /// Alias in the shared host table; defaults to the host name.
    #[arg(long)]
    host_alias: Option<String>,

    #[arg(long, default_value_t = 22)]
    port: u16,

    #[arg(long)]
    user: Option<String>,

    /// Identity file handed to the remote-shell helper.
    #[arg(long)]
    identity: Option<PathBuf>,

    #[arg(long, default_value = ".")]
    remote_dir: String,

    /// File mask; repeatable, `!` prefix excludes. Defaults to `*`.
    #[arg(long = "mask")]
    masks: Vec<String>,

    /// Forget the retrieve list between cycles.
    #[arg(long)]
    transient: bool,

    /// Fetch only the grown tail of files that got bigger.
    #[arg(long)]
    append: bool,

    /// Delete remote files no mask accepts, once old enough.
    #[arg(long)]
    delete_unknown: bool,

    /// Delete stale remote dot-files.
    #[arg(long)]
    delete_locked: bool,

    /// Delete each file from the remote after a successful fetch.
    #[arg(long)]
    delete_after_fetch: bool,

    /// Create the remote directory when it is missing.
    #[arg(long)]
    create_dir: bool,

    /// Mode for created remote directories, octal.
    #[arg(long, default_value = "755")]
    dir_mode: String,

    /// Per-cycle file cap.
    #[arg(long, default_value_t = 100)]
    max_files: usize,

    /// Per-cycle byte cap.
    #[arg(long, default_value_t = 1 << 30)]
    max_bytes: u64,

    /// Ignore files by size, e.g. `=0` or `>10485760`.
    #[arg(long)]
    ignore_size: Option<String>,

    /// Ignore files by age in seconds, e.g. `>86400`.
    #[arg(long)]
    ignore_age: Option<String>,

    /// Transfer timeout in seconds.
    #[arg(long, default_value_t = 120)]
    timeout: u64,

    /// Keep the connection open and keep cycling for this many seconds.
    #[arg(long)]
    keep_connected: Option<u64>,

    #[arg(long, default_value_t = 16384)]
    block_size: u32,

    /// Worker number recorded in assigned rows.
    #[arg(long, default_value_t = 0)]
    worker_id: u8,

    /// Job slot occupied in the host table.
    #[arg(long, default_value_t = 0)]
    slot: usize,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
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

    let mask_patterns = if cli.masks.is_empty() {
        vec!["*".to_string()]
    } else {
        cli.masks.clone()
    };
    let masks = match MaskList::single(&mask_patterns) {
        Ok(masks) => masks,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    let parse_rule = |text: &Option<String>, what: &str| match text {
        Some(text) => match parse_ignore_rule(text) {
            Some(rule) => Some(rule),
            None => {
                eprintln!("bad {what} rule {text:?}");
                std::process::exit(1);
            }
        },
        None => None,
    };
    let ignore_size = parse_rule(&cli.ignore_size, "ignore-size");
    let ignore_age = parse_rule(&cli.ignore_age, "ignore-age").map(|(op, v)| (op, v as i64));
    let dir_mode = match u32::from_str_radix(&cli.dir_mode, 8) {
        Ok(mode) => mode,
        Err(_) => {
            eprintln!("bad octal mode {:?}", cli.dir_mode);
            std::process::exit(1);
        }
    };

    let policy = DiffPolicy {
        masks,
        ignore_size,
        ignore_age,
        delete_unknown: cli.delete_unknown,
        delete_locked: cli.delete_locked,
        transfer_timeout: cli.timeout as i64,
        append_mode: cli.append,
        max_copied_files: cli.max_files,
        max_copied_file_size: cli.max_bytes,
        ..Default::default()
    };

    let mut ssh = SshConfig::new(cli.host.clone());
    ssh.port = cli.port;
    ssh.user = cli.user.clone();
    ssh.identity = cli.identity.clone();

    let job = FetchJob {
        source: cli.source.clone(),
        host_alias: cli.host_alias.clone().unwrap_or_else(|| cli.host.clone()),
        ssh,
        remote_dir: cli.remote_dir.clone(),
        policy,
        transient: cli.transient,
        delete_after_fetch: cli.delete_after_fetch,
        create_remote_dir: cli.create_dir,
        dir_mode,
        worker_id: cli.worker_id,
        slot: cli.slot,
        transfer_timeout: Duration::from_secs(cli.timeout),
        block_size: cli.block_size.max(1),
        keep_connected: cli.keep_connected.map(Duration::from_secs),
    };

    match fetch::run(&work, &job) {
        Ok(summary) => {
            log::info!(
                "cycle done: {} files, {} bytes, {} deleted{}",
                summary.files_fetched,
                summary.bytes_fetched,
                summary.files_deleted,
                if summary.more_files_in_list {
                    ", more queued"
                } else {
                    ""
                }
            );
            std::process::exit(0);
        }
        Err(e) => {
            log::error!("{}: {e}", cli.source);
            std::process::exit(e.exit_code());
        }
    }
}
