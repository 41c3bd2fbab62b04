//! The retrieval cycle of the `ferry-fetch` worker.
//!
//! One invocation is one cycle: list the remote directory, diff it into
//! the retrieve list, claim rows under their locks, download each
//! claimed file (pipelined, append-aware), and leave durable state
//! behind for the next cycle. The worker's exit code tells the
//! supervisor's restart policy what happened.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ferry_scan::{diff, Comparator, DiffOutcome, DiffPolicy, RemoteFile, ScanError};
use ferry_sftp::{
    MultiReadOutcome, OpenMode, ReadOutcome, SessionConfig, SftpError, SftpSession,
};
use ferry_store::{HostTable, RetrieveEntry, RetrieveList, StoreError};
use ferry_transport::{HelperProcess, SshConfig, TransportError, Wire};
use thiserror::Error;

use crate::config::{
    EXIT_CONNECT_ERROR, EXIT_LIST_ERROR, EXIT_STORE_ERROR, EXIT_TRANSFER_ERROR,
};
use crate::dirs::WorkDir;
use crate::now_epoch;

/// Everything one fetch cycle needs to know.
pub struct FetchJob {
    /// Source alias; keys the retrieve list and the destination dir.
    pub source: String,
    /// Host alias in the shared host table.
    pub host_alias: String,
    pub ssh: SshConfig,
    pub remote_dir: String,
    pub policy: DiffPolicy,
    pub transient: bool,
    pub delete_after_fetch: bool,
    pub create_remote_dir: bool,
    pub dir_mode: u32,
    pub worker_id: u8,
    /// Job slot in the host table this worker occupies.
    pub slot: usize,
    pub transfer_timeout: Duration,
    pub block_size: u32,
    /// Keep the session open and keep cycling for this long instead of
    /// reconnecting per cycle.
    pub keep_connected: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct FetchSummary {
    pub files_fetched: usize,
    pub bytes_fetched: u64,
    pub files_deleted: usize,
    /// The caps cut the cycle short; rerun without waiting.
    pub more_files_in_list: bool,
}

impl FetchSummary {
    fn absorb(&mut self, other: FetchSummary) {
        self.files_fetched += other.files_fetched;
        self.bytes_fetched += other.bytes_fetched;
        self.files_deleted += other.files_deleted;
        self.more_files_in_list = other.more_files_in_list;
    }
}

/// Pause between keep-connected cycles with nothing queued.
const KEEP_CONNECTED_PAUSE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("cannot reach the remote: {0}")]
    Connect(#[source] TransportError),

    #[error("sftp handshake failed: {0}")]
    Handshake(#[source] SftpError),

    #[error(transparent)]
    Session(#[from] SftpError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Worker exit code for the supervisor's policy.
    pub fn exit_code(&self) -> i32 {
        match self {
            FetchError::Connect(_) | FetchError::Handshake(_) => EXIT_CONNECT_ERROR,
            FetchError::Scan(_) => EXIT_LIST_ERROR,
            FetchError::Store(_) => EXIT_STORE_ERROR,
            FetchError::Session(_) | FetchError::Io(_) => EXIT_TRANSFER_ERROR,
        }
    }
}

/// Parses an ignore rule like `=0`, `<1024` or `>3600`. A bare number
/// means equality.
pub fn parse_ignore_rule(text: &str) -> Option<(Comparator, u64)> {
    let text = text.trim();
    let (op, rest) = match text.as_bytes().first()? {
        b'=' => (Comparator::Equal, &text[1..]),
        b'<' => (Comparator::Less, &text[1..]),
        b'>' => (Comparator::Greater, &text[1..]),
        _ => (Comparator::Equal, text),
    };
    rest.trim().parse().ok().map(|value| (op, value))
}

/// Where a fetched file lands locally.
///
/// Fresh fetches download into a dot-prefixed lock name and rename when
/// complete; append-mode deltas extend the final file in place.
pub fn local_target(dest_dir: &Path, name: &str, append_offset: u64) -> (PathBuf, Option<PathBuf>) {
    if append_offset > 0 {
        (dest_dir.join(name), None)
    } else {
        (dest_dir.join(format!(".{name}")), Some(dest_dir.join(name)))
    }
}

/// Runs one full fetch cycle against the job's remote.
pub fn run(work: &WorkDir, job: &FetchJob) -> Result<FetchSummary, FetchError> {
    let mut hosts = HostTable::attach(&work.host_status_path())?;
    let host = hosts.find_or_add(&job.host_alias)?;
    let mut list = RetrieveList::attach(&work.ls_data_dir(), &job.source, job.transient)?;

    let (helper, pipe) = HelperProcess::spawn(&job.ssh).map_err(FetchError::Connect)?;
    let config = SessionConfig {
        transfer_timeout: job.transfer_timeout,
        ..Default::default()
    };
    let session = match SftpSession::handshake(pipe, config) {
        Ok(session) => session,
        Err(e) => {
            if let Err(reap) = helper.reap(job.transfer_timeout) {
                log::debug!("helper reap after failed handshake: {reap}");
            }
            return Err(FetchError::Handshake(e));
        }
    };
    let mut session = session;

    let result = run_cycles(work, job, &mut hosts, host, &mut list, &mut session);

    if let Err(e) = hosts.set_last_retry(host, now_epoch()) {
        log::debug!("cannot stamp last retry: {e}");
    }
    if let Err(e) = hosts.clear_slot(host, job.slot) {
        log::debug!("cannot clear job slot: {e}");
    }

    drop(session.quit());
    match helper.reap(job.transfer_timeout) {
        Ok(status) if !status.success() => {
            log::debug!("helper exited with {status}");
        }
        Ok(_) => {}
        Err(e) => log::warn!("reaping the helper failed: {e}"),
    }
    result
}

/// Runs one cycle, or keeps the session warm and cycles until the
/// keep-connected window closes. Between idle cycles the session sends a
/// keep-alive and sleeps; a short cycle (caps hit) reruns immediately.
fn run_cycles<W: Wire>(
    work: &WorkDir,
    job: &FetchJob,
    hosts: &mut HostTable,
    host: usize,
    list: &mut RetrieveList,
    session: &mut SftpSession<W>,
) -> Result<FetchSummary, FetchError> {
    let mut total = FetchSummary::default();
    total.absorb(run_cycle(work, job, hosts, host, list, session)?);
    let Some(window) = job.keep_connected else {
        return Ok(total);
    };
    let end = std::time::Instant::now() + window;
    while std::time::Instant::now() < end {
        if !total.more_files_in_list {
            let remaining = end.saturating_duration_since(std::time::Instant::now());
            std::thread::sleep(KEEP_CONNECTED_PAUSE.min(remaining));
            session.noop()?;
        }
        total.absorb(run_cycle(work, job, hosts, host, list, session)?);
    }
    Ok(total)
}

/// The cycle proper, once a session is up. Generic over the wire so the
/// session can be driven by tests.
pub fn run_cycle<W: Wire>(
    work: &WorkDir,
    job: &FetchJob,
    hosts: &mut HostTable,
    host: usize,
    list: &mut RetrieveList,
    session: &mut SftpSession<W>,
) -> Result<FetchSummary, FetchError> {
    let mut summary = FetchSummary::default();

    hosts.set_slot(
        host,
        job.slot,
        ferry_store::JobSlot {
            pid: std::process::id() as i32,
            bytes_done: 0,
            last_activity: now_epoch(),
        },
    )?;

    session.cd(&job.remote_dir, job.create_remote_dir, job.dir_mode, None)?;

    // Idempotent resumption: a durable list that still holds a backlog is
    // worked off before the remote is listed again.
    let mut outcome = DiffOutcome::default();
    let mut listed = false;
    if !list.is_transient() {
        outcome = resume_candidates(list, &job.policy)?;
        if !outcome.to_fetch.is_empty() {
            log::info!(
                "{}: resuming {} queued files from the last cycle",
                job.source,
                outcome.to_fetch.len()
            );
        }
    }
    if outcome.to_fetch.is_empty() {
        let entries = session.list_dir(".").map_err(FetchError::Session)?;
        let listing: Vec<RemoteFile> = entries.iter().map(RemoteFile::from_name_entry).collect();
        outcome = diff(&listing, list, &job.policy, now_epoch())?;
        listed = true;
    }
    summary.more_files_in_list = outcome.more_files_in_list;

    for name in &outcome.to_delete {
        match session.remove(name) {
            Ok(()) => summary.files_deleted += 1,
            Err(e) => log::warn!("cannot delete remote {name}: {e}"),
        }
    }

    let dest_dir = work.incoming_dir().join(&job.source);
    std::fs::create_dir_all(&dest_dir)?;

    for &index in &outcome.to_fetch {
        if !list.try_lock_row(index)? {
            // Another worker owns the row right now.
            continue;
        }
        if !list.assign(index, job.worker_id)? {
            list.unlock_row(index)?;
            continue;
        }
        let row = list.get(index)?;
        match fetch_one(job, hosts, host, session, &row, &dest_dir) {
            Ok(bytes) => {
                list.mark_retrieved(index)?;
                list.unlock_row(index)?;
                summary.files_fetched += 1;
                summary.bytes_fetched += bytes;
                log::info!("fetched {} ({bytes} bytes)", row.name);
                if job.delete_after_fetch {
                    if let Err(e) = session.remove(&row.name) {
                        log::warn!("cannot delete fetched remote {}: {e}", row.name);
                    }
                }
            }
            Err(e) => {
                // Give the row back and record the failure on the host.
                let mut released = row.clone();
                released.assigned = 0;
                if let Err(se) = list.set(index, &released) {
                    log::warn!("cannot release row {index}: {se}");
                }
                list.unlock_row(index)?;
                if hosts.lock_errors(host).is_ok() {
                    let _ = hosts.bump_errors(host);
                    let _ = hosts.unlock_errors(host);
                }
                return Err(e);
            }
        }
    }

    if listed && !list.is_transient() {
        list.prune_not_in_list()?;
    }

    // A clean cycle resets the host's error trail.
    if hosts.lock_errors(host).is_ok() {
        let _ = hosts.clear_errors(host);
        let _ = hosts.unlock_errors(host);
    }
    Ok(summary)
}

/// Rows a prior cycle left behind: in the listing, unretrieved and
/// unassigned. The same per-cycle caps apply as in the diff.
fn resume_candidates(
    list: &RetrieveList,
    policy: &DiffPolicy,
) -> Result<DiffOutcome, FetchError> {
    let mut outcome = DiffOutcome::default();
    for index in 0..list.count() {
        let row = list.get(index)?;
        if !row.in_list || row.retrieved || row.assigned != 0 {
            continue;
        }
        let amount = if policy.append_mode && row.prev_size > 0 {
            row.size.saturating_sub(row.prev_size)
        } else {
            row.size
        };
        let over_files = outcome.to_fetch.len() + 1 > policy.max_copied_files;
        let over_bytes =
            outcome.bytes_scheduled.saturating_add(amount) > policy.max_copied_file_size;
        if !outcome.to_fetch.is_empty() && (over_files || over_bytes) {
            outcome.more_files_in_list = true;
            break;
        }
        outcome.bytes_scheduled = outcome.bytes_scheduled.saturating_add(amount);
        outcome.to_fetch.push(index);
    }
    Ok(outcome)
}

fn fetch_one<W: Wire>(
    job: &FetchJob,
    hosts: &mut HostTable,
    host: usize,
    session: &mut SftpSession<W>,
    row: &RetrieveEntry,
    dest_dir: &Path,
) -> Result<u64, FetchError> {
    let offset = if job.policy.append_mode && row.prev_size > 0 {
        row.prev_size
    } else {
        0
    };
    let (path, rename_to) = local_target(dest_dir, &row.name, offset);
    let mut local = if offset > 0 {
        OpenOptions::new().append(true).create(true).open(&path)?
    } else {
        File::create(&path)?
    };

    session.open_file(&row.name, OpenMode::Read, offset, job.block_size)?;
    let total = row.size.saturating_sub(offset);
    let mut fetched = 0u64;
    let mut buf = vec![0u8; job.block_size as usize];

    if total > 0 {
        session.multi_read_start(total, job.block_size)?;
        loop {
            match session.multi_read_catch(&mut buf) {
                Ok(MultiReadOutcome::Chunk(n)) => {
                    local.write_all(&buf[..n])?;
                    fetched += n as u64;
                    hosts.note_activity(host, job.slot, n as u64, now_epoch())?;
                }
                Ok(MultiReadOutcome::Eof) => break,
                Ok(MultiReadOutcome::Downgrade) => {
                    log::info!(
                        "{}: server breaks read pipelining, falling back to single reads",
                        row.name
                    );
                    session.multi_read_discard()?;
                    loop {
                        match session.read(&mut buf)? {
                            ReadOutcome::Data(n) => {
                                local.write_all(&buf[..n])?;
                                fetched += n as u64;
                                hosts.note_activity(host, job.slot, n as u64, now_epoch())?;
                            }
                            ReadOutcome::Eof => break,
                        }
                    }
                    break;
                }
                Err(e) => {
                    if let Err(de) = session.multi_read_discard() {
                        log::debug!("discard after read failure: {de}");
                    }
                    if let Err(ce) = session.close_file() {
                        log::debug!("close after read failure: {ce}");
                    }
                    return Err(FetchError::Session(e));
                }
            }
        }
    }
    // A premature EOF can leave reads queued; drain them before CLOSE.
    if session.multi_read_active() {
        session.multi_read_discard()?;
    }
    session.close_file()?;
    local.flush()?;
    drop(local);

    let final_path = match rename_to {
        Some(final_path) => {
            std::fs::rename(&path, &final_path)?;
            final_path
        }
        None => path,
    };
    // Carry the remote modification time over, when the listing had one.
    if row.got_date && row.mtime > 0 {
        let tv = nix::sys::time::TimeVal::new(row.mtime, 0);
        if let Err(e) = nix::sys::stat::utimes(&final_path, &tv, &tv) {
            log::debug!("cannot set mtime of {}: {e}", final_path.display());
        }
    }
    Ok(fetched)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_rules_parse() {
        assert_eq!(parse_ignore_rule("=0"), Some((Comparator::Equal, 0)));
        assert_eq!(parse_ignore_rule("<1024"), Some((Comparator::Less, 1024)));
        assert_eq!(parse_ignore_rule("> 3600"), Some((Comparator::Greater, 3600)));
        assert_eq!(parse_ignore_rule("77"), Some((Comparator::Equal, 77)));
        assert_eq!(parse_ignore_rule(""), None);
        assert_eq!(parse_ignore_rule(">x"), None);
    }

    #[test]
    fn fresh_fetches_use_a_dot_lock_name() {
        let dest = Path::new("/work/files/incoming/src");
        let (path, rename) = local_target(dest, "data.grib", 0);
        assert_eq!(path, dest.join(".data.grib"));
        assert_eq!(rename, Some(dest.join("data.grib")));
    }

    #[test]
    fn append_deltas_extend_the_final_file() {
        let dest = Path::new("/work/files/incoming/src");
        let (path, rename) = local_target(dest, "growing.log", 600);
        assert_eq!(path, dest.join("growing.log"));
        assert_eq!(rename, None);
    }

    #[test]
    fn resume_picks_only_the_open_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = RetrieveList::attach(dir.path(), "src", false).unwrap();
        let mut done = ferry_store::RetrieveEntry::new("done", 10, 1);
        done.retrieved = true;
        list.push(&done).unwrap();
        list.push(&ferry_store::RetrieveEntry::new("pending", 20, 1))
            .unwrap();
        let mut taken = ferry_store::RetrieveEntry::new("taken", 30, 1);
        taken.assigned = 2;
        list.push(&taken).unwrap();

        let policy = DiffPolicy::default();
        let outcome = resume_candidates(&list, &policy).unwrap();
        assert_eq!(outcome.to_fetch, vec![1]);
        assert_eq!(outcome.bytes_scheduled, 20);
        assert!(!outcome.more_files_in_list);
    }

    #[test]
    fn resume_honors_the_file_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = RetrieveList::attach(dir.path(), "src", false).unwrap();
        for name in ["a", "b", "c"] {
            list.push(&ferry_store::RetrieveEntry::new(name, 5, 1))
                .unwrap();
        }
        let policy = DiffPolicy {
            max_copied_files: 2,
            ..Default::default()
        };
        let outcome = resume_candidates(&list, &policy).unwrap();
        assert_eq!(outcome.to_fetch, vec![0, 1]);
        assert!(outcome.more_files_in_list);
    }

    #[test]
    fn exit_codes_map_by_failure_stage() {
        let connect = FetchError::Connect(TransportError::ConnectionClosed);
        assert_eq!(connect.exit_code(), EXIT_CONNECT_ERROR);
        let store = FetchError::Store(StoreError::RowOutOfRange { index: 1, count: 0 });
        assert_eq!(store.exit_code(), EXIT_STORE_ERROR);
        let io = FetchError::Io(std::io::Error::other("x"));
        assert_eq!(io.exit_code(), EXIT_TRANSFER_ERROR);
    }
}
