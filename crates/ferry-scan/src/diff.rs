//! Diffing a fresh listing against the retrieve list.
//!
//! The diff classifies every listed file (new, changed, unchanged,
//! unknown, locked), maintains the retrieve list rows accordingly, and
//! decides what this cycle may fetch under the per-cycle quota caps. The
//! remainder carries over: `more_files_in_list` tells the worker to come
//! back without waiting for the next listing interval.

use ferry_proto::NameEntry;
use ferry_store::{RetrieveEntry, RetrieveList};

use crate::listing::ListingEntry;
use crate::mask::MaskList;
use crate::Result;

/// Comparison operator of the ignore rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Equal,
    Less,
    Greater,
}

impl Comparator {
    fn holds<T: Ord>(self, lhs: T, rhs: T) -> bool {
        match self {
            Comparator::Equal => lhs == rhs,
            Comparator::Less => lhs < rhs,
            Comparator::Greater => lhs > rhs,
        }
    }
}

/// One file as the remote listing reported it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub name: String,
    pub size: u64,
    /// Seconds since the epoch, UTC; 0 when the listing had no date.
    pub mtime: i64,
    pub got_date: bool,
    pub is_dir: bool,
}

impl RemoteFile {
    /// From an SFTP NAME entry.
    pub fn from_name_entry(entry: &NameEntry) -> Self {
        let attrs = &entry.attrs;
        RemoteFile {
            name: entry.filename.to_string_lossy(),
            size: attrs.size.unwrap_or(0),
            mtime: attrs.mtime.map(|t| t as i64).unwrap_or(0),
            got_date: attrs.mtime.is_some(),
            is_dir: attrs.is_dir(),
        }
    }

    /// From a textual fact line.
    pub fn from_listing_entry(entry: &ListingEntry) -> Self {
        RemoteFile {
            name: entry.name.clone(),
            size: entry.size.unwrap_or(0),
            mtime: entry.mtime.unwrap_or(0),
            got_date: entry.mtime.is_some(),
            is_dir: !entry.is_file(),
        }
    }
}

/// Per-source policy applied by the diff.
pub struct DiffPolicy {
    pub masks: MaskList,
    /// Ignore files whose size compares true against the threshold.
    pub ignore_size: Option<(Comparator, u64)>,
    /// Ignore files whose age in seconds compares true against the
    /// threshold. Ages are computed against UTC mtimes.
    pub ignore_age: Option<(Comparator, i64)>,
    /// Delete files no mask group accepts, once old enough.
    pub delete_unknown: bool,
    pub unknown_file_time: i64,
    /// Delete stale dot-files (abandoned upload locks).
    pub delete_locked: bool,
    pub locked_file_time: i64,
    pub transfer_timeout: i64,
    /// Fetch only the grown tail of a file that got bigger.
    pub append_mode: bool,
    /// Per-cycle caps.
    pub max_copied_files: usize,
    pub max_copied_file_size: u64,
}

impl Default for DiffPolicy {
    fn default() -> Self {
        DiffPolicy {
            masks: MaskList::default(),
            ignore_size: None,
            ignore_age: None,
            delete_unknown: false,
            unknown_file_time: 4 * 3600,
            delete_locked: false,
            locked_file_time: 2 * 3600,
            transfer_timeout: 120,
            append_mode: false,
            max_copied_files: 100,
            max_copied_file_size: 1 << 30,
        }
    }
}

/// What one diff pass decided.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DiffOutcome {
    /// Row indices eligible for fetching this cycle, listing order.
    pub to_fetch: Vec<usize>,
    /// Remote names scheduled for deletion.
    pub to_delete: Vec<String>,
    /// The caps cut the cycle short; more work remains in the list.
    pub more_files_in_list: bool,
    /// Bytes scheduled this cycle (append mode counts deltas).
    pub bytes_scheduled: u64,
}

/// Applies a fresh `listing` to `list` under `policy`.
///
/// Rows for vanished files keep `in_list = false`; the caller prunes
/// durable lists afterwards.
pub fn diff(
    listing: &[RemoteFile],
    list: &mut RetrieveList,
    policy: &DiffPolicy,
    now: i64,
) -> Result<DiffOutcome> {
    let mut outcome = DiffOutcome::default();
    list.clear_in_list()?;

    let mut candidates: Vec<usize> = Vec::new();
    for file in listing {
        if file.is_dir || file.name == "." || file.name == ".." {
            continue;
        }

        // Stale upload locks are garbage-collected, never fetched.
        if file.name.starts_with('.') {
            let age = now - file.mtime;
            if policy.delete_locked
                && file.got_date
                && age > policy.locked_file_time
                && age > policy.transfer_timeout
            {
                outcome.to_delete.push(file.name.clone());
            }
            continue;
        }

        if !policy.masks.classify(&file.name).is_wanted() {
            if policy.delete_unknown && file.got_date && now - file.mtime > policy.unknown_file_time
            {
                outcome.to_delete.push(file.name.clone());
            }
            continue;
        }

        if let Some((op, threshold)) = policy.ignore_size {
            if op.holds(file.size, threshold) {
                continue;
            }
        }
        if let Some((op, threshold)) = policy.ignore_age {
            if file.got_date && op.holds(now - file.mtime, threshold) {
                continue;
            }
        }

        let index = match list.find(&file.name) {
            Some(index) => {
                let mut row = list.get(index)?;
                row.in_list = true;
                let changed = row.size != file.size || (file.got_date && row.mtime != file.mtime);
                if changed {
                    if policy.append_mode && row.retrieved && file.size > row.size {
                        // Only the grown tail is outstanding.
                        row.prev_size = row.size;
                    } else if !policy.append_mode {
                        row.prev_size = 0;
                    }
                    row.size = file.size;
                    row.mtime = file.mtime;
                    row.got_date = file.got_date;
                    row.retrieved = false;
                }
                list.set(index, &row)?;
                index
            }
            None => {
                let mut row = RetrieveEntry::new(file.name.clone(), file.size, file.mtime);
                row.got_date = file.got_date;
                list.push(&row)?
            }
        };
        candidates.push(index);
    }

    // Quota pass, in listing order.
    for index in candidates {
        let row = list.get(index)?;
        if row.retrieved || row.assigned != 0 {
            continue;
        }
        let amount = if policy.append_mode && row.prev_size > 0 {
            row.size.saturating_sub(row.prev_size)
        } else {
            row.size
        };
        let over_files = outcome.to_fetch.len() + 1 > policy.max_copied_files;
        let over_bytes = outcome.bytes_scheduled.saturating_add(amount) > policy.max_copied_file_size;
        // The first file always goes through, or an oversized file could
        // starve the whole source.
        if !outcome.to_fetch.is_empty() && (over_files || over_bytes) {
            outcome.more_files_in_list = true;
            break;
        }
        outcome.bytes_scheduled = outcome.bytes_scheduled.saturating_add(amount);
        outcome.to_fetch.push(index);
    }

    list.flush()?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_store::RetrieveList;

    const NOW: i64 = 1_800_000_000;

    fn file(name: &str, size: u64, mtime: i64) -> RemoteFile {
        RemoteFile {
            name: name.to_string(),
            size,
            mtime,
            got_date: mtime != 0,
            is_dir: false,
        }
    }

    fn fresh_list(dir: &tempfile::TempDir) -> RetrieveList {
        RetrieveList::attach(dir.path(), "src", false).unwrap()
    }

    fn accept_all() -> MaskList {
        MaskList::single(&["*"]).unwrap()
    }

    #[test]
    fn new_files_are_scheduled() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = fresh_list(&dir);
        let policy = DiffPolicy {
            masks: accept_all(),
            ..Default::default()
        };
        let listing = [file("a", 10, NOW - 60), file("b", 20, NOW - 60)];
        let outcome = diff(&listing, &mut list, &policy, NOW).unwrap();
        assert_eq!(outcome.to_fetch, vec![0, 1]);
        assert_eq!(outcome.bytes_scheduled, 30);
        assert!(!outcome.more_files_in_list);
        assert_eq!(list.count(), 2);
    }

    #[test]
    fn retrieved_and_unchanged_files_stay_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = fresh_list(&dir);
        let policy = DiffPolicy {
            masks: accept_all(),
            ..Default::default()
        };
        let listing = [file("a", 10, NOW - 60)];
        let first = diff(&listing, &mut list, &policy, NOW).unwrap();
        assert_eq!(first.to_fetch, vec![0]);
        list.mark_retrieved(0).unwrap();

        let second = diff(&listing, &mut list, &policy, NOW).unwrap();
        assert!(second.to_fetch.is_empty());
    }

    #[test]
    fn append_mode_counts_only_the_delta() {
        // The append-only fetch scenario: foo grew from 600 to 1000.
        let dir = tempfile::tempdir().unwrap();
        let mut list = fresh_list(&dir);
        let policy = DiffPolicy {
            masks: accept_all(),
            append_mode: true,
            ..Default::default()
        };
        let t = NOW - 600;
        diff(&[file("foo", 600, t)], &mut list, &policy, NOW).unwrap();
        list.mark_retrieved(0).unwrap();

        let outcome = diff(&[file("foo", 1000, t + 100)], &mut list, &policy, NOW).unwrap();
        assert_eq!(outcome.to_fetch, vec![0]);
        assert_eq!(outcome.bytes_scheduled, 400);
        let row = list.get(0).unwrap();
        assert!(!row.retrieved);
        assert_eq!(row.prev_size, 600);
        assert_eq!(row.size, 1000);
    }

    #[test]
    fn changed_file_without_append_mode_is_refetched_whole() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = fresh_list(&dir);
        let policy = DiffPolicy {
            masks: accept_all(),
            ..Default::default()
        };
        diff(&[file("a", 100, NOW - 300)], &mut list, &policy, NOW).unwrap();
        list.mark_retrieved(0).unwrap();

        let outcome = diff(&[file("a", 150, NOW - 100)], &mut list, &policy, NOW).unwrap();
        assert_eq!(outcome.to_fetch, vec![0]);
        assert_eq!(outcome.bytes_scheduled, 150);
        assert_eq!(list.get(0).unwrap().prev_size, 0);
    }

    #[test]
    fn quota_caps_cut_the_cycle_short() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = fresh_list(&dir);
        let policy = DiffPolicy {
            masks: accept_all(),
            max_copied_files: 2,
            ..Default::default()
        };
        let listing = [
            file("a", 1, NOW - 60),
            file("b", 1, NOW - 60),
            file("c", 1, NOW - 60),
        ];
        let outcome = diff(&listing, &mut list, &policy, NOW).unwrap();
        assert_eq!(outcome.to_fetch, vec![0, 1]);
        assert!(outcome.more_files_in_list);
        // The third row is in the list, just not scheduled yet.
        assert_eq!(list.count(), 3);
    }

    #[test]
    fn byte_cap_lets_the_first_file_through() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = fresh_list(&dir);
        let policy = DiffPolicy {
            masks: accept_all(),
            max_copied_file_size: 100,
            ..Default::default()
        };
        let listing = [file("huge", 5000, NOW - 60), file("small", 10, NOW - 60)];
        let outcome = diff(&listing, &mut list, &policy, NOW).unwrap();
        assert_eq!(outcome.to_fetch, vec![0]);
        assert!(outcome.more_files_in_list);
    }

    #[test]
    fn unknown_files_are_deleted_once_old_enough() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = fresh_list(&dir);
        let policy = DiffPolicy {
            masks: MaskList::single(&["*.grib"]).unwrap(),
            delete_unknown: true,
            unknown_file_time: 3600,
            ..Default::default()
        };
        let listing = [
            file("young.txt", 1, NOW - 60),
            file("old.txt", 1, NOW - 7200),
            file("keep.grib", 1, NOW - 7200),
        ];
        let outcome = diff(&listing, &mut list, &policy, NOW).unwrap();
        assert_eq!(outcome.to_delete, vec!["old.txt".to_string()]);
        assert_eq!(outcome.to_fetch.len(), 1);
        assert_eq!(list.count(), 1);
    }

    #[test]
    fn stale_dot_files_are_garbage_collected() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = fresh_list(&dir);
        let policy = DiffPolicy {
            masks: accept_all(),
            delete_locked: true,
            locked_file_time: 3600,
            transfer_timeout: 120,
            ..Default::default()
        };
        let listing = [
            file(".fresh-upload", 1, NOW - 60),
            file(".abandoned", 1, NOW - 7200),
        ];
        let outcome = diff(&listing, &mut list, &policy, NOW).unwrap();
        assert_eq!(outcome.to_delete, vec![".abandoned".to_string()]);
        // Dot files never become fetch candidates.
        assert!(outcome.to_fetch.is_empty());
        assert_eq!(list.count(), 0);
    }

    #[test]
    fn ignore_rules_filter_by_size_and_age() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = fresh_list(&dir);
        let policy = DiffPolicy {
            masks: accept_all(),
            ignore_size: Some((Comparator::Equal, 0)),
            ignore_age: Some((Comparator::Greater, 3600)),
            ..Default::default()
        };
        let listing = [
            file("empty", 0, NOW - 60),
            file("ancient", 10, NOW - 7200),
            file("good", 10, NOW - 60),
        ];
        let outcome = diff(&listing, &mut list, &policy, NOW).unwrap();
        assert_eq!(outcome.to_fetch.len(), 1);
        assert_eq!(list.get(outcome.to_fetch[0]).unwrap().name, "good");
    }

    #[test]
    fn vanished_rows_are_pruned_after_the_diff() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = fresh_list(&dir);
        let policy = DiffPolicy {
            masks: accept_all(),
            ..Default::default()
        };
        diff(
            &[file("a", 1, NOW - 60), file("b", 1, NOW - 60)],
            &mut list,
            &policy,
            NOW,
        )
        .unwrap();
        diff(&[file("b", 1, NOW - 60)], &mut list, &policy, NOW).unwrap();
        let removed = list.prune_not_in_list().unwrap();
        assert_eq!(removed, 1);
        assert_eq!(list.count(), 1);
        assert_eq!(list.get(0).unwrap().name, "b");
    }

    #[test]
    fn directories_are_never_fetched() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = fresh_list(&dir);
        let policy = DiffPolicy {
            masks: accept_all(),
            ..Default::default()
        };
        let mut sub = file("subdir", 0, NOW - 60);
        sub.is_dir = true;
        let outcome = diff(&[sub], &mut list, &policy, NOW).unwrap();
        assert!(outcome.to_fetch.is_empty());
        assert_eq!(list.count(), 0);
    }
}
