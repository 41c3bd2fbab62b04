//! Ordered file-mask groups.
//!
//! A mask list is an ordered list of groups; each group is an ordered
//! list of shell-style patterns. A leading `!` makes a pattern an
//! explicit exclusion. Within a group the first matching pattern decides:
//! an accepting match makes the file wanted, an exclusion ends scanning
//! of that group only. The first group that wants the file wins.

use glob::Pattern;

use crate::{Result, ScanError};

/// Verdict for one file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskVerdict {
    /// Some group accepted the name.
    Wanted,
    /// At least one group explicitly excluded it, and none wanted it.
    Excluded,
    /// No pattern in any group matched.
    Unmatched,
}

impl MaskVerdict {
    /// Unwanted names are deletion candidates under the unknown-file
    /// policy, excluded or not.
    pub fn is_wanted(self) -> bool {
        self == MaskVerdict::Wanted
    }
}

struct FileMask {
    pattern: Pattern,
    exclude: bool,
}

/// One ordered group of patterns sharing an acceptance policy.
pub struct MaskGroup {
    masks: Vec<FileMask>,
}

impl MaskGroup {
    /// Parses patterns; a leading `!` marks an exclusion.
    pub fn parse<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut masks = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let raw = raw.as_ref();
            let (exclude, text) = match raw.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, raw),
            };
            let pattern = Pattern::new(text).map_err(|source| ScanError::Pattern {
                mask: raw.to_string(),
                source,
            })?;
            masks.push(FileMask { pattern, exclude });
        }
        Ok(MaskGroup { masks })
    }

    /// `Some(true)` accepted, `Some(false)` explicitly excluded (scanning
    /// of this group ends), `None` when nothing matched.
    fn classify(&self, name: &str) -> Option<bool> {
        for mask in &self.masks {
            if mask.pattern.matches(name) {
                return Some(!mask.exclude);
            }
        }
        None
    }
}

/// The ordered list of groups of one source.
#[derive(Default)]
pub struct MaskList {
    groups: Vec<MaskGroup>,
}

impl MaskList {
    pub fn new(groups: Vec<MaskGroup>) -> Self {
        MaskList { groups }
    }

    /// Convenience for the common one-group case.
    pub fn single<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        Ok(MaskList {
            groups: vec![MaskGroup::parse(patterns)?],
        })
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn classify(&self, name: &str) -> MaskVerdict {
        let mut excluded = false;
        for group in &self.groups {
            match group.classify(name) {
                Some(true) => return MaskVerdict::Wanted,
                Some(false) => excluded = true,
                None => {}
            }
        }
        if excluded {
            MaskVerdict::Excluded
        } else {
            MaskVerdict::Unmatched
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_match_in_a_group_decides() {
        let list = MaskList::single(&["!*.tmp", "*.grib"]).unwrap();
        assert_eq!(list.classify("t12.grib"), MaskVerdict::Wanted);
        // The exclusion matches first and ends the group.
        assert_eq!(list.classify("t12.tmp"), MaskVerdict::Excluded);
        assert_eq!(list.classify("t12.txt"), MaskVerdict::Unmatched);
    }

    #[test]
    fn exclusion_ends_only_its_own_group() {
        let groups = vec![
            MaskGroup::parse(&["!gfs_*", "*.grib"]).unwrap(),
            MaskGroup::parse(&["gfs_*.grib"]).unwrap(),
        ];
        let list = MaskList::new(groups);
        // Excluded by group one, but group two still accepts it.
        assert_eq!(list.classify("gfs_t00.grib"), MaskVerdict::Wanted);
        assert_eq!(list.classify("icon_t00.grib"), MaskVerdict::Wanted);
        assert_eq!(list.classify("gfs_t00.bufr"), MaskVerdict::Excluded);
    }

    #[test]
    fn question_mark_and_ranges() {
        let list = MaskList::single(&["A?PD8[0-9]*"]).unwrap();
        assert_eq!(list.classify("ABPD85_20260801"), MaskVerdict::Wanted);
        assert_eq!(list.classify("ABPD8X"), MaskVerdict::Unmatched);
    }

    #[test]
    fn bad_pattern_is_reported_with_its_text() {
        match MaskList::single(&["[unclosed"]) {
            Err(ScanError::Pattern { mask, .. }) => assert_eq!(mask, "[unclosed"),
            other => panic!("expected pattern error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn empty_list_matches_nothing() {
        let list = MaskList::default();
        assert_eq!(list.classify("anything"), MaskVerdict::Unmatched);
    }
}
