//! Parser for the textual listing fact format.
//!
//! Non-SFTP protocols list directories as fact lines:
//!
//! ```text
//! modify=20260801123000.500;perm=r;size=104448;type=file; Z__C_EDZW_20260801.bin
//! ```
//!
//! Facts are `;`-separated; the tail after the first space is the file
//! name, terminated by CR or LF. Unknown facts are skipped. Times are
//! UTC, as servers report them.

use time::{Date, Month, PrimitiveDateTime, Time};

/// Entry type fact.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ListingType {
    #[default]
    File,
    Dir,
    /// `cdir` - the listed directory itself.
    CurrentDir,
    /// `pdir` - the parent.
    ParentDir,
    /// `OS.unix=slink:<target>`.
    Symlink,
    Other(String),
}

/// One parsed fact line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListingEntry {
    pub name: String,
    pub size: Option<u64>,
    /// Seconds since the epoch, UTC.
    pub mtime: Option<i64>,
    pub entry_type: ListingType,
    pub perm: Option<String>,
}

impl ListingEntry {
    pub fn is_file(&self) -> bool {
        self.entry_type == ListingType::File
    }
}

/// Parses `modify=YYYYMMDDHHMMSS[.sss]` into a UTC epoch timestamp.
fn parse_modify(value: &str) -> Option<i64> {
    let digits = value.split('.').next()?;
    if digits.len() != 14 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let num = |range: std::ops::Range<usize>| -> i32 { digits[range].parse().unwrap_or(0) };
    let month = Month::try_from(num(4..6) as u8).ok()?;
    let date = Date::from_calendar_date(num(0..4), month, num(6..8) as u8).ok()?;
    let tod = Time::from_hms(num(8..10) as u8, num(10..12) as u8, num(12..14) as u8).ok()?;
    Some(PrimitiveDateTime::new(date, tod).assume_utc().unix_timestamp())
}

fn parse_type(value: &str) -> ListingType {
    match value {
        "file" => ListingType::File,
        "dir" => ListingType::Dir,
        "cdir" => ListingType::CurrentDir,
        "pdir" => ListingType::ParentDir,
        other => {
            if other.starts_with("OS.unix=slink") {
                ListingType::Symlink
            } else {
                ListingType::Other(other.to_string())
            }
        }
    }
}

/// Parses one fact line. `None` when the line carries no file name.
pub fn parse_line(line: &str) -> Option<ListingEntry> {
    let line = line.trim_end_matches(['\r', '\n']);
    let space = line.find(' ')?;
    let (facts, name) = line.split_at(space);
    let name = &name[1..];
    if name.is_empty() {
        return None;
    }
    let mut entry = ListingEntry {
        name: name.to_string(),
        ..Default::default()
    };
    for fact in facts.split(';').filter(|f| !f.is_empty()) {
        let Some((key, value)) = fact.split_once('=') else {
            continue;
        };
        match key {
            "modify" => entry.mtime = parse_modify(value),
            "size" => entry.size = value.parse().ok(),
            "perm" => entry.perm = Some(value.to_string()),
            "type" => entry.entry_type = parse_type(value),
            other => log::debug!("skipping unknown listing fact {other:?}"),
        }
    }
    Some(entry)
}

/// Parses a whole listing, skipping malformed lines.
pub fn parse_listing(text: &str) -> Vec<ListingEntry> {
    text.lines().filter_map(parse_line).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_line() {
        let entry = parse_line(
            "modify=20260801123000.500;perm=r;size=104448;type=file; Z__C_EDZW_20260801.bin\r",
        )
        .unwrap();
        assert_eq!(entry.name, "Z__C_EDZW_20260801.bin");
        assert_eq!(entry.size, Some(104_448));
        assert_eq!(entry.entry_type, ListingType::File);
        assert_eq!(entry.perm.as_deref(), Some("r"));
        // 2026-08-01 12:30:00 UTC
        assert_eq!(entry.mtime, Some(1_785_587_400));
    }

    #[test]
    fn classifies_directory_types() {
        let listing = parse_listing(concat!(
            "type=cdir; .\n",
            "type=pdir; ..\n",
            "type=dir;modify=20250101000000; sub\n",
            "type=OS.unix=slink:/target; link\n",
            "type=OS.weird; strange\n",
        ));
        assert_eq!(listing.len(), 5);
        assert_eq!(listing[0].entry_type, ListingType::CurrentDir);
        assert_eq!(listing[1].entry_type, ListingType::ParentDir);
        assert_eq!(listing[2].entry_type, ListingType::Dir);
        assert_eq!(listing[3].entry_type, ListingType::Symlink);
        assert_eq!(
            listing[4].entry_type,
            ListingType::Other("OS.weird".to_string())
        );
    }

    #[test]
    fn tolerates_garbage() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("no-facts-no-space"), None);
        // Unknown facts and an unparsable date survive as defaults.
        let entry = parse_line("modify=2026;color=blue;size=x; name.txt").unwrap();
        assert_eq!(entry.name, "name.txt");
        assert_eq!(entry.mtime, None);
        assert_eq!(entry.size, None);
    }

    #[test]
    fn name_may_contain_spaces() {
        let entry = parse_line("size=5;type=file; file with spaces.txt").unwrap();
        assert_eq!(entry.name, "file with spaces.txt");
    }
}
