//! LIST response and MDTM timestamp parsing.
//!
//! Supports two listing formats:
//! 1. **Unix-style** (`ls -l`): `-rwxr-xr-x 1 owner group 1234 Jan  1 12:00 file.txt`
//! 2. **Windows/IIS-style**: `01-01-26  12:00AM       1234 file.txt`
//!
//! Lines neither format matches become name-only entries; a listing never
//! fails to parse.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::{FtpEntry, FtpEntryKind, FtpSortField, FtpSortOrder, ListOptions};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref UNIX_LINE: Regex = Regex::new(
        r"(?x)
        ^([dlcbps-][rwxsStT-]{9})[+@.]?\s+   # permissions
        (\d+)\s+                             # link count
        (\S+)\s+                             # owner
        (\S+)\s+                             # group
        (\d+)\s+                             # size
        (\w{3}\s+\d{1,2}\s+[\d:]+)\s+        # date
        (.+)$                                # filename (possibly with -> target)
        ",
    )
    .unwrap();
    static ref WINDOWS_LINE: Regex = Regex::new(
        r"(?x)
        ^(\d{2}-\d{2}-\d{2,4})\s+            # date
        (\d{1,2}:\d{2}\s?(?:AM|PM)?)\s+      # time
        (<DIR>|\d+)\s+                       # size or <DIR>
        (.+)$                                # filename
        ",
    )
    .unwrap();
    static ref TOTAL_LINE: Regex = Regex::new(r"^total\s+\d+$").unwrap();
}

/// Parse a full LIST response body.
pub fn parse_listing(raw: &str) -> Vec<FtpEntry> {
    raw.lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .filter(|l| !TOTAL_LINE.is_match(l.trim()))
        .map(parse_line)
        .filter(|e| e.name != "." && e.name != "..")
        .collect()
}

/// Parse a single listing line.
pub fn parse_line(line: &str) -> FtpEntry {
    parse_unix(line)
        .or_else(|| parse_windows(line))
        .unwrap_or_else(|| FtpEntry::name_only(line.trim()))
}

/// Filter and sort a listing per `opts`.
pub fn apply_list_options(
    mut entries: Vec<FtpEntry>,
    opts: &ListOptions,
) -> FtpResult<Vec<FtpEntry>> {
    if let Some(ref filter) = opts.filter {
        let pattern = glob::Pattern::new(filter).map_err(|e| {
            FtpError::invalid_config(format!("Invalid filter '{}': {}", filter, e))
        })?;
        entries.retain(|e| pattern.matches(&e.name));
    }

    if !opts.show_hidden {
        entries.retain(|e| !e.name.starts_with('.'));
    }

    if let Some(ref sort_by) = opts.sort_by {
        match sort_by {
            FtpSortField::Name => {
                entries.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            }
            FtpSortField::Size => entries.sort_by(|a, b| a.size.cmp(&b.size)),
            FtpSortField::Modified => entries.sort_by(|a, b| a.modified.cmp(&b.modified)),
            FtpSortField::Kind => entries.sort_by_key(|e| kind_rank(e.kind)),
        }
    }

    if opts.sort_order == Some(FtpSortOrder::Desc) {
        entries.reverse();
    }

    Ok(entries)
}

fn kind_rank(kind: FtpEntryKind) -> u8 {
    match kind {
        FtpEntryKind::Directory => 0,
        FtpEntryKind::Symlink => 1,
        FtpEntryKind::File => 2,
        FtpEntryKind::Unknown => 3,
    }
}

/// Parse an MDTM reply: the first 14 digits as `YYYYMMDDhhmmss` (UTC).
///
/// Fractional seconds (`20260101120000.123`) are ignored.
pub fn parse_mdtm(text: &str) -> FtpResult<DateTime<Utc>> {
    let digits = text
        .split_whitespace()
        .find(|w| w.len() >= 14 && w.as_bytes()[..14].iter().all(u8::is_ascii_digit))
        .map(|w| &w[..14])
        .ok_or_else(|| FtpError::malformed_reply(format!("No MDTM timestamp in '{}'", text)))?;

    NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M%S")
        .map(|dt| Utc.from_utc_datetime(&dt))
        .map_err(|e| FtpError::malformed_reply(format!("Bad MDTM timestamp '{}': {}", digits, e)))
}

// ─── Unix-style parser ───────────────────────────────────────────────

/// ```text
/// drwxr-xr-x   2 user group  4096 Jan  1 12:00 dirname
/// -rw-r--r--   1 user group  1234 Jan  1  2025 file.txt
/// lrwxrwxrwx   1 user group    42 Jan  1 12:00 link -> target
/// ```
fn parse_unix(line: &str) -> Option<FtpEntry> {
    let caps = UNIX_LINE.captures(line.trim())?;

    let perms = caps.get(1)?.as_str();
    let owner = caps.get(3).map(|m| m.as_str().to_string());
    let group = caps.get(4).map(|m| m.as_str().to_string());
    let size = caps.get(5)?.as_str().parse::<u64>().ok();
    let date_str = caps.get(6)?.as_str();
    let name_raw = caps.get(7)?.as_str();

    let kind = match perms.as_bytes().first() {
        Some(b'd') => FtpEntryKind::Directory,
        Some(b'l') => FtpEntryKind::Symlink,
        Some(b'-') => FtpEntryKind::File,
        _ => FtpEntryKind::Unknown,
    };

    let (name, link_target) = match name_raw.find(" -> ") {
        Some(pos) if kind == FtpEntryKind::Symlink => (
            name_raw[..pos].to_string(),
            Some(name_raw[pos + 4..].to_string()),
        ),
        _ => (name_raw.to_string(), None),
    };

    Some(FtpEntry {
        name,
        kind,
        size,
        timestamp: Some(date_str.to_string()),
        modified: parse_unix_date(date_str, Utc::now()),
        permissions: Some(perms.to_string()),
        owner,
        group,
        link_target,
        raw: line.to_string(),
    })
}

/// Interpret "Jan  1 12:00" (year implied) or "Jan  1  2025".
///
/// An implied-year date that would lie in the future belongs to last year.
fn parse_unix_date(s: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let normalised = s.split_whitespace().collect::<Vec<_>>().join(" ");

    if let Ok(dt) = NaiveDateTime::parse_from_str(
        &format!("{} {}", now.year(), normalised),
        "%Y %b %d %H:%M",
    ) {
        let dt = Utc.from_utc_datetime(&dt);
        if dt > now + chrono::Duration::days(1) {
            let earlier = dt.with_year(now.year() - 1)?;
            return Some(earlier);
        }
        return Some(dt);
    }

    if let Ok(date) = NaiveDate::parse_from_str(&normalised, "%b %d %Y") {
        let dt = date.and_time(NaiveTime::from_hms_opt(0, 0, 0)?);
        return Some(Utc.from_utc_datetime(&dt));
    }

    None
}

// ─── Windows-style parser ────────────────────────────────────────────

/// ```text
/// 01-01-26  12:00AM       1234 file.txt
/// 01-01-26  12:00PM      <DIR> Directory Name
/// ```
fn parse_windows(line: &str) -> Option<FtpEntry> {
    let caps = WINDOWS_LINE.captures(line.trim())?;

    let date_str = caps.get(1)?.as_str();
    let time_str = caps.get(2)?.as_str();
    let size_or_dir = caps.get(3)?.as_str();
    let name = caps.get(4)?.as_str().to_string();

    let (kind, size) = if size_or_dir == "<DIR>" {
        (FtpEntryKind::Directory, None)
    } else {
        (FtpEntryKind::File, size_or_dir.parse::<u64>().ok())
    };

    Some(FtpEntry {
        name,
        kind,
        size,
        timestamp: Some(format!("{} {}", date_str, time_str)),
        modified: parse_windows_date(date_str, time_str),
        permissions: None,
        owner: None,
        group: None,
        link_target: None,
        raw: line.to_string(),
    })
}

fn parse_windows_date(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let combined = format!("{} {}", date, time.replace(' ', ""));
    ["%m-%d-%y %I:%M%p", "%m-%d-%y %H:%M", "%m-%d-%Y %I:%M%p", "%m-%d-%Y %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&combined, fmt).ok())
        .map(|dt| Utc.from_utc_datetime(&dt))
}
