//! Decoding of transfer-tool progress output.
//!
//! The copy tool reports progress differently depending on the phase it is in
//! and the flags it was given: a per-file or overall percentage, a
//! `to-chk=R/T` counter, or a running file count while the file list is still
//! being built. [`parse_progress`] understands all three and never fails on
//! input it does not recognise.

use std::sync::LazyLock;

use regex::Regex;

/// Upper bound for the progress reported while the file list is being built.
pub const FILE_LIST_PROGRESS_CAP: f64 = 0.05;

/// File count at which the file-list phase reaches its cap.
const FILE_LIST_SATURATION: f64 = 10_000.0;

// "(xfr#4, to-chk=30/120)" or "(xfer#4, to-check=30/120)"
static REMAINING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"to-(?:chk|check)=(\d+)/(\d+)").unwrap());

// "building file list ... 2,000 files..."
static FILE_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\d,]+) files\.\.\.").unwrap());

/// Decode one output line into a fraction in `[0.0, 1.0]`.
///
/// Patterns are tried in order, first match wins: percentage token,
/// remaining/total counter, file-list count.
pub fn parse_progress(line: &str) -> Option<f64> {
    parse_percentage(line)
        .or_else(|| parse_remaining(line))
        .or_else(|| parse_file_count(line))
}

fn parse_percentage(line: &str) -> Option<f64> {
    line.split_whitespace().find_map(|token| {
        let number = token.strip_suffix('%')?;
        let value: f64 = number.parse().ok()?;
        if value.is_finite() && value >= 0.0 {
            Some((value / 100.0).min(1.0))
        } else {
            None
        }
    })
}

fn parse_remaining(line: &str) -> Option<f64> {
    let caps = REMAINING_RE.captures(line)?;
    let remaining: f64 = caps.get(1)?.as_str().parse().ok()?;
    let total: f64 = caps.get(2)?.as_str().parse().ok()?;
    if total <= 0.0 {
        return None;
    }
    Some(((total - remaining) / total).clamp(0.0, 1.0))
}

fn parse_file_count(line: &str) -> Option<f64> {
    let caps = FILE_COUNT_RE.captures(line)?;
    let count: f64 = caps.get(1)?.as_str().replace(',', "").parse().ok()?;
    Some((count / FILE_LIST_SATURATION * FILE_LIST_PROGRESS_CAP).min(FILE_LIST_PROGRESS_CAP))
}
