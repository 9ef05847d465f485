use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Trailing marker of administrative/hidden shares (`ADMIN$`, `IPC$`).
pub const ADMIN_SHARE_MARKER: char = '$';

/// The only share kind that can be mounted.
pub const DISK_KIND: &str = "disk";

/// A share advertised by a remote host. Identity is `(host, name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Share {
    pub name: String,
    pub kind: String,
    pub host: String,
}

impl Share {
    pub fn disk(host: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DISK_KIND.to_string(),
            host: host.into(),
        }
    }

    pub fn is_mountable(&self) -> bool {
        self.kind.eq_ignore_ascii_case(DISK_KIND) && !self.name.contains(ADMIN_SHARE_MARKER)
    }

    pub fn mount_path(&self, mount_root: &Path) -> PathBuf {
        mount_root.join(&self.name)
    }
}

impl PartialEq for Share {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.name == other.name
    }
}

impl Eq for Share {}

impl Hash for Share {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.name.hash(state);
    }
}

/// Parse one line of a share listing:
///
/// ```text
/// Share          Type    Comments
/// -------------------------------
/// projects       Disk
/// IPC$           Pipe    IPC Service
/// ```
///
/// Only lines whose second column is `Disk` and whose name is not an
/// administrative share yield a [`Share`]; headers, separators and blank
/// lines are skipped.
pub fn parse_share_line(line: &str, host: &str) -> Option<Share> {
    let mut tokens = line.split_whitespace();
    let name = tokens.next()?;
    let kind = tokens.next()?;

    if !kind.eq_ignore_ascii_case(DISK_KIND) || name.contains(ADMIN_SHARE_MARKER) {
        return None;
    }

    Some(Share::disk(host, name))
}

pub fn parse_share_listing(output: &str, host: &str) -> Vec<Share> {
    output
        .lines()
        .filter_map(|line| parse_share_line(line, host))
        .collect()
}
