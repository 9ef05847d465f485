//! Mounting and unmounting of discovered shares.
//!
//! Some hosts are different addresses of the same backend (a "conflict
//! group"). Mounting a share from one of them while a stale mount from
//! another is still present would collide on the mount name, so such mounts
//! are removed first. A mount only counts once its path can be read.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::MountError;
use super::remote::{MountAuth, RemoteAdapter, mount_url};
use super::share::Share;

/// Filesystem type marker of remote share mounts in the mount table.
pub const REMOTE_FS_MARKER: &str = "smbfs";

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(1500);

/// One line of the system mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mount_point: PathBuf,
}

impl MountEntry {
    /// Host part of a source like `//user@host/share`.
    pub fn source_host(&self) -> Option<&str> {
        let rest = self.source.trim_start_matches("smb:").trim_start_matches('/');
        let rest = rest.rsplit_once('@').map_or(rest, |(_, host)| host);
        let host = rest.split('/').next()?;
        (!host.is_empty()).then_some(host)
    }
}

/// Parse `mount` output, keeping remote share mounts below `mount_root`:
///
/// ```text
/// //bob@nas.local/media on /Volumes/media (smbfs, nodev, nosuid, mounted by bob)
/// ```
pub fn parse_mount_table(output: &str, mount_root: &Path) -> Vec<MountEntry> {
    output
        .lines()
        .filter(|line| line.contains(REMOTE_FS_MARKER))
        .filter_map(|line| {
            let (source, rest) = line.split_once(" on ")?;
            let mount_point = rest.split_once(" (").map_or(rest, |(path, _)| path);
            let mount_point = PathBuf::from(mount_point.trim());
            mount_point.starts_with(mount_root).then(|| MountEntry {
                source: source.trim().to_string(),
                mount_point,
            })
        })
        .collect()
}

/// Sets of hosts that must never be mounted at the same time.
#[derive(Debug, Clone, Default)]
pub struct ConflictGroups(Vec<Vec<String>>);

impl ConflictGroups {
    pub fn new(groups: Vec<Vec<String>>) -> Self {
        Self(groups)
    }

    fn group_of(&self, host: &str) -> Option<&[String]> {
        self.0
            .iter()
            .find(|group| group.iter().any(|h| h.eq_ignore_ascii_case(host)))
            .map(Vec::as_slice)
    }

    pub fn contains(&self, host: &str) -> bool {
        self.group_of(host).is_some()
    }

    pub fn same_group(&self, a: &str, b: &str) -> bool {
        self.group_of(a)
            .is_some_and(|group| group.iter().any(|h| h.eq_ignore_ascii_case(b)))
    }
}

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub mount_root: PathBuf,
    pub conflict_groups: ConflictGroups,
    pub settle_delay: Duration,
}

/// Owns the set of shares mounted by this process. Calls are serialized.
pub struct MountCoordinator {
    adapter: Arc<dyn RemoteAdapter>,
    options: MountOptions,
    mounted: Mutex<HashSet<Share>>,
}

impl MountCoordinator {
    pub fn new(adapter: Arc<dyn RemoteAdapter>, options: MountOptions) -> Self {
        Self {
            adapter,
            options,
            mounted: Mutex::new(HashSet::new()),
        }
    }

    pub async fn mounted_shares(&self) -> Vec<Share> {
        self.mounted.lock().await.iter().cloned().collect()
    }

    /// Mount `shares` in order and return their mount paths.
    ///
    /// Stops at the first share that fails to mount or to verify; shares
    /// mounted before that stay mounted and tracked.
    pub async fn mount(
        &self,
        shares: &[Share],
        auth: &MountAuth,
    ) -> Result<Vec<PathBuf>, MountError> {
        let mut mounted = self.mounted.lock().await;
        let mut resolved_hosts = HashSet::new();
        let mut paths = Vec::with_capacity(shares.len());

        for share in shares {
            if !share.is_mountable() {
                return Err(MountError::MountFailure {
                    share: share.name.clone(),
                    reason: "not a mountable disk share".to_string(),
                });
            }

            if self.options.conflict_groups.contains(&share.host)
                && resolved_hosts.insert(share.host.to_ascii_lowercase())
            {
                self.resolve_conflicts(&share.host, &mut mounted).await;
            }

            let mount_point = share.mount_path(&self.options.mount_root);
            let (_, safe_url) =
                mount_url(share, auth).map_err(|reason| MountError::MountFailure {
                    share: share.name.clone(),
                    reason,
                })?;
            info!(url = %safe_url, path = %mount_point.display(), "Mounting share");

            self.adapter
                .mount(share, auth, &mount_point)
                .await
                .map_err(|reason| MountError::MountFailure {
                    share: share.name.clone(),
                    reason,
                })?;

            tokio::time::sleep(self.options.settle_delay).await;

            if let Err(reason) = self.adapter.probe(&mount_point).await {
                warn!(share = %share.name, error = %reason, "Mounted share is not browsable");
                return Err(MountError::MountFailure {
                    share: share.name.clone(),
                    reason: format!("mount reported success but path is not readable: {}", reason),
                });
            }

            mounted.insert(share.clone());
            paths.push(mount_point);
        }

        Ok(paths)
    }

    /// Best-effort unmount; returns the failures, every share is attempted.
    pub async fn unmount_all(&self, shares: &[Share]) -> Vec<MountError> {
        let mut mounted = self.mounted.lock().await;
        let mut failures = Vec::new();

        for share in shares {
            let path = share.mount_path(&self.options.mount_root);
            match self.unmount_path(&path).await {
                Ok(()) => {
                    mounted.remove(share);
                }
                Err(e) => {
                    warn!(share = %share.name, error = %e, "Unmount failed");
                    failures.push(e);
                }
            }
        }

        failures
    }

    async fn resolve_conflicts(&self, host: &str, mounted: &mut HashSet<Share>) {
        let table = match self.adapter.mount_table().await {
            Ok(table) => table,
            Err(e) => {
                warn!(host, error = %e, "Could not read mount table, skipping conflict check");
                return;
            }
        };

        for entry in parse_mount_table(&table, &self.options.mount_root) {
            let Some(source_host) = entry.source_host() else {
                continue;
            };
            if !self.options.conflict_groups.same_group(host, source_host) {
                continue;
            }

            info!(
                host,
                conflicting = source_host,
                path = %entry.mount_point.display(),
                "Removing conflicting mount"
            );
            match self.unmount_path(&entry.mount_point).await {
                Ok(()) => {
                    let root = &self.options.mount_root;
                    mounted.retain(|share| share.mount_path(root) != entry.mount_point);
                }
                Err(e) => warn!(error = %e, "Conflicting mount could not be removed"),
            }
        }
    }

    async fn unmount_path(&self, path: &Path) -> Result<(), MountError> {
        let graceful = match self.adapter.unmount(path, false).await {
            Ok(()) => {
                debug!(path = %path.display(), "Unmounted");
                return Ok(());
            }
            Err(e) => e,
        };

        warn!(path = %path.display(), error = %graceful, "Graceful unmount failed, forcing");
        self.adapter
            .unmount(path, true)
            .await
            .map_err(|forced| MountError::UnmountFailure {
                path: path.to_path_buf(),
                reason: format!("{}; forced: {}", graceful, forced),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
/dev/disk3s1s1 on / (apfs, sealed, local, read-only, journaled)
//bob@nas-a.local/media on /Volumes/media (smbfs, nodev, nosuid, mounted by bob)
//GUEST:@10.0.0.5/public on /Volumes/public (smbfs, nodev, nosuid, mounted by bob)
//bob@nas-a.local/other on /Users/bob/mnt/other (smbfs, nodev, nosuid, mounted by bob)
map auto_home on /System/Volumes/Data/home (autofs, automounted, nobrowse)";

    #[test]
    fn parses_remote_mounts_under_root() {
        let entries = parse_mount_table(TABLE, Path::new("/Volumes"));
        assert_eq!(
            entries,
            vec![
                MountEntry {
                    source: "//bob@nas-a.local/media".to_string(),
                    mount_point: PathBuf::from("/Volumes/media"),
                },
                MountEntry {
                    source: "//GUEST:@10.0.0.5/public".to_string(),
                    mount_point: PathBuf::from("/Volumes/public"),
                },
            ]
        );
        assert_eq!(entries[0].source_host(), Some("nas-a.local"));
        assert_eq!(entries[1].source_host(), Some("10.0.0.5"));
    }

    #[test]
    fn source_host_without_user() {
        let entry = MountEntry {
            source: "//fileserver/data".to_string(),
            mount_point: PathBuf::from("/Volumes/data"),
        };
        assert_eq!(entry.source_host(), Some("fileserver"));
    }

    #[test]
    fn conflict_groups_are_case_insensitive() {
        let groups = ConflictGroups::new(vec![vec![
            "nas-a.local".to_string(),
            "10.0.0.5".to_string(),
        ]]);
        assert!(groups.contains("NAS-A.local"));
        assert!(groups.same_group("nas-a.local", "10.0.0.5"));
        assert!(!groups.same_group("nas-a.local", "other"));
        assert!(!groups.same_group("other", "other"));
    }
}
