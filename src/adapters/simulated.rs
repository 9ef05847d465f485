use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::core::error::ListingError;
use crate::core::remote::{ListingAuth, MountAuth, RemoteAdapter};
use crate::core::share::Share;

const DEMO_LISTING: &str = "\
Share                                           Type    Comments
-------------------------------
projects                                        Disk
archive                                         Disk    Cold storage
IPC$                                            Pipe    IPC Service
ADMIN$                                          Disk    Remote Admin

4 shares listed
";

#[derive(Default)]
struct SimState {
    /// (host, username or None for guest) -> scripted result
    listings: HashMap<(String, Option<String>), Result<String, ListingError>>,
    fallback_listing: Option<String>,
    /// (source, mount point)
    mounts: Vec<(String, PathBuf)>,
    failing_mounts: HashSet<String>,
    unbrowsable: HashSet<String>,
    busy: HashSet<PathBuf>,
    stuck: HashSet<PathBuf>,
    calls: Vec<String>,
}

/// In-memory stand-in for the share tools, driven through a [`Simulator`].
pub struct SimulatedAdapter {
    state: Arc<Mutex<SimState>>,
}

/// Scripts and inspects a [`SimulatedAdapter`].
#[derive(Clone)]
pub struct Simulator {
    state: Arc<Mutex<SimState>>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedAdapter {
    pub fn new() -> (Self, Simulator) {
        let state = Arc::new(Mutex::new(SimState::default()));
        (
            Self {
                state: state.clone(),
            },
            Simulator { state },
        )
    }

    /// Adapter that answers every listing with a small demo share list.
    pub fn demo() -> Self {
        let (adapter, simulator) = Self::new();
        simulator.set_fallback_listing(DEMO_LISTING);
        adapter
    }
}

impl Simulator {
    /// Script the listing result for `host` and `username` (`None` = guest).
    pub fn set_listing(
        &self,
        host: &str,
        username: Option<&str>,
        result: Result<&str, ListingError>,
    ) {
        lock(&self.state).listings.insert(
            (host.to_string(), username.map(str::to_string)),
            result.map(str::to_string),
        );
    }

    pub fn set_fallback_listing(&self, output: &str) {
        lock(&self.state).fallback_listing = Some(output.to_string());
    }

    /// Pretend a share is already mounted (e.g. left over from an earlier session).
    pub fn add_mount(&self, source: &str, mount_point: impl Into<PathBuf>) {
        lock(&self.state)
            .mounts
            .push((source.to_string(), mount_point.into()));
    }

    pub fn fail_mount(&self, share: &str) {
        lock(&self.state).failing_mounts.insert(share.to_string());
    }

    /// Mount succeeds but the path cannot be read.
    pub fn mark_unbrowsable(&self, share: &str) {
        lock(&self.state).unbrowsable.insert(share.to_string());
    }

    /// Graceful unmount fails, forced unmount works.
    pub fn mark_busy(&self, mount_point: impl Into<PathBuf>) {
        lock(&self.state).busy.insert(mount_point.into());
    }

    /// Neither graceful nor forced unmount works.
    pub fn mark_stuck(&self, mount_point: impl Into<PathBuf>) {
        lock(&self.state).stuck.insert(mount_point.into());
    }

    pub fn mount_points(&self) -> Vec<PathBuf> {
        lock(&self.state)
            .mounts
            .iter()
            .map(|(_, path)| path.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }
}

#[async_trait]
impl RemoteAdapter for SimulatedAdapter {
    async fn list_shares(&self, host: &str, auth: &ListingAuth) -> Result<String, ListingError> {
        let mut state = lock(&self.state);
        let username = match auth {
            ListingAuth::User { username, .. } => Some(username.clone()),
            ListingAuth::Guest => None,
        };
        state.calls.push(format!(
            "list {} {}",
            host,
            username.as_deref().unwrap_or("guest")
        ));

        match state.listings.get(&(host.to_string(), username)) {
            Some(result) => result.clone(),
            None => state.fallback_listing.clone().ok_or_else(|| {
                ListingError::AuthRejected("no scripted listing".to_string())
            }),
        }
    }

    async fn mount_table(&self) -> Result<String, String> {
        let state = lock(&self.state);
        Ok(state
            .mounts
            .iter()
            .map(|(source, path)| {
                format!("{} on {} (smbfs, nodev, nosuid)\n", source, path.display())
            })
            .collect())
    }

    async fn mount(
        &self,
        share: &Share,
        auth: &MountAuth,
        mount_point: &Path,
    ) -> Result<(), String> {
        let mut state = lock(&self.state);
        state.calls.push(format!("mount {}/{}", share.host, share.name));

        if state.failing_mounts.contains(&share.name) {
            return Err(format!("mount of {} refused", share.name));
        }
        if state.mounts.iter().any(|(_, path)| path == mount_point) {
            return Err(format!("{} is already in use", mount_point.display()));
        }
        state.mounts.push((
            format!("//{}@{}/{}", auth.username, share.host, share.name),
            mount_point.to_path_buf(),
        ));
        Ok(())
    }

    async fn unmount(&self, mount_point: &Path, force: bool) -> Result<(), String> {
        let mut state = lock(&self.state);
        state.calls.push(format!(
            "unmount{} {}",
            if force { " -f" } else { "" },
            mount_point.display()
        ));

        if state.stuck.contains(mount_point) || (!force && state.busy.contains(mount_point)) {
            return Err("resource busy".to_string());
        }
        let before = state.mounts.len();
        state.mounts.retain(|(_, path)| path != mount_point);
        if state.mounts.len() == before {
            return Err("not currently mounted".to_string());
        }
        Ok(())
    }

    async fn probe(&self, mount_point: &Path) -> Result<(), String> {
        let state = lock(&self.state);
        let name = mount_point
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if state.unbrowsable.contains(&name) {
            return Err("operation not permitted".to_string());
        }
        if !state.mounts.iter().any(|(_, path)| path == mount_point) {
            return Err("not mounted".to_string());
        }
        Ok(())
    }
}
