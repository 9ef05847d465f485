use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::core::error::{ListingError, RunError};
use crate::core::remote::{ListingAuth, MountAuth, RemoteAdapter, mount_url};
use crate::core::share::Share;
use crate::core::subprocess::{CapturedOutput, CommandSpec, run_with_timeout};

const LISTING_TIMEOUT: Duration = Duration::from_secs(30);
const MOUNT_TIMEOUT: Duration = Duration::from_secs(60);
const UNMOUNT_TIMEOUT: Duration = Duration::from_secs(30);
const MOUNT_TABLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shells out to `smbutil`, `osascript`, `umount` and `mount`.
pub struct SmbAdapter {
    share_tool: String,
}

impl SmbAdapter {
    pub fn new(share_tool: impl Into<String>) -> Self {
        Self {
            share_tool: share_tool.into(),
        }
    }

    fn listing_command(&self, host: &str, auth: &ListingAuth) -> CommandSpec {
        match auth {
            ListingAuth::User { username, secret } => CommandSpec::new(&self.share_tool)
                .arg("view")
                .arg(format!("//{}@{}", username, host))
                .stdin(format!("{}\n", secret)),
            ListingAuth::Guest => CommandSpec::new(&self.share_tool)
                .args(["view", "-G"])
                .arg(format!("//{}", host)),
        }
    }
}

impl Default for SmbAdapter {
    fn default() -> Self {
        Self::new("smbutil")
    }
}

#[async_trait]
impl RemoteAdapter for SmbAdapter {
    async fn list_shares(&self, host: &str, auth: &ListingAuth) -> Result<String, ListingError> {
        let spec = self.listing_command(host, auth);
        debug!(host, ?auth, "Running share listing");

        match run_with_timeout(&spec, LISTING_TIMEOUT).await {
            Ok(output) if output.success() => Ok(output.stdout),
            Ok(output) => Err(classify_listing_failure(&output)),
            Err(RunError::TimedOut { .. }) => Err(ListingError::TimedOut),
            Err(e @ RunError::Launch { .. }) => Err(ListingError::Launch(e.to_string())),
            Err(e) => Err(ListingError::Tool(e.to_string())),
        }
    }

    async fn mount_table(&self) -> Result<String, String> {
        let output = run_with_timeout(&CommandSpec::new("mount"), MOUNT_TABLE_TIMEOUT)
            .await
            .map_err(|e| e.to_string())?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(failure_text(&output))
        }
    }

    async fn mount(
        &self,
        share: &Share,
        auth: &MountAuth,
        _mount_point: &Path,
    ) -> Result<(), String> {
        let (url, _) = mount_url(share, auth)?;
        let spec = CommandSpec::new("osascript")
            .arg("-e")
            .arg(format!("mount volume \"{}\"", url));

        let output = run_with_timeout(&spec, MOUNT_TIMEOUT)
            .await
            .map_err(|e| e.to_string())?;
        if output.success() {
            Ok(())
        } else {
            Err(failure_text(&output))
        }
    }

    async fn unmount(&self, mount_point: &Path, force: bool) -> Result<(), String> {
        let mut spec = CommandSpec::new("umount");
        if force {
            spec = spec.arg("-f");
        }
        let spec = spec.arg(mount_point.to_string_lossy());

        let output = run_with_timeout(&spec, UNMOUNT_TIMEOUT)
            .await
            .map_err(|e| e.to_string())?;
        if output.success() {
            Ok(())
        } else {
            Err(failure_text(&output))
        }
    }

    async fn probe(&self, mount_point: &Path) -> Result<(), String> {
        let mut entries = tokio::fs::read_dir(mount_point)
            .await
            .map_err(|e| e.to_string())?;
        entries.next_entry().await.map_err(|e| e.to_string())?;
        Ok(())
    }
}

fn failure_text(output: &CapturedOutput) -> String {
    match output.stderr.trim() {
        "" => format!("exit code {}", output.code),
        text => text.to_string(),
    }
}

fn classify_listing_failure(output: &CapturedOutput) -> ListingError {
    let text = failure_text(output);
    let lower = text.to_lowercase();

    const AUTH_MARKERS: &[&str] = &[
        "authentication error",
        "rejected the authentication",
        "logon failure",
        "permission denied",
    ];
    const NETWORK_MARKERS: &[&str] = &[
        "no route to host",
        "host is down",
        "timed out",
        "connection refused",
        "unable to resolve",
        "could not resolve",
        "broken pipe",
    ];

    if AUTH_MARKERS.iter().any(|m| lower.contains(m)) {
        ListingError::AuthRejected(text)
    } else if NETWORK_MARKERS.iter().any(|m| lower.contains(m)) {
        ListingError::Unreachable(text)
    } else {
        ListingError::Tool(text)
    }
}
