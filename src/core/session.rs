use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::connector::{Enumeration, ShareConnector, Strategy};
use super::diagnostics::{DiagnosticReport, Diagnostics};
use super::error::{ConnectError, MountError};
use super::models::Credential;
use super::mount::MountCoordinator;
use super::secrets::SecretStore;
use super::share::Share;

#[derive(Debug, Clone, Serialize)]
pub struct ConnectOutcome {
    pub host: String,
    pub strategy: Strategy,
    pub shares: Vec<Share>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<DiagnosticReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub host: Option<String>,
    pub shares: Vec<Share>,
    pub mounted: Vec<Share>,
}

/// The connect → enumerate → select → mount flow for one host at a time.
pub struct RemoteSession {
    connector: ShareConnector,
    mounts: MountCoordinator,
    diagnostics: Diagnostics,
    secrets: Arc<dyn SecretStore>,
    run_diagnostics: bool,
    active: Mutex<Option<Enumeration>>,
}

impl RemoteSession {
    pub fn new(
        connector: ShareConnector,
        mounts: MountCoordinator,
        diagnostics: Diagnostics,
        secrets: Arc<dyn SecretStore>,
        run_diagnostics: bool,
    ) -> Self {
        Self {
            connector,
            mounts,
            diagnostics,
            secrets,
            run_diagnostics,
            active: Mutex::new(None),
        }
    }

    pub async fn connect(
        &self,
        host: &str,
        mut credential: Credential,
    ) -> Result<ConnectOutcome, ConnectError> {
        let diagnostics = if self.run_diagnostics {
            Some(self.diagnostics.run(host).await)
        } else {
            None
        };

        if credential.secret.is_empty() && !credential.username.is_empty() {
            match self.secrets.retrieve(&credential.username, host) {
                Ok(secret) => {
                    debug!(host, account = %credential.username, "Using stored secret");
                    credential.secret = secret;
                }
                Err(e) => debug!(host, error = %e, "No stored secret"),
            }
        }

        let enumeration = self.connector.enumerate(host, &credential).await?;

        if credential.persist && enumeration.strategy != Strategy::Guest {
            if let Err(e) = self
                .secrets
                .save(&credential.username, host, &credential.secret)
            {
                warn!(host, error = %e, "Failed to store credentials");
            }
        }

        let outcome = ConnectOutcome {
            host: host.to_string(),
            strategy: enumeration.strategy,
            shares: enumeration.shares.clone(),
            diagnostics,
        };
        info!(host, shares = outcome.shares.len(), "Connected");
        *self.active.lock().await = Some(enumeration);
        Ok(outcome)
    }

    /// Mount the named shares of the connected host (all of them when `names`
    /// is empty).
    pub async fn mount(&self, names: &[String]) -> Result<Vec<PathBuf>, MountError> {
        let (shares, auth) = {
            let active = self.active.lock().await;
            let connection = active.as_ref().ok_or(MountError::NoCredentialsStored)?;

            let shares = if names.is_empty() {
                connection.shares.clone()
            } else {
                names
                    .iter()
                    .map(|name| {
                        connection
                            .shares
                            .iter()
                            .find(|s| &s.name == name)
                            .cloned()
                            .ok_or_else(|| MountError::UnknownShare(name.clone()))
                    })
                    .collect::<Result<Vec<_>, _>>()?
            };
            (shares, connection.auth.clone())
        };

        self.mounts.mount(&shares, &auth).await
    }

    /// Unmount everything this session mounted and forget the credentials.
    pub async fn disconnect(&self) -> Vec<MountError> {
        let shares = self.mounts.mounted_shares().await;
        let failures = self.mounts.unmount_all(&shares).await;
        *self.active.lock().await = None;
        failures
    }

    pub async fn diagnose(&self, host: &str) -> DiagnosticReport {
        self.diagnostics.run(host).await
    }

    pub async fn status(&self) -> SessionStatus {
        let (host, shares) = match self.active.lock().await.as_ref() {
            Some(connection) => (Some(connection.host.clone()), connection.shares.clone()),
            None => (None, Vec::new()),
        };
        SessionStatus {
            host,
            shares,
            mounted: self.mounts.mounted_shares().await,
        }
    }
}
