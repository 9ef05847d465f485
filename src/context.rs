use std::sync::Arc;

use tokio_rusqlite::Connection;

use crate::config::AppConfig;
use crate::core::connector::{ConnectorOptions, ShareConnector};
use crate::core::diagnostics::Diagnostics;
use crate::core::mount::{ConflictGroups, MountCoordinator, MountOptions};
use crate::core::queue::{JobQueue, QueueOptions};
use crate::core::remote::RemoteAdapter;
use crate::core::secrets::{MemorySecretStore, SecretStore};
use crate::core::session::RemoteSession;
use crate::core::transfer_engine::create_engine;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub db: Connection,
    pub queue: JobQueue,
    pub session: Arc<RemoteSession>,
}

impl AppContext {
    /// Wires the queue and the remote session from `config`. Must run inside
    /// a tokio runtime.
    pub fn new(config: AppConfig, db: Connection, adapter: Arc<dyn RemoteAdapter>) -> Self {
        let engine = create_engine(
            config.effective_engine(),
            &config.rsync_path,
            config.grace_period(),
        );
        let queue = JobQueue::new(
            engine,
            QueueOptions {
                log_directory: config.log_directory.clone(),
                enforce_read_only_sources: config.enforce_read_only_sources,
            },
        );

        let connector = ShareConnector::new(
            adapter.clone(),
            ConnectorOptions {
                backoff: config.connect_backoff(),
                max_attempts: config.connect_attempts.max(1),
            },
        );
        let mounts = MountCoordinator::new(
            adapter,
            MountOptions {
                mount_root: config.mount_root.clone(),
                conflict_groups: ConflictGroups::new(config.conflict_groups.clone()),
                settle_delay: config.mount_settle_delay(),
            },
        );
        let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
        let session = RemoteSession::new(
            connector,
            mounts,
            Diagnostics::new(config.diagnostic_tools.clone()),
            secrets,
            config.run_diagnostics,
        );

        Self {
            config: Arc::new(config),
            db,
            queue,
            session: Arc::new(session),
        }
    }
}
