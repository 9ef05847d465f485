use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::core::diagnostics::DiagnosticTools;
use crate::core::transfer_engine::TransferEngineType;

const CONFIG_PATH_VAR: &str = "SHARESYNC_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "sharesync.toml";
const ENV_PREFIX: &str = "SHARESYNC_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory under which remote shares are mounted.
    pub mount_root: PathBuf,
    /// Per-job transfer logs are written here as `<job id>.log`.
    pub log_directory: PathBuf,
    pub database_path: PathBuf,
    pub transfer_engine: TransferEngineType,
    pub rsync_path: String,
    /// Used for submitted jobs that bring no arguments of their own.
    pub rsync_args: Vec<String>,
    pub share_tool: String,
    /// Hosts that are the same server under different names. Mounting from
    /// one unmounts the others first.
    pub conflict_groups: Vec<Vec<String>>,
    pub grace_period_ms: u64,
    pub connect_backoff_ms: u64,
    pub connect_attempts: usize,
    pub mount_settle_ms: u64,
    pub rpc_bind: SocketAddr,
    pub enforce_read_only_sources: bool,
    pub run_diagnostics: bool,
    pub diagnostic_tools: DiagnosticTools,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/Volumes"),
            log_directory: PathBuf::from("logs"),
            database_path: PathBuf::from("sharesync.db"),
            transfer_engine: TransferEngineType::Rsync,
            rsync_path: "rsync".to_string(),
            rsync_args: vec![
                "-a".to_string(),
                "--partial".to_string(),
                "--info=progress2".to_string(),
            ],
            share_tool: "smbutil".to_string(),
            conflict_groups: Vec::new(),
            grace_period_ms: 5000,
            connect_backoff_ms: 2000,
            connect_attempts: 3,
            mount_settle_ms: 1500,
            rpc_bind: SocketAddr::from(([127, 0, 0, 1], 7420)),
            enforce_read_only_sources: true,
            run_diagnostics: true,
            diagnostic_tools: DiagnosticTools::default(),
            simulation: false,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Defaults, then the TOML file, then `SHARESYNC_*` variables, then CLI
    /// arguments (fields left unset by the caller are skipped).
    pub fn new<T: Serialize>(cli_args: Option<&T>) -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::figment(&path, cli_args).extract().map_err(Into::into)
    }

    fn figment<T: Serialize>(path: &str, cli_args: Option<&T>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]));

        if let Some(args) = cli_args {
            figment = figment.merge(Serialized::defaults(args));
        }
        figment
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn mount_settle_delay(&self) -> Duration {
        Duration::from_millis(self.mount_settle_ms)
    }

    /// The engine to use, taking `simulation` into account.
    pub fn effective_engine(&self) -> TransferEngineType {
        if self.simulation {
            TransferEngineType::Simulated
        } else {
            self.transfer_engine
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        verbose: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        mount_root: Option<String>,
    }

    #[test]
    fn defaults_without_file() {
        let config: AppConfig = AppConfig::figment("/nonexistent/sharesync.toml", None::<&()>)
            .extract()
            .unwrap();
        assert_eq!(config.mount_root, PathBuf::from("/Volumes"));
        assert_eq!(config.grace_period(), Duration::from_secs(5));
        assert_eq!(config.connect_attempts, 3);
        assert!(config.enforce_read_only_sources);
        assert_eq!(config.rpc_bind.port(), 7420);
    }

    #[test]
    fn file_then_cli_args() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "mount_root = \"/mnt/remote\"\nverbose = true\ntransfer_engine = \"simulated\"\nconflict_groups = [[\"nas\", \"nas.local\"]]"
        )
        .unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let args = Overrides {
            verbose: None,
            mount_root: Some("/srv/shares".to_string()),
        };
        let config: AppConfig = AppConfig::figment(&path, Some(&args)).extract().unwrap();

        assert_eq!(config.mount_root, PathBuf::from("/srv/shares"));
        assert!(config.verbose);
        assert_eq!(config.transfer_engine, TransferEngineType::Simulated);
        assert_eq!(config.conflict_groups, vec![vec!["nas", "nas.local"]]);
    }

    #[test]
    fn simulation_forces_simulated_engine() {
        let config = AppConfig {
            simulation: true,
            ..Default::default()
        };
        assert_eq!(config.effective_engine(), TransferEngineType::Simulated);
    }
}
