pub mod rsync;
pub mod simulated;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::TransferError;
use super::models::Job;
use super::subprocess::SubprocessRunner;

pub use rsync::{CopyOperation, IGNORABLE_EXIT_CODES, RsyncEngine};
pub use simulated::SimulatedEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransferEngineType {
    #[default]
    Rsync,
    Simulated,
}

/// Read-only copy of a job's inputs handed to an engine.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub job_id: Uuid,
    pub sources: Vec<PathBuf>,
    pub destination: PathBuf,
    pub tool_args: Vec<String>,
    pub host: String,
    pub created_at: DateTime<Utc>,
    pub log_path: PathBuf,
}

impl From<&Job> for TransferRequest {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            sources: job.inputs.sources.clone(),
            destination: job.inputs.destination.clone(),
            tool_args: job.inputs.tool_args.clone(),
            host: job.inputs.host.clone(),
            created_at: job.created_at,
            log_path: job.log_path.clone(),
        }
    }
}

/// Executes one transfer. Progress fractions go to `progress`; the returned
/// future resolves once with the terminal result and drops the sender, so the
/// result always follows the last progress value.
pub trait TransferEngine: Send + Sync {
    fn transfer(
        &self,
        req: &TransferRequest,
        cancel: CancellationToken,
        progress: mpsc::UnboundedSender<f64>,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransferError>> + Send>>;
}

pub fn create_engine(
    engine_type: TransferEngineType,
    rsync_path: &str,
    grace_period: Duration,
) -> Arc<dyn TransferEngine> {
    match engine_type {
        TransferEngineType::Rsync => Arc::new(RsyncEngine::new(
            rsync_path,
            SubprocessRunner::new(grace_period),
        )),
        TransferEngineType::Simulated => Arc::new(SimulatedEngine::default()),
    }
}

/// Folds per-source fractions into one non-decreasing job fraction.
#[derive(Debug)]
pub struct ProgressAggregator {
    sources: usize,
    current: usize,
    last: f64,
}

impl ProgressAggregator {
    pub fn new(sources: usize) -> Self {
        Self {
            sources: sources.max(1),
            current: 0,
            last: 0.0,
        }
    }

    pub fn begin_source(&mut self, index: usize) {
        self.current = index.min(self.sources - 1);
    }

    /// Returns the overall fraction when it moved forward.
    pub fn update(&mut self, fraction: f64) -> Option<f64> {
        let overall =
            ((self.current as f64 + fraction.clamp(0.0, 1.0)) / self.sources as f64).min(1.0);
        if overall > self.last {
            self.last = overall;
            Some(overall)
        } else {
            None
        }
    }
}
