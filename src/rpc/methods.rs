//! RPC method dispatch.
//!
//! Handlers return `Result<T, MethodError>`; [`MethodHandler::handle`] turns
//! that into a response.

use std::path::PathBuf;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::AppContext;
use crate::core::diagnostics::DiagnosticReport;
use crate::core::error::{MountError, QueueError};
use crate::core::models::{Credential, Job, JobInputs, JobState};
use crate::core::session::{ConnectOutcome, SessionStatus};
use crate::db;

use super::protocol::{ErrorCode, Request, Response};

#[derive(Debug)]
pub struct MethodError {
    code: ErrorCode,
    message: String,
}

impl MethodError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<QueueError> for MethodError {
    fn from(error: QueueError) -> Self {
        let code = match error {
            QueueError::NotFound(_) => ErrorCode::JobNotFound,
            _ => ErrorCode::InvalidOperation,
        };
        Self::new(code, error.to_string())
    }
}

impl From<MountError> for MethodError {
    fn from(error: MountError) -> Self {
        let code = match error {
            MountError::UnknownShare(_) => ErrorCode::InvalidParams,
            _ => ErrorCode::RemoteFailure,
        };
        Self::new(code, error.to_string())
    }
}

type MethodResult<T> = Result<T, MethodError>;

fn respond<T: Serialize>(id: Value, result: MethodResult<T>) -> Response {
    match result {
        Ok(value) => Response::ok(id, value),
        Err(e) => Response::fail(id, e.code, e.message),
    }
}

#[derive(Serialize)]
struct DaemonStatus {
    version: &'static str,
    uptime_secs: u64,
    rpc_bind: String,
    simulation: bool,
    jobs: usize,
    pending: usize,
    running: Option<Job>,
    session: SessionStatus,
}

#[derive(Serialize)]
struct JobDetail {
    #[serde(flatten)]
    job: Job,
    status_message: String,
    history: Vec<db::jobs::StatusEntry>,
}

#[derive(Serialize)]
struct CancelOutcome {
    id: Uuid,
    state: JobState,
}

#[derive(Debug, Deserialize)]
struct JobId {
    id: Uuid,
}

#[derive(Deserialize, Default)]
struct ListParams {
    #[serde(default)]
    state: Option<JobState>,
}

#[derive(Deserialize)]
struct SubmitParams {
    sources: Vec<PathBuf>,
    destination: PathBuf,
    #[serde(default)]
    tool_args: Option<Vec<String>>,
    #[serde(default)]
    host: Option<String>,
}

#[derive(Deserialize)]
struct ReorderParams {
    from: Vec<usize>,
    to: usize,
}

#[derive(Deserialize)]
struct ConnectParams {
    host: String,
    #[serde(flatten)]
    credential: Credential,
}

#[derive(Deserialize, Default)]
struct MountParams {
    #[serde(default)]
    shares: Vec<String>,
}

#[derive(Deserialize)]
struct HostParams {
    host: String,
}

pub struct MethodHandler {
    ctx: AppContext,
    start_time: Instant,
}

impl MethodHandler {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            start_time: Instant::now(),
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);

        match request.method.as_str() {
            "daemon.status" => respond(id, Ok(self.daemon_status().await)),
            "jobs.list" => respond(id, self.jobs_list(params)),
            "jobs.get" => respond(id, self.jobs_get(params).await),
            "jobs.submit" => respond(id, self.jobs_submit(params)),
            "jobs.cancel" => respond(id, self.jobs_cancel(params)),
            "jobs.retry" => respond(id, self.jobs_retry(params)),
            "jobs.reorder" => respond(id, self.jobs_reorder(params)),
            "jobs.prune" => respond(id, Ok(self.ctx.queue.prune_finished())),
            "remote.connect" => respond(id, self.remote_connect(params).await),
            "remote.mount" => respond(id, self.remote_mount(params).await),
            "remote.disconnect" => respond(id, Ok(self.remote_disconnect().await)),
            "remote.diagnose" => respond(id, self.remote_diagnose(params).await),
            other => Response::fail(
                id,
                ErrorCode::MethodNotFound,
                format!("Method not found: {}", other),
            ),
        }
    }

    async fn daemon_status(&self) -> DaemonStatus {
        let jobs = self.ctx.queue.snapshot();
        DaemonStatus {
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: self.start_time.elapsed().as_secs(),
            rpc_bind: self.ctx.config.rpc_bind.to_string(),
            simulation: self.ctx.config.simulation,
            jobs: jobs.len(),
            pending: jobs.iter().filter(|j| j.state == JobState::Pending).count(),
            running: self.ctx.queue.running(),
            session: self.ctx.session.status().await,
        }
    }

    fn jobs_list(&self, params: Value) -> MethodResult<Vec<Job>> {
        let ListParams { state } = parse_optional(params)?;
        Ok(self
            .ctx
            .queue
            .snapshot()
            .into_iter()
            .filter(|job| state.is_none_or(|state| job.state == state))
            .collect())
    }

    async fn jobs_get(&self, params: Value) -> MethodResult<JobDetail> {
        let JobId { id } = parse(params)?;
        let job = self.ctx.queue.get(id).ok_or(QueueError::NotFound(id))?;
        let history = db::jobs::history(&self.ctx.db, id)
            .await
            .map_err(|e| MethodError::new(ErrorCode::Internal, e.to_string()))?;

        Ok(JobDetail {
            status_message: job.status_message(),
            job,
            history,
        })
    }

    /// Jobs submitted without `tool_args` get the configured defaults.
    fn jobs_submit(&self, params: Value) -> MethodResult<Job> {
        let params: SubmitParams = parse(params)?;
        let inputs = JobInputs {
            sources: params.sources,
            destination: params.destination,
            tool_args: params
                .tool_args
                .unwrap_or_else(|| self.ctx.config.rsync_args.clone()),
            host: params.host.unwrap_or_default(),
        };
        Ok(self.ctx.queue.submit(inputs)?)
    }

    fn jobs_cancel(&self, params: Value) -> MethodResult<CancelOutcome> {
        let JobId { id } = parse(params)?;
        let state = self.ctx.queue.cancel(id)?;
        Ok(CancelOutcome { id, state })
    }

    fn jobs_retry(&self, params: Value) -> MethodResult<Job> {
        let JobId { id } = parse(params)?;
        Ok(self.ctx.queue.retry(id)?)
    }

    fn jobs_reorder(&self, params: Value) -> MethodResult<Vec<Uuid>> {
        let ReorderParams { from, to } = parse(params)?;
        Ok(self.ctx.queue.reorder(&from, to)?)
    }

    async fn remote_connect(&self, params: Value) -> MethodResult<ConnectOutcome> {
        let ConnectParams { host, credential } = parse(params)?;
        self.ctx
            .session
            .connect(&host, credential)
            .await
            .map_err(|e| MethodError::new(ErrorCode::RemoteFailure, e.to_string()))
    }

    async fn remote_mount(&self, params: Value) -> MethodResult<Vec<PathBuf>> {
        let MountParams { shares } = parse_optional(params)?;
        Ok(self.ctx.session.mount(&shares).await?)
    }

    /// Unmount failures are reported in the result; disconnect itself never fails.
    async fn remote_disconnect(&self) -> Vec<String> {
        self.ctx
            .session
            .disconnect()
            .await
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    async fn remote_diagnose(&self, params: Value) -> MethodResult<DiagnosticReport> {
        let HostParams { host } = parse(params)?;
        Ok(self.ctx.session.diagnose(&host).await)
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> MethodResult<T> {
    serde_json::from_value(params)
        .map_err(|e| MethodError::new(ErrorCode::InvalidParams, e.to_string()))
}

/// Like [`parse`], but missing params mean "all defaults".
fn parse_optional<T: DeserializeOwned + Default>(params: Value) -> MethodResult<T> {
    match params {
        Value::Null => Ok(T::default()),
        other => parse(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_errors_map_to_codes() {
        let id = Uuid::now_v7();
        assert_eq!(
            MethodError::from(QueueError::NotFound(id)).code,
            ErrorCode::JobNotFound
        );
        assert_eq!(
            MethodError::from(QueueError::InvalidPosition(4)).code,
            ErrorCode::InvalidOperation
        );
    }

    #[test]
    fn unknown_share_is_a_parameter_error() {
        let error = MethodError::from(MountError::UnknownShare("media".to_string()));
        assert_eq!(error.code, ErrorCode::InvalidParams);
        assert_eq!(
            MethodError::from(MountError::NoCredentialsStored).code,
            ErrorCode::RemoteFailure
        );
    }

    #[test]
    fn missing_params_use_defaults() {
        let params: MountParams = parse_optional(Value::Null).unwrap();
        assert!(params.shares.is_empty());

        let err = parse::<JobId>(Value::Null).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams);
    }
}
