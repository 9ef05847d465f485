use std::fs::{DirBuilder, File, OpenOptions};
use std::future::Future;
use std::io::{LineWriter, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::core::error::{RunError, TransferError};
use crate::core::progress::parse_progress;
use crate::core::subprocess::{CommandSpec, OutputStream, SubprocessRunner};
use crate::core::transfer_engine::{
    ProgressAggregator, TransferEngine, TransferRequest,
};
use crate::logging::LogThrottle;

/// Exit codes that mean "finished, but some files could not be transferred"
/// (23: partial transfer due to error, 24: source files vanished).
pub const IGNORABLE_EXIT_CODES: &[i32] = &[23, 24];

const LOG_SEPARATOR: &str = "----------------------------------------";

/// Only the end of the tool's error output is kept for the failure message.
const STDERR_TAIL_BYTES: usize = 4096;

/// Drives an rsync-compatible copy tool, one [`CopyOperation`] per job.
pub struct RsyncEngine {
    tool: String,
    runner: SubprocessRunner,
}

impl RsyncEngine {
    pub fn new(tool: impl Into<String>, runner: SubprocessRunner) -> Self {
        Self {
            tool: tool.into(),
            runner,
        }
    }
}

impl TransferEngine for RsyncEngine {
    fn transfer(
        &self,
        req: &TransferRequest,
        cancel: CancellationToken,
        progress: mpsc::UnboundedSender<f64>,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransferError>> + Send>> {
        let operation = CopyOperation::new(req.clone(), self.tool.clone(), self.runner.clone());
        Box::pin(operation.execute(cancel, progress))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyState {
    Created,
    Running,
    Succeeded,
    Cancelled,
    Failed,
}

impl CopyState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            CopyState::Succeeded | CopyState::Cancelled | CopyState::Failed
        )
    }
}

/// One execution of the copy tool over every source of a job.
pub struct CopyOperation {
    request: TransferRequest,
    tool: String,
    runner: SubprocessRunner,
    state: CopyState,
}

impl CopyOperation {
    pub fn new(request: TransferRequest, tool: impl Into<String>, runner: SubprocessRunner) -> Self {
        Self {
            request,
            tool: tool.into(),
            runner,
            state: CopyState::Created,
        }
    }

    fn transition(&mut self, next: CopyState) {
        if self.state.is_terminal() {
            warn!(from = ?self.state, to = ?next, "Ignoring transition out of terminal copy state");
            return;
        }
        self.state = next;
    }

    /// Run every source in order and resolve with the terminal result.
    pub async fn execute(
        mut self,
        cancel: CancellationToken,
        progress: mpsc::UnboundedSender<f64>,
    ) -> Result<(), TransferError> {
        let span = info_span!("copy_operation", job_id = %self.request.job_id);

        async move {
            let result = self.run_sources(&cancel, &progress).await;
            self.transition(match &result {
                Ok(()) => CopyState::Succeeded,
                Err(TransferError::Cancelled) => CopyState::Cancelled,
                Err(_) => CopyState::Failed,
            });
            match &result {
                Ok(()) => info!("Copy operation succeeded"),
                Err(TransferError::Cancelled) => info!("Copy operation cancelled"),
                Err(e) => warn!(error = %e, "Copy operation failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_sources(
        &mut self,
        cancel: &CancellationToken,
        progress: &mpsc::UnboundedSender<f64>,
    ) -> Result<(), TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        self.transition(CopyState::Running);

        let mut log = JobLog::create(&self.request.log_path)?;
        log.write_header(&self.request);

        let mut aggregate = ProgressAggregator::new(self.request.sources.len());
        let mut throttle = LogThrottle::new(Duration::from_secs(1));

        for (index, source) in self.request.sources.iter().enumerate() {
            if cancel.is_cancelled() {
                log.append(&format!("Cancelled before source {}", source.display()));
                return Err(TransferError::Cancelled);
            }
            aggregate.begin_source(index);
            throttle.reset();

            let spec = CommandSpec::new(&self.tool)
                .args(self.request.tool_args.iter().cloned())
                .arg(with_trailing_slash(source))
                .arg(self.request.destination.to_string_lossy());

            info!(
                source = %source.display(),
                destination = %self.request.destination.display(),
                "Starting copy tool"
            );

            let mut stderr_tail = StderrTail::new(STDERR_TAIL_BYTES);
            let exit = self
                .runner
                .run(&spec, cancel, |line| {
                    log.append(&line.text);
                    if line.stream == OutputStream::Stderr {
                        stderr_tail.push(&line.text);
                    }
                    if let Some(fraction) = parse_progress(&line.text) {
                        if let Some(overall) = aggregate.update(fraction) {
                            let _ = progress.send(overall);
                            if throttle.should_log() {
                                debug!(progress = overall, "Transfer progress");
                            }
                        }
                    }
                })
                .await
                .map_err(|e| match e {
                    RunError::Launch { .. } => TransferError::Launch(e.to_string()),
                    other => TransferError::Io(other.to_string()),
                })?;

            log.append(&format!(
                "Source {} finished with exit code {}",
                source.display(),
                exit.code
            ));

            if exit.cancelled {
                return Err(TransferError::Cancelled);
            }
            classify_exit(exit.code, stderr_tail.as_str())?;
        }

        log.append(&format!("Finished: {}", Utc::now().to_rfc3339()));
        Ok(())
    }
}

/// Map a copy tool exit code to a per-source result.
pub fn classify_exit(code: i32, stderr: &str) -> Result<(), TransferError> {
    if code == 0 {
        return Ok(());
    }
    if IGNORABLE_EXIT_CODES.contains(&code) {
        warn!(exit_code = code, "Copy tool reported ignorable warnings");
        return Ok(());
    }
    let message = match stderr.trim() {
        "" => "no error output".to_string(),
        text => text.to_string(),
    };
    Err(TransferError::ToolFailure { code, message })
}

/// The last `limit` bytes of newline-joined stderr lines.
struct StderrTail {
    text: String,
    limit: usize,
}

impl StderrTail {
    fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
        }
    }

    fn push(&mut self, line: &str) {
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(line);

        if self.text.len() > self.limit {
            let mut cut = self.text.len() - self.limit;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
        }
    }

    fn as_str(&self) -> &str {
        &self.text
    }
}

/// The tool copies directory contents only when the source ends with `/`.
fn with_trailing_slash(source: &Path) -> String {
    let mut path = source.to_string_lossy().into_owned();
    if !path.ends_with('/') {
        path.push('/');
    }
    path
}

/// Append-only per-job log file.
struct JobLog {
    writer: LineWriter<File>,
    broken: bool,
}

impl JobLog {
    fn create(path: &Path) -> Result<Self, TransferError> {
        let log_error = |source| TransferError::LogCreation {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)
                .map_err(log_error)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(path)
            .map_err(log_error)?;

        Ok(Self {
            writer: LineWriter::new(file),
            broken: false,
        })
    }

    fn write_header(&mut self, req: &TransferRequest) {
        let sources = req
            .sources
            .iter()
            .map(|s| s.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        self.append(&format!("Job ID: {}", req.job_id));
        self.append(&format!("Created: {}", req.created_at.to_rfc3339()));
        self.append(&format!("Started: {}", Utc::now().to_rfc3339()));
        self.append(&format!("Server: {}", req.host));
        self.append(&format!("Sources: {}", sources));
        self.append(&format!("Destination: {}", req.destination.display()));
        self.append(&format!("Args: {}", req.tool_args.join(" ")));
        self.append(LOG_SEPARATOR);
    }

    fn append(&mut self, line: &str) {
        if self.broken {
            return;
        }
        if let Err(e) = writeln!(self.writer, "{}", line) {
            warn!(error = %e, "Failed to write job log, further output is dropped");
            self.broken = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_classification() {
        assert!(classify_exit(0, "").is_ok());
        assert!(classify_exit(23, "some files vanished").is_ok());
        assert!(classify_exit(24, "").is_ok());

        match classify_exit(1, "rsync: syntax error\n") {
            Err(TransferError::ToolFailure { code, message }) => {
                assert_eq!(code, 1);
                assert_eq!(message, "rsync: syntax error");
            }
            other => panic!("expected tool failure, got {:?}", other),
        }
    }

    #[test]
    fn stderr_tail_keeps_the_last_bytes() {
        let mut tail = StderrTail::new(20);
        tail.push("first");
        tail.push("second line");
        assert_eq!(tail.as_str(), "first\nsecond line");
        tail.push("third");
        assert_eq!(tail.as_str(), "st\nsecond line\nthird");

        let mut wide = StderrTail::new(5);
        wide.push("ééé");
        assert_eq!(wide.as_str(), "éé");
    }

    #[test]
    fn terminal_copy_state_is_final() {
        let request = TransferRequest {
            job_id: uuid::Uuid::now_v7(),
            sources: vec!["/src/a".into()],
            destination: "/dest".into(),
            tool_args: Vec::new(),
            host: String::new(),
            created_at: Utc::now(),
            log_path: "/tmp/unused.log".into(),
        };
        let mut operation = CopyOperation::new(request, "rsync", SubprocessRunner::default());
        assert_eq!(operation.state, CopyState::Created);

        operation.transition(CopyState::Running);
        operation.transition(CopyState::Cancelled);
        operation.transition(CopyState::Failed);
        assert_eq!(operation.state, CopyState::Cancelled);
    }

    #[test]
    fn trailing_slash_is_added_once() {
        assert_eq!(with_trailing_slash(Path::new("/Volumes/share/dir")), "/Volumes/share/dir/");
        assert_eq!(with_trailing_slash(Path::new("/Volumes/share/dir/")), "/Volumes/share/dir/");
    }
}
