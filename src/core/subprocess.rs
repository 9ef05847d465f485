//! Running external commands.
//!
//! Two entry points:
//! - [`SubprocessRunner::run`] streams stdout and stderr line by line while the
//!   process runs and supports cooperative cancellation with signal escalation.
//! - [`run_with_timeout`] captures the full output of a short-lived command and
//!   kills it when a deadline elapses.
//!
//! Every child is started in its own process group so that signals reach the
//! whole tree (the copy tool forks helpers that would otherwise keep the output
//! pipes open).

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::RunError;

/// Default time a process gets to react to a signal before the next one is sent.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One completed line of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Program, arguments, extra environment and optional stdin payload.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        command
    }

    fn spawn(&self) -> Result<Child, RunError> {
        let mut child = self.command().spawn().map_err(|source| RunError::Launch {
            program: self.program.clone(),
            source,
        })?;

        // Written from a separate task: a child that never reads stdin must not block us.
        if let (Some(bytes), Some(mut stdin)) = (self.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&bytes).await {
                    debug!(error = %e, "Child closed stdin early");
                }
            });
        }

        Ok(child)
    }
}

/// How a streamed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, or `128 + signal` when the process was killed by a signal.
    pub code: i32,
    /// Whether cancellation was requested while the process ran.
    pub cancelled: bool,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Full output of a command run through [`run_with_timeout`].
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Streams process output and escalates signals on cancellation.
#[derive(Debug, Clone)]
pub struct SubprocessRunner {
    grace_period: Duration,
}

impl Default for SubprocessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl SubprocessRunner {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    /// Run a command to completion, calling `on_line` for every line of either
    /// stream in arrival order.
    ///
    /// When `cancel` fires the process group receives SIGINT, then SIGTERM and
    /// finally SIGKILL, one grace period apart. This function only returns once
    /// the process has actually exited.
    pub async fn run<F>(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
        mut on_line: F,
    ) -> Result<ProcessExit, RunError>
    where
        F: FnMut(OutputLine),
    {
        let mut child = spec.spawn()?;
        let pid = child.id();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_lines(
                stdout,
                OutputStream::Stdout,
                tx.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_lines(
                stderr,
                OutputStream::Stderr,
                tx.clone(),
            )));
        }
        drop(tx);

        let exited = CancellationToken::new();
        let mut cancelled = false;
        let mut status = None;
        let mut output_open = true;

        // The leader exiting is not enough: helpers it forked stay in the group
        // and hold the output pipes open. Escalation keeps running until both
        // pipes close.
        let status = loop {
            if !output_open && let Some(status) = status.take() {
                break status;
            }
            tokio::select! {
                line = rx.recv(), if output_open => match line {
                    Some(line) => on_line(line),
                    None => output_open = false,
                },
                result = child.wait(), if status.is_none() => {
                    status = Some(result.map_err(|source| RunError::Io {
                        program: spec.program.clone(),
                        source,
                    })?);
                }
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    match pid {
                        Some(pid) => {
                            debug!(pid, program = %spec.program, "Cancellation requested, escalating");
                            tokio::spawn(escalate(pid, self.grace_period, exited.clone()));
                        }
                        None => debug!(program = %spec.program, "Cancellation requested after exit"),
                    }
                }
            }
        };
        exited.cancel();

        for reader in readers {
            match reader.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(program = %spec.program, error = %e, "Failed reading process output"),
                Err(e) => warn!(program = %spec.program, error = %e, "Output reader task failed"),
            }
        }

        Ok(ProcessExit {
            code: exit_code(status),
            cancelled,
        })
    }
}

/// Run a short-lived command and capture its output, killing it after `limit`.
pub async fn run_with_timeout(
    spec: &CommandSpec,
    limit: Duration,
) -> Result<CapturedOutput, RunError> {
    let child = spec.spawn()?;
    let pid = child.id();

    match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(CapturedOutput {
            code: exit_code(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(source)) => Err(RunError::Io {
            program: spec.program.clone(),
            source,
        }),
        Err(_) => {
            if let Some(pid) = pid {
                signal_group(pid, Signal::SIGKILL);
            }
            warn!(program = %spec.program, ?limit, "Command timed out");
            Err(RunError::TimedOut {
                program: spec.program.clone(),
                after: limit,
            })
        }
    }
}

async fn escalate(pid: u32, grace: Duration, exited: CancellationToken) {
    for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGKILL] {
        if exited.is_cancelled() || !signal_group(pid, signal) {
            return;
        }
        if signal == Signal::SIGKILL {
            return;
        }
        tokio::select! {
            _ = exited.cancelled() => return,
            _ = tokio::time::sleep(grace) => {}
        }
    }
}

/// Returns false once the group no longer exists.
fn signal_group(pid: u32, signal: Signal) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => {
            debug!(pid, ?signal, "Signalled process group");
            true
        }
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pid, ?signal, error = %e, "Failed to signal process group");
            true
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

/// Split a byte stream on `\r` or `\n`; the copy tool redraws progress with bare `\r`.
async fn read_lines<R>(
    mut reader: R,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<OutputLine>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut pending = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        for &b in &chunk[..n] {
            if b == b'\r' || b == b'\n' {
                if !pending.is_empty() {
                    let text = String::from_utf8_lossy(&pending).into_owned();
                    pending.clear();
                    let _ = tx.send(OutputLine { stream, text });
                }
            } else {
                pending.push(b);
            }
        }
    }

    if !pending.is_empty() {
        let text = String::from_utf8_lossy(&pending).into_owned();
        let _ = tx.send(OutputLine { stream, text });
    }
    Ok(())
}
