use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::models::JobState;

/// Failures of the subprocess runner itself (not of the program it ran).
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {after:?}")]
    TimedOut { program: String, after: Duration },

    #[error("i/o error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Terminal failures of a copy operation.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer tool could not be started: {0}")]
    Launch(String),

    #[error("cancelled by user")]
    Cancelled,

    #[error("transfer tool exited with code {code}: {message}")]
    ToolFailure { code: i32, message: String },

    #[error("could not create job log {path}: {source}")]
    LogCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error during transfer: {0}")]
    Io(String),
}

/// Failure of one share listing attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ListingError {
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("share listing timed out")]
    TimedOut,

    #[error("share listing tool could not be started: {0}")]
    Launch(String),

    #[error("share listing failed: {0}")]
    Tool(String),
}

impl ListingError {
    /// Whether trying another strategy could still succeed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ListingError::Launch(_))
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("could not enumerate shares on {host}: {last}")]
    Enumeration { host: String, last: ListingError },

    #[error("no connection strategy is applicable to {0}")]
    NoStrategy(String),
}

#[derive(Debug, Error)]
pub enum MountError {
    #[error("failed to mount share {share}: {reason}")]
    MountFailure { share: String, reason: String },

    #[error("failed to unmount {path}: {reason}")]
    UnmountFailure { path: PathBuf, reason: String },

    #[error("no credentials stored for this session; connect first")]
    NoCredentialsStored,

    #[error("share {0} was not found on the connected host")]
    UnknownShare(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(uuid::Uuid),

    #[error("cannot {action} job {id} while it is {state}")]
    InvalidTransition {
        id: uuid::Uuid,
        state: JobState,
        action: &'static str,
    },

    #[error("queue position {0} is out of range")]
    InvalidPosition(usize),

    #[error("a job needs at least one source directory")]
    NoSources,

    #[error("argument {0} would modify the source share")]
    WriteFlagRejected(String),
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("no secret stored for {account}@{host}")]
    NotFound { account: String, host: String },
}
