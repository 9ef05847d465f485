use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    /// The only legal edges of the job state machine.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the user asked to copy. Never changes after submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInputs {
    pub sources: Vec<PathBuf>,
    pub destination: PathBuf,
    #[serde(default)]
    pub tool_args: Vec<String>,
    #[serde(default)]
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub inputs: JobInputs,
    pub created_at: DateTime<Utc>,
    pub state: JobState,
    pub progress: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub log_path: PathBuf,
}

impl Job {
    pub fn new(inputs: JobInputs, log_directory: &Path) -> Self {
        let id = Uuid::now_v7();
        Self {
            id,
            log_path: log_directory.join(format!("{}.log", id)),
            inputs,
            created_at: Utc::now(),
            state: JobState::Pending,
            progress: 0.0,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Human-readable summary of where the job stands.
    pub fn status_message(&self) -> String {
        match (self.state, &self.error) {
            (JobState::Pending, _) => "waiting to start".to_string(),
            (JobState::Running, _) => format!("copying ({:.0}%)", self.progress * 100.0),
            (JobState::Completed, _) => "completed successfully".to_string(),
            (JobState::Failed, Some(error)) => format!("failed: {}", error),
            (JobState::Failed, None) => "failed".to_string(),
            (JobState::Cancelled, Some(reason)) => format!("cancelled: {}", reason),
            (JobState::Cancelled, None) => "cancelled".to_string(),
        }
    }
}

/// Username/secret pair used against a remote host.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub persist: bool,
}

impl Credential {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
            persist: false,
        }
    }

    /// Username with any `DOMAIN\`, `DOMAIN/` or `DOMAIN;` prefix removed.
    pub fn normalized_username(&self) -> &str {
        match self.username.rfind(['\\', '/', ';']) {
            Some(idx) => &self.username[idx + 1..],
            None => &self.username,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("secret", &"***")
            .field("persist", &self.persist)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_state_names_match_the_wire_names() {
        for state in JobState::value_variants() {
            let name = state.to_possible_value().unwrap();
            assert_eq!(name.get_name(), state.as_str());
            assert_eq!(JobState::from_str(state.as_str(), false), Ok(*state));
        }
    }

    #[test]
    fn normalized_username_strips_domain_prefix() {
        assert_eq!(Credential::new("CORP\\alice", "").normalized_username(), "alice");
        assert_eq!(Credential::new("CORP/alice", "").normalized_username(), "alice");
        assert_eq!(Credential::new("CORP;alice", "").normalized_username(), "alice");
        assert_eq!(Credential::new("alice", "").normalized_username(), "alice");
    }

    #[test]
    fn state_machine_edges() {
        assert!(JobState::Pending.can_transition_to(JobState::Running));
        assert!(JobState::Failed.can_transition_to(JobState::Pending));
        assert!(!JobState::Cancelled.can_transition_to(JobState::Pending));
        assert!(!JobState::Completed.can_transition_to(JobState::Running));
        assert!(!JobState::Pending.can_transition_to(JobState::Failed));
    }

    #[test]
    fn debug_hides_secret() {
        let cred = Credential::new("alice", "hunter2");
        assert!(!format!("{:?}", cred).contains("hunter2"));
    }
}
