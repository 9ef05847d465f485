//! Advisory network probes run before connecting to a host.
//!
//! Results are only logged and reported; a failing probe never stops the
//! connection attempt. Each probe is bounded by its own timeout.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::error::RunError;
use super::subprocess::{CommandSpec, run_with_timeout};

pub const SMB_PORT: u16 = 445;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticTools {
    pub ping: String,
    pub port_check: String,
    pub traceroute: String,
}

impl Default for DiagnosticTools {
    fn default() -> Self {
        Self {
            ping: "ping".to_string(),
            port_check: "nc".to_string(),
            traceroute: "traceroute".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Reachability,
    Port,
    Route,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Ok,
    Failed { code: i32, detail: String },
    TimedOut,
    Unavailable { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub kind: ProbeKind,
    pub outcome: ProbeOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub host: String,
    pub probes: Vec<ProbeResult>,
}

impl DiagnosticReport {
    pub fn all_ok(&self) -> bool {
        self.probes.iter().all(|p| p.outcome == ProbeOutcome::Ok)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    tools: DiagnosticTools,
}

impl Diagnostics {
    pub fn new(tools: DiagnosticTools) -> Self {
        Self { tools }
    }

    fn plan(&self, host: &str) -> Vec<(ProbeKind, CommandSpec, Duration)> {
        vec![
            (
                ProbeKind::Reachability,
                CommandSpec::new(&self.tools.ping).args(["-c", "3", host]),
                Duration::from_secs(10),
            ),
            (
                ProbeKind::Port,
                CommandSpec::new(&self.tools.port_check)
                    .args(["-z", "-w", "5", host])
                    .arg(SMB_PORT.to_string()),
                Duration::from_secs(10),
            ),
            (
                ProbeKind::Route,
                CommandSpec::new(&self.tools.traceroute).args(["-m", "10", host]),
                Duration::from_secs(30),
            ),
        ]
    }

    /// Run every probe sequentially.
    pub async fn run(&self, host: &str) -> DiagnosticReport {
        let mut probes = Vec::with_capacity(3);

        for (kind, spec, limit) in self.plan(host) {
            let outcome = match run_with_timeout(&spec, limit).await {
                Ok(output) if output.success() => ProbeOutcome::Ok,
                Ok(output) => ProbeOutcome::Failed {
                    code: output.code,
                    detail: output.stderr.trim().to_string(),
                },
                Err(RunError::TimedOut { .. }) => ProbeOutcome::TimedOut,
                Err(e) => ProbeOutcome::Unavailable {
                    reason: e.to_string(),
                },
            };

            match &outcome {
                ProbeOutcome::Ok => info!(host, ?kind, "Probe succeeded"),
                other => warn!(host, ?kind, outcome = ?other, "Probe did not succeed"),
            }
            probes.push(ProbeResult { kind, outcome });
        }

        DiagnosticReport {
            host: host.to_string(),
            probes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_each_probe_without_failing() {
        let diagnostics = Diagnostics::new(DiagnosticTools {
            ping: "true".to_string(),
            port_check: "false".to_string(),
            traceroute: "/nonexistent/traceroute".to_string(),
        });

        let report = diagnostics.run("nas.local").await;

        assert_eq!(report.probes.len(), 3);
        assert_eq!(report.probes[0].outcome, ProbeOutcome::Ok);
        assert!(matches!(
            report.probes[1].outcome,
            ProbeOutcome::Failed { code: 1, .. }
        ));
        assert!(matches!(
            report.probes[2].outcome,
            ProbeOutcome::Unavailable { .. }
        ));
        assert!(!report.all_ok());
    }
}
