use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::error::TransferError;
use crate::core::transfer_engine::{
    ProgressAggregator, TransferEngine, TransferRequest,
};

/// Engine that pretends to copy, for simulation mode and queue tests.
///
/// Each source takes `steps` ticks of `step_delay`. A source whose path
/// contains `fail_marker` fails with a tool error halfway through.
pub struct SimulatedEngine {
    pub step_delay: Duration,
    pub steps: u32,
    pub fail_marker: Option<String>,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_millis(500),
            steps: 10,
            fail_marker: None,
        }
    }
}

impl SimulatedEngine {
    pub fn fast() -> Self {
        Self {
            step_delay: Duration::from_millis(10),
            steps: 4,
            fail_marker: None,
        }
    }

    pub fn failing_on(mut self, marker: impl Into<String>) -> Self {
        self.fail_marker = Some(marker.into());
        self
    }
}

impl TransferEngine for SimulatedEngine {
    fn transfer(
        &self,
        req: &TransferRequest,
        cancel: CancellationToken,
        progress: mpsc::UnboundedSender<f64>,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransferError>> + Send>> {
        let req = req.clone();
        let step_delay = self.step_delay;
        let steps = self.steps.max(1);
        let fail_marker = self.fail_marker.clone();

        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let mut aggregate = ProgressAggregator::new(req.sources.len());

            for (index, source) in req.sources.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(TransferError::Cancelled);
                }
                aggregate.begin_source(index);

                let fails = fail_marker
                    .as_deref()
                    .is_some_and(|marker| source.to_string_lossy().contains(marker));

                for step in 1..=steps {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                        _ = sleep(step_delay) => {}
                    }

                    if fails && step * 2 >= steps {
                        return Err(TransferError::ToolFailure {
                            code: 1,
                            message: format!("simulated failure for {}", source.display()),
                        });
                    }

                    if let Some(overall) = aggregate.update(step as f64 / steps as f64) {
                        debug!(job_id = %req.job_id, progress = overall, "Simulated progress");
                        let _ = progress.send(overall);
                    }
                }
            }

            Ok(())
        })
    }
}
