//! Mirrors queue events into the database.

use anyhow::Result;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tokio_rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::models::JobState;
use crate::core::queue::{JobQueue, QueueEvent};

use super::jobs;

/// Subscribe to `queue` and persist every change until `shutdown` fires, then
/// drain pending events and write a final snapshot.
///
/// Subscribe before restoring jobs into the queue so the restore's own
/// state changes are captured.
pub fn spawn(conn: Connection, queue: JobQueue, shutdown: CancellationToken) -> JoinHandle<()> {
    let mut events = queue.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => {
                        if let Err(e) = apply(&conn, &queue, event).await {
                            warn!(error = %e, "Failed to persist queue change");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Persistence fell behind, writing full snapshot");
                        if let Err(e) = jobs::replace_all(&conn, &queue.snapshot()).await {
                            warn!(error = %e, "Failed to write queue snapshot");
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.cancelled() => {
                    loop {
                        match events.try_recv() {
                            Ok(event) => {
                                if let Err(e) = apply(&conn, &queue, event).await {
                                    warn!(error = %e, "Failed to persist queue change");
                                }
                            }
                            Err(TryRecvError::Lagged(_)) => continue,
                            Err(_) => break,
                        }
                    }
                    break;
                }
            }
        }

        if let Err(e) = jobs::replace_all(&conn, &queue.snapshot()).await {
            warn!(error = %e, "Failed to write final queue snapshot");
        }
        debug!("Queue persistence stopped");
    })
}

async fn apply(conn: &Connection, queue: &JobQueue, event: QueueEvent) -> Result<()> {
    match event {
        QueueEvent::Submitted { job } => {
            // Gone already if it was pruned before we got here.
            let Some(position) = queue.snapshot().iter().position(|j| j.id == job.id) else {
                return Ok(());
            };
            jobs::upsert(conn, &job, position).await?;
            jobs::record_status(conn, job.id, JobState::Pending, Some("submitted".to_string()))
                .await
        }
        QueueEvent::StateChanged { job } => {
            jobs::update_state(conn, &job).await?;
            jobs::record_status(conn, job.id, job.state, Some(job.status_message())).await
        }
        QueueEvent::Reordered { order } => jobs::set_order(conn, order).await,
        QueueEvent::Pruned { ids } => jobs::delete(conn, ids).await,
        QueueEvent::Progress { .. } => Ok(()),
    }
}
