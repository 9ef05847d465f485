//! Serial job queue.
//!
//! The queue owns the ordered job list and is its only writer. At most one
//! job is `running`; when the slot frees up, the first `pending` job in queue
//! order is promoted. Transfers run on their own task and report back through
//! a channel, so queue operations never block on I/O.
//!
//! Every mutation is published on a broadcast channel as a [`QueueEvent`];
//! front ends and the persistence task subscribe instead of polling.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{QueueError, TransferError};
use super::models::{Job, JobInputs, JobState};
use super::transfer_engine::{TransferEngine, TransferRequest};

/// Copy tool flags that delete or modify files on the source side.
pub const SOURCE_WRITING_FLAGS: &[&str] = &["--remove-source-files", "--remove-sent-files"];

const EVENT_CAPACITY: usize = 1024;

pub const INTERRUPTED_MESSAGE: &str = "interrupted by daemon shutdown";

#[derive(Debug, Clone)]
pub enum QueueEvent {
    Submitted { job: Job },
    Progress { job_id: Uuid, progress: f64 },
    StateChanged { job: Job },
    Reordered { order: Vec<Uuid> },
    Pruned { ids: Vec<Uuid> },
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub log_directory: PathBuf,
    pub enforce_read_only_sources: bool,
}

struct ActiveJob {
    id: Uuid,
    cancel: CancellationToken,
    done: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    jobs: Vec<Job>,
    active: Option<ActiveJob>,
    accepting: bool,
}

struct Inner {
    state: Mutex<QueueState>,
    engine: Arc<dyn TransferEngine>,
    events: broadcast::Sender<QueueEvent>,
    idle: Notify,
    runtime: Handle,
    options: QueueOptions,
}

#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    /// Must be called from within a tokio runtime; transfers are spawned on it.
    pub fn new(engine: Arc<dyn TransferEngine>, options: QueueOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    accepting: true,
                    ..Default::default()
                }),
                engine,
                events,
                idle: Notify::new(),
                runtime: Handle::current(),
                options,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    /// Load a previously persisted list. Jobs that were running when the
    /// daemon stopped become `failed` so they can be retried explicitly.
    pub fn restore(&self, jobs: Vec<Job>) {
        let mut state = self.state();
        state.jobs = jobs;
        for job in state.jobs.iter_mut().filter(|j| j.state == JobState::Running) {
            warn!(job_id = %job.id, "Job was interrupted by a previous shutdown");
            job.state = JobState::Failed;
            job.completed_at = Some(Utc::now());
            job.error = Some(INTERRUPTED_MESSAGE.to_string());
            self.emit(QueueEvent::StateChanged { job: job.clone() });
        }
        info!(jobs = state.jobs.len(), "Restored job queue");
        self.promote_next(&mut state);
    }

    pub fn snapshot(&self) -> Vec<Job> {
        self.state().jobs.clone()
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.state().jobs.iter().find(|j| j.id == id).cloned()
    }

    pub fn running(&self) -> Option<Job> {
        self.state()
            .jobs
            .iter()
            .find(|j| j.state == JobState::Running)
            .cloned()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state();
        Self::idle_locked(&state)
    }

    fn idle_locked(state: &QueueState) -> bool {
        state.active.is_none()
            && (!state.accepting || !state.jobs.iter().any(|j| j.state == JobState::Pending))
    }

    /// Resolves once nothing is running and nothing is waiting to run.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Append a job to the tail of the queue and start it if the slot is free.
    pub fn submit(&self, inputs: JobInputs) -> Result<Job, QueueError> {
        if inputs.sources.is_empty() {
            return Err(QueueError::NoSources);
        }
        if self.inner.options.enforce_read_only_sources {
            if let Some(flag) = inputs
                .tool_args
                .iter()
                .find(|arg| SOURCE_WRITING_FLAGS.contains(&arg.as_str()))
            {
                return Err(QueueError::WriteFlagRejected(flag.clone()));
            }
        }

        let job = Job::new(inputs, &self.inner.options.log_directory);
        info!(
            job_id = %job.id,
            sources = job.inputs.sources.len(),
            destination = %job.inputs.destination.display(),
            "Job submitted"
        );

        let mut state = self.state();
        state.jobs.push(job.clone());
        self.emit(QueueEvent::Submitted { job: job.clone() });
        self.promote_next(&mut state);

        Ok(state
            .jobs
            .iter()
            .find(|j| j.id == job.id)
            .cloned()
            .unwrap_or(job))
    }

    /// Cancel a job. A pending job is cancelled at once; a running job is
    /// asked to stop and becomes `cancelled` once its process has exited.
    /// Returns the job's state after the call.
    pub fn cancel(&self, id: Uuid) -> Result<JobState, QueueError> {
        let mut state = self.state();
        let current = find_mut(&mut state.jobs, id)?.state;

        match current {
            JobState::Pending => {
                let job = find_mut(&mut state.jobs, id)?;
                transition(job, JobState::Cancelled, "cancel")?;
                job.completed_at = Some(Utc::now());
                job.error = Some("cancelled before start".to_string());
                info!(job_id = %id, "Pending job cancelled");
                let job = job.clone();
                self.emit(QueueEvent::StateChanged { job });
                Ok(JobState::Cancelled)
            }
            JobState::Running => {
                match state.active.as_ref().filter(|active| active.id == id) {
                    Some(active) => {
                        info!(job_id = %id, "Cancellation requested for running job");
                        active.cancel.cancel();
                    }
                    None => warn!(job_id = %id, "Running job has no active transfer"),
                }
                Ok(JobState::Running)
            }
            other => Err(QueueError::InvalidTransition {
                id,
                state: other,
                action: "cancel",
            }),
        }
    }

    /// Put a failed job back to `pending` at its current position.
    pub fn retry(&self, id: Uuid) -> Result<Job, QueueError> {
        let mut state = self.state();
        let job = find_mut(&mut state.jobs, id)?;

        if job.state != JobState::Failed {
            return Err(QueueError::InvalidTransition {
                id,
                state: job.state,
                action: "retry",
            });
        }
        transition(job, JobState::Pending, "retry")?;
        job.progress = 0.0;
        job.error = None;
        job.started_at = None;
        job.completed_at = None;
        info!(job_id = %id, "Job queued for retry");
        let snapshot = job.clone();
        self.emit(QueueEvent::StateChanged {
            job: snapshot.clone(),
        });

        self.promote_next(&mut state);
        Ok(state
            .jobs
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .unwrap_or(snapshot))
    }

    /// Move the jobs at `from` so they end up before the job currently at
    /// `to` (or at the end when `to == len`). Only the list order changes; a
    /// running job keeps running.
    pub fn reorder(&self, from: &[usize], to: usize) -> Result<Vec<Uuid>, QueueError> {
        let mut state = self.state();
        let len = state.jobs.len();

        let positions: BTreeSet<usize> = from.iter().copied().collect();
        if let Some(&bad) = positions.iter().find(|&&p| p >= len) {
            return Err(QueueError::InvalidPosition(bad));
        }
        if to > len {
            return Err(QueueError::InvalidPosition(to));
        }

        let mut moved = Vec::with_capacity(positions.len());
        for &position in positions.iter().rev() {
            moved.push(state.jobs.remove(position));
        }
        moved.reverse();

        let insert_at = to - positions.iter().filter(|&&p| p < to).count();
        state.jobs.splice(insert_at..insert_at, moved);

        let order: Vec<Uuid> = state.jobs.iter().map(|j| j.id).collect();
        debug!(?from, to, "Queue reordered");
        self.emit(QueueEvent::Reordered {
            order: order.clone(),
        });
        Ok(order)
    }

    /// Remove every job in a terminal state and return their ids.
    pub fn prune_finished(&self) -> Vec<Uuid> {
        let mut state = self.state();
        let ids: Vec<Uuid> = state
            .jobs
            .iter()
            .filter(|j| j.state.is_terminal())
            .map(|j| j.id)
            .collect();

        if !ids.is_empty() {
            state.jobs.retain(|j| !j.state.is_terminal());
            info!(removed = ids.len(), "Pruned finished jobs");
            self.emit(QueueEvent::Pruned { ids: ids.clone() });
        }

        self.promote_next(&mut state);
        ids
    }

    /// Stop admitting jobs, cancel the running one and wait for its process
    /// to exit. Pending jobs stay pending for the next start.
    pub async fn shutdown(&self) {
        let done = {
            let mut state = self.state();
            state.accepting = false;
            state.active.as_ref().map(|active| {
                active.cancel.cancel();
                active.done.clone()
            })
        };
        if let Some(done) = done {
            info!("Waiting for running transfer to stop");
            done.cancelled().await;
        }
        self.inner.idle.notify_waiters();
    }

    fn promote_next(&self, state: &mut QueueState) {
        if state.active.is_some() || !state.accepting {
            return;
        }

        let Some(job) = state.jobs.iter_mut().find(|j| j.state == JobState::Pending) else {
            self.inner.idle.notify_waiters();
            return;
        };

        job.state = JobState::Running;
        job.started_at = Some(Utc::now());
        job.completed_at = None;
        job.progress = 0.0;
        info!(job_id = %job.id, "Job started");

        let request = TransferRequest::from(&*job);
        let snapshot = job.clone();
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        state.active = Some(ActiveJob {
            id: snapshot.id,
            cancel: cancel.clone(),
            done: done.clone(),
        });
        self.emit(QueueEvent::StateChanged { job: snapshot });

        self.spawn_transfer(request, cancel, done);
    }

    fn spawn_transfer(&self, request: TransferRequest, cancel: CancellationToken, done: CancellationToken) {
        let queue = self.clone();
        let engine = self.inner.engine.clone();

        self.inner.runtime.spawn(async move {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let transfer = tokio::spawn(engine.transfer(&request, cancel, tx));

            while let Some(fraction) = rx.recv().await {
                queue.apply_progress(request.job_id, fraction);
            }

            let result = match transfer.await {
                Ok(result) => result,
                Err(e) => Err(TransferError::Io(format!("transfer task failed: {}", e))),
            };
            queue.finish(request.job_id, result);
            done.cancel();
        });
    }

    fn apply_progress(&self, id: Uuid, fraction: f64) {
        let mut state = self.state();
        let Some(job) = state.jobs.iter_mut().find(|j| j.id == id) else {
            return;
        };
        if job.state != JobState::Running || fraction <= job.progress {
            return;
        }
        job.progress = fraction.min(1.0);
        self.emit(QueueEvent::Progress {
            job_id: id,
            progress: job.progress,
        });
    }

    fn finish(&self, id: Uuid, result: Result<(), TransferError>) {
        let mut state = self.state();
        if state.active.as_ref().is_some_and(|a| a.id == id) {
            state.active = None;
        }
        let accepting = state.accepting;

        match state.jobs.iter_mut().find(|j| j.id == id) {
            Some(job) => {
                // A transfer stopped by shutdown stays retryable.
                let interrupted = !accepting
                    && matches!(result, Err(TransferError::Cancelled));
                let next = match &result {
                    Ok(()) => JobState::Completed,
                    Err(TransferError::Cancelled) if !interrupted => JobState::Cancelled,
                    Err(_) => JobState::Failed,
                };
                if let Err(e) = transition(job, next, "finish") {
                    warn!(job_id = %id, error = %e, "Ignoring transfer result");
                } else {
                    job.completed_at = Some(Utc::now());
                    match result {
                        Ok(()) => {
                            job.progress = 1.0;
                            job.error = None;
                            info!(job_id = %id, "Job completed");
                        }
                        Err(_) if interrupted => {
                            info!(job_id = %id, "Job interrupted by shutdown");
                            job.error = Some(INTERRUPTED_MESSAGE.to_string());
                        }
                        Err(e) => {
                            info!(job_id = %id, state = %next, error = %e, "Job stopped");
                            job.error = Some(e.to_string());
                        }
                    }
                    let job = job.clone();
                    self.emit(QueueEvent::StateChanged { job });
                }
            }
            None => warn!(job_id = %id, "Finished job is no longer in the queue"),
        }

        self.promote_next(&mut state);
        if Self::idle_locked(&state) {
            self.inner.idle.notify_waiters();
        }
    }
}

fn find_mut(jobs: &mut [Job], id: Uuid) -> Result<&mut Job, QueueError> {
    jobs.iter_mut()
        .find(|j| j.id == id)
        .ok_or(QueueError::NotFound(id))
}

fn transition(job: &mut Job, next: JobState, action: &'static str) -> Result<(), QueueError> {
    if !job.state.can_transition_to(next) {
        return Err(QueueError::InvalidTransition {
            id: job.id,
            state: job.state,
            action,
        });
    }
    job.state = next;
    Ok(())
}
