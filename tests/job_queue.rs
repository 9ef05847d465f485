use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sharesync::core::error::QueueError;
use sharesync::core::models::{Job, JobInputs, JobState};
use sharesync::core::queue::{INTERRUPTED_MESSAGE, JobQueue, QueueEvent, QueueOptions};
use sharesync::core::transfer_engine::SimulatedEngine;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(10);

fn queue(engine: SimulatedEngine, logs: &Path) -> JobQueue {
    JobQueue::new(
        Arc::new(engine),
        QueueOptions {
            log_directory: logs.to_path_buf(),
            enforce_read_only_sources: true,
        },
    )
}

fn slow_engine() -> SimulatedEngine {
    SimulatedEngine {
        step_delay: Duration::from_millis(30),
        steps: 10,
        fail_marker: None,
    }
}

fn inputs(name: &str) -> JobInputs {
    JobInputs {
        sources: vec![PathBuf::from(format!("/Volumes/share/{}", name))],
        destination: PathBuf::from("/tmp/dest"),
        tool_args: vec!["-a".to_string()],
        host: "nas.local".to_string(),
    }
}

async fn settle(queue: &JobQueue) {
    timeout(WAIT, queue.wait_idle())
        .await
        .expect("queue did not become idle");
}

fn drain(rx: &mut broadcast::Receiver<QueueEvent>) -> Vec<QueueEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn state_of(queue: &JobQueue, id: Uuid) -> JobState {
    queue.get(id).expect("job exists").state
}

#[tokio::test]
async fn jobs_complete_in_submission_order() {
    let logs = TempDir::new().unwrap();
    let queue = queue(SimulatedEngine::fast(), logs.path());
    let mut events = queue.subscribe();

    let ids: Vec<Uuid> = ["a", "b", "c"]
        .iter()
        .map(|name| queue.submit(inputs(name)).unwrap().id)
        .collect();
    settle(&queue).await;

    let mut running = HashSet::new();
    let mut completed = Vec::new();
    let mut last_progress = 0.0;
    let mut progress_job = None;

    for event in drain(&mut events) {
        match event {
            QueueEvent::StateChanged { job } => {
                match job.state {
                    JobState::Running => {
                        running.insert(job.id);
                    }
                    JobState::Completed => {
                        running.remove(&job.id);
                        completed.push(job.id);
                    }
                    other => panic!("unexpected state {}", other),
                }
                assert!(running.len() <= 1, "two jobs running at once");
            }
            QueueEvent::Progress { job_id, progress } => {
                if progress_job != Some(job_id) {
                    progress_job = Some(job_id);
                    last_progress = 0.0;
                }
                assert!(progress >= last_progress, "progress went backwards");
                last_progress = progress;
            }
            _ => {}
        }
    }

    assert_eq!(completed, ids);
    for id in ids {
        let job = queue.get(id).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.progress, 1.0);
        assert!(job.started_at.is_some() && job.completed_at.is_some());
        assert!(job.error.is_none());
    }
}

#[tokio::test]
async fn submit_starts_immediately_when_idle() {
    let logs = TempDir::new().unwrap();
    let queue = queue(slow_engine(), logs.path());

    let first = queue.submit(inputs("a")).unwrap();
    let second = queue.submit(inputs("b")).unwrap();

    assert_eq!(first.state, JobState::Running);
    assert_eq!(second.state, JobState::Pending);
    assert_eq!(first.log_path, logs.path().join(format!("{}.log", first.id)));
    assert_eq!(queue.running().map(|j| j.id), Some(first.id));

    queue.shutdown().await;
}

#[tokio::test]
async fn rejects_invalid_submissions() {
    let logs = TempDir::new().unwrap();
    let queue = queue(SimulatedEngine::fast(), logs.path());

    let mut empty = inputs("a");
    empty.sources.clear();
    assert_eq!(queue.submit(empty).unwrap_err(), QueueError::NoSources);

    let mut destructive = inputs("a");
    destructive.tool_args.push("--remove-source-files".to_string());
    assert_eq!(
        queue.submit(destructive).unwrap_err(),
        QueueError::WriteFlagRejected("--remove-source-files".to_string())
    );
    assert!(queue.snapshot().is_empty());
}

#[tokio::test]
async fn write_flags_allowed_when_not_enforced() {
    let logs = TempDir::new().unwrap();
    let queue = JobQueue::new(
        Arc::new(SimulatedEngine::fast()),
        QueueOptions {
            log_directory: logs.path().to_path_buf(),
            enforce_read_only_sources: false,
        },
    );

    let mut args = inputs("a");
    args.tool_args.push("--remove-sent-files".to_string());
    assert!(queue.submit(args).is_ok());
    settle(&queue).await;
}

#[tokio::test]
async fn cancel_pending_and_running_jobs() {
    let logs = TempDir::new().unwrap();
    let queue = queue(slow_engine(), logs.path());

    let running = queue.submit(inputs("a")).unwrap();
    let waiting = queue.submit(inputs("b")).unwrap();

    assert_eq!(queue.cancel(waiting.id), Ok(JobState::Cancelled));
    let cancelled = queue.get(waiting.id).unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);
    assert!(cancelled.started_at.is_none());
    assert!(cancelled.error.is_some());

    assert_eq!(queue.cancel(running.id), Ok(JobState::Running));
    settle(&queue).await;
    assert_eq!(state_of(&queue, running.id), JobState::Cancelled);

    assert!(matches!(
        queue.cancel(running.id),
        Err(QueueError::InvalidTransition {
            state: JobState::Cancelled,
            ..
        })
    ));
    assert_eq!(
        queue.cancel(Uuid::nil()),
        Err(QueueError::NotFound(Uuid::nil()))
    );
}

#[tokio::test]
async fn cancelling_running_job_promotes_next() {
    let logs = TempDir::new().unwrap();
    let queue = queue(slow_engine(), logs.path());

    let first = queue.submit(inputs("a")).unwrap();
    let second = queue.submit(inputs("b")).unwrap();

    queue.cancel(first.id).unwrap();
    settle(&queue).await;

    assert_eq!(state_of(&queue, first.id), JobState::Cancelled);
    assert_eq!(state_of(&queue, second.id), JobState::Completed);
}

#[tokio::test]
async fn retry_only_from_failed_and_keeps_position() {
    let logs = TempDir::new().unwrap();
    let queue = queue(SimulatedEngine::fast().failing_on("broken"), logs.path());

    let bad = queue.submit(inputs("broken")).unwrap();
    let good = queue.submit(inputs("fine")).unwrap();
    settle(&queue).await;

    let failed = queue.get(bad.id).unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert!(failed.error.as_deref().unwrap().contains("simulated failure"));
    assert_eq!(state_of(&queue, good.id), JobState::Completed);

    assert!(matches!(
        queue.retry(good.id),
        Err(QueueError::InvalidTransition {
            state: JobState::Completed,
            action: "retry",
            ..
        })
    ));

    let retried = queue.retry(bad.id).unwrap();
    assert_eq!(retried.state, JobState::Running);
    assert!(retried.error.is_none());
    assert_eq!(queue.snapshot()[0].id, bad.id);

    settle(&queue).await;
    assert_eq!(state_of(&queue, bad.id), JobState::Failed);
}

#[tokio::test]
async fn retry_resets_progress_and_timestamps() {
    let logs = TempDir::new().unwrap();
    let queue = queue(SimulatedEngine::fast().failing_on("broken"), logs.path());
    let mut events = queue.subscribe();

    let bad = queue.submit(inputs("broken")).unwrap();
    settle(&queue).await;
    drain(&mut events);

    queue.retry(bad.id).unwrap();
    let reset = drain(&mut events)
        .into_iter()
        .find_map(|event| match event {
            QueueEvent::StateChanged { job } if job.state == JobState::Pending => Some(job),
            _ => None,
        })
        .expect("pending state published");
    assert_eq!(reset.progress, 0.0);
    assert!(reset.error.is_none());
    assert!(reset.started_at.is_none() && reset.completed_at.is_none());

    settle(&queue).await;
}

#[tokio::test]
async fn reorder_changes_admission_order() {
    let logs = TempDir::new().unwrap();
    let queue = queue(slow_engine(), logs.path());
    let mut events = queue.subscribe();

    let ids: Vec<Uuid> = ["a", "b", "c", "d"]
        .iter()
        .map(|name| queue.submit(inputs(name)).unwrap().id)
        .collect();

    let order = queue.reorder(&[3], 1).unwrap();
    assert_eq!(order, vec![ids[0], ids[3], ids[1], ids[2]]);

    // Moving the running job only changes the list.
    let order = queue.reorder(&[0], 4).unwrap();
    assert_eq!(order, vec![ids[3], ids[1], ids[2], ids[0]]);
    assert_eq!(queue.running().map(|j| j.id), Some(ids[0]));

    assert_eq!(queue.reorder(&[9], 0), Err(QueueError::InvalidPosition(9)));
    assert_eq!(queue.reorder(&[0], 5), Err(QueueError::InvalidPosition(5)));

    settle(&queue).await;
    let completed: Vec<Uuid> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            QueueEvent::StateChanged { job } if job.state == JobState::Completed => Some(job.id),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec![ids[0], ids[3], ids[1], ids[2]]);
}

#[tokio::test]
async fn reorder_moves_several_positions() {
    let logs = TempDir::new().unwrap();
    let queue = queue(slow_engine(), logs.path());

    let ids: Vec<Uuid> = ["a", "b", "c", "d", "e"]
        .iter()
        .map(|name| queue.submit(inputs(name)).unwrap().id)
        .collect();

    let order = queue.reorder(&[1, 3], 0).unwrap();
    assert_eq!(order, vec![ids[1], ids[3], ids[0], ids[2], ids[4]]);

    queue.shutdown().await;
}

#[tokio::test]
async fn prune_removes_terminal_jobs_only() {
    let logs = TempDir::new().unwrap();
    let queue = queue(slow_engine(), logs.path());

    let running = queue.submit(inputs("a")).unwrap();
    let cancelled = queue.submit(inputs("b")).unwrap();
    let pending = queue.submit(inputs("c")).unwrap();
    queue.cancel(cancelled.id).unwrap();

    assert_eq!(queue.prune_finished(), vec![cancelled.id]);
    let remaining: Vec<Uuid> = queue.snapshot().iter().map(|j| j.id).collect();
    assert_eq!(remaining, vec![running.id, pending.id]);

    settle(&queue).await;
    assert_eq!(queue.prune_finished().len(), 2);
    assert!(queue.snapshot().is_empty());
}

#[tokio::test]
async fn restore_marks_interrupted_jobs_failed() {
    let logs = TempDir::new().unwrap();
    let queue = queue(SimulatedEngine::fast(), logs.path());

    let mut interrupted = Job::new(inputs("a"), logs.path());
    interrupted.state = JobState::Running;
    interrupted.progress = 0.4;
    let waiting = Job::new(inputs("b"), logs.path());
    let (interrupted_id, waiting_id) = (interrupted.id, waiting.id);

    queue.restore(vec![interrupted, waiting]);
    settle(&queue).await;

    let failed = queue.get(interrupted_id).unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.error.as_deref(), Some(INTERRUPTED_MESSAGE));
    assert_eq!(state_of(&queue, waiting_id), JobState::Completed);

    queue.retry(interrupted_id).unwrap();
    settle(&queue).await;
    assert_eq!(state_of(&queue, interrupted_id), JobState::Completed);
}

#[tokio::test]
async fn shutdown_interrupts_running_job_and_keeps_pending() {
    let logs = TempDir::new().unwrap();
    let queue = queue(slow_engine(), logs.path());

    let running = queue.submit(inputs("a")).unwrap();
    let pending = queue.submit(inputs("b")).unwrap();

    timeout(WAIT, queue.shutdown()).await.unwrap();

    let interrupted = queue.get(running.id).unwrap();
    assert_eq!(interrupted.state, JobState::Failed);
    assert_eq!(interrupted.error.as_deref(), Some(INTERRUPTED_MESSAGE));
    assert_eq!(state_of(&queue, pending.id), JobState::Pending);
    assert!(queue.running().is_none());
}
