use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sharesync::core::models::{Job, JobInputs, JobState};
use sharesync::core::queue::{INTERRUPTED_MESSAGE, JobQueue, QueueOptions};
use sharesync::core::transfer_engine::SimulatedEngine;
use sharesync::db;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn inputs(name: &str) -> JobInputs {
    JobInputs {
        sources: vec![PathBuf::from(format!("/Volumes/share/{}", name))],
        destination: PathBuf::from("/backup"),
        tool_args: vec!["-a".to_string()],
        host: "nas.local".to_string(),
    }
}

fn ids(jobs: &[Job]) -> Vec<uuid::Uuid> {
    jobs.iter().map(|j| j.id).collect()
}

#[tokio::test]
async fn jobs_round_trip_in_order() {
    let conn = db::init_in_memory().await.unwrap();
    let logs = PathBuf::from("/tmp/logs");

    let first = Job::new(inputs("a"), &logs);
    let mut second = Job::new(inputs("b"), &logs);
    second.state = JobState::Failed;
    second.error = Some("transfer tool exited with code 1: boom".to_string());
    second.progress = 0.4;

    db::jobs::upsert(&conn, &second, 1).await.unwrap();
    db::jobs::upsert(&conn, &first, 0).await.unwrap();

    let loaded = db::jobs::load_all(&conn).await.unwrap();
    assert_eq!(ids(&loaded), vec![first.id, second.id]);
    assert_eq!(loaded[0].inputs, first.inputs);
    assert_eq!(loaded[0].log_path, first.log_path);
    assert_eq!(loaded[1].state, JobState::Failed);
    assert_eq!(loaded[1].error, second.error);
    assert!((loaded[1].progress - 0.4).abs() < f64::EPSILON);
}

#[tokio::test]
async fn reorder_and_delete() {
    let conn = db::init_in_memory().await.unwrap();
    let logs = PathBuf::from("/tmp/logs");
    let jobs: Vec<Job> = ["a", "b", "c"]
        .iter()
        .map(|n| Job::new(inputs(n), &logs))
        .collect();
    db::jobs::replace_all(&conn, &jobs).await.unwrap();

    db::jobs::set_order(&conn, vec![jobs[2].id, jobs[0].id, jobs[1].id])
        .await
        .unwrap();
    let loaded = db::jobs::load_all(&conn).await.unwrap();
    assert_eq!(ids(&loaded), vec![jobs[2].id, jobs[0].id, jobs[1].id]);

    db::jobs::record_status(&conn, jobs[0].id, JobState::Pending, None)
        .await
        .unwrap();
    db::jobs::delete(&conn, vec![jobs[0].id]).await.unwrap();

    let loaded = db::jobs::load_all(&conn).await.unwrap();
    assert_eq!(ids(&loaded), vec![jobs[2].id, jobs[1].id]);
    assert!(db::jobs::history(&conn, jobs[0].id).await.unwrap().is_empty());
}

#[tokio::test]
async fn replace_all_drops_missing_rows() {
    let conn = db::init_in_memory().await.unwrap();
    let logs = PathBuf::from("/tmp/logs");
    let a = Job::new(inputs("a"), &logs);
    let b = Job::new(inputs("b"), &logs);
    db::jobs::replace_all(&conn, &[a.clone(), b.clone()]).await.unwrap();

    db::jobs::replace_all(&conn, &[b.clone()]).await.unwrap();
    assert_eq!(ids(&db::jobs::load_all(&conn).await.unwrap()), vec![b.id]);
}

#[tokio::test]
async fn status_history_skips_unknown_jobs() {
    let conn = db::init_in_memory().await.unwrap();
    let job = Job::new(inputs("a"), &PathBuf::from("/tmp/logs"));
    db::jobs::upsert(&conn, &job, 0).await.unwrap();

    db::jobs::record_status(&conn, job.id, JobState::Running, Some("started".to_string()))
        .await
        .unwrap();
    let stranger = uuid::Uuid::now_v7();
    db::jobs::record_status(&conn, stranger, JobState::Running, None)
        .await
        .unwrap();

    let history = db::jobs::history(&conn, job.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, "running");
    assert_eq!(history[0].description.as_deref(), Some("started"));
    assert!(db::jobs::history(&conn, stranger).await.unwrap().is_empty());
}

#[tokio::test]
async fn database_file_is_created_with_parent_directory() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state").join("jobs.db");

    let conn = db::init(&path).await.unwrap();
    db::jobs::upsert(&conn, &Job::new(inputs("a"), dir.path()), 0)
        .await
        .unwrap();
    drop(conn);

    let reopened = db::init(&path).await.unwrap();
    assert_eq!(db::jobs::load_all(&reopened).await.unwrap().len(), 1);
}

#[tokio::test]
async fn queue_changes_are_mirrored_and_survive_restart() {
    let dir = TempDir::new().unwrap();
    let conn = db::init_in_memory().await.unwrap();
    let queue = JobQueue::new(
        Arc::new(SimulatedEngine {
            step_delay: Duration::from_millis(50),
            steps: 20,
            fail_marker: None,
        }),
        QueueOptions {
            log_directory: dir.path().to_path_buf(),
            enforce_read_only_sources: true,
        },
    );
    let stop = CancellationToken::new();
    let persistence = db::persist::spawn(conn.clone(), queue.clone(), stop.clone());

    let a = queue.submit(inputs("a")).unwrap();
    let b = queue.submit(inputs("b")).unwrap();
    let c = queue.submit(inputs("c")).unwrap();
    queue.cancel(c.id).unwrap();
    queue.reorder(&[1], 0).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    queue.shutdown().await;
    stop.cancel();
    persistence.await.unwrap();

    let stored = db::jobs::load_all(&conn).await.unwrap();
    assert_eq!(ids(&stored), vec![b.id, a.id, c.id]);
    assert_eq!(stored[0].state, JobState::Pending);
    assert_eq!(stored[1].state, JobState::Failed);
    assert_eq!(stored[1].error.as_deref(), Some(INTERRUPTED_MESSAGE));
    assert_eq!(stored[2].state, JobState::Cancelled);

    let statuses: Vec<String> = db::jobs::history(&conn, a.id)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.status)
        .collect();
    for expected in ["pending", "running", "failed"] {
        assert!(statuses.iter().any(|s| s == expected), "{:?}", statuses);
    }

    // A fresh queue picks up where the old one stopped.
    let restored = JobQueue::new(
        Arc::new(SimulatedEngine::fast()),
        QueueOptions {
            log_directory: dir.path().to_path_buf(),
            enforce_read_only_sources: true,
        },
    );
    restored.restore(stored);
    tokio::time::timeout(Duration::from_secs(10), restored.wait_idle())
        .await
        .unwrap();

    let after = restored.snapshot();
    assert_eq!(ids(&after), vec![b.id, a.id, c.id]);
    assert_eq!(after[0].state, JobState::Completed);
    assert_eq!(after[1].state, JobState::Failed);
    assert_ne!(restored.retry(a.id).unwrap().state, JobState::Failed);
}
