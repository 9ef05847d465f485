use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_rusqlite::{Connection, params, rusqlite};
use uuid::Uuid;

use crate::core::models::{Job, JobInputs, JobState};

/// One entry of a job's state history.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub status: String,
    pub description: Option<String>,
    pub created_at: String,
}

/// A job flattened into column values.
struct JobRow {
    id: String,
    position: i64,
    sources: String,
    destination: String,
    tool_args: String,
    host: String,
    state: String,
    progress: f64,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error: Option<String>,
    log_path: String,
}

impl JobRow {
    fn from_job(job: &Job, position: usize) -> Result<Self> {
        Ok(Self {
            id: job.id.to_string(),
            position: position as i64,
            sources: serde_json::to_string(&job.inputs.sources)?,
            destination: job.inputs.destination.to_string_lossy().into_owned(),
            tool_args: serde_json::to_string(&job.inputs.tool_args)?,
            host: job.inputs.host.clone(),
            state: job.state.as_str().to_string(),
            progress: job.progress,
            created_at: job.created_at.to_rfc3339(),
            started_at: job.started_at.map(|t| t.to_rfc3339()),
            completed_at: job.completed_at.map(|t| t.to_rfc3339()),
            error: job.error.clone(),
            log_path: job.log_path.to_string_lossy().into_owned(),
        })
    }

    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            position: row.get(1)?,
            sources: row.get(2)?,
            destination: row.get(3)?,
            tool_args: row.get(4)?,
            host: row.get(5)?,
            state: row.get(6)?,
            progress: row.get(7)?,
            created_at: row.get(8)?,
            started_at: row.get(9)?,
            completed_at: row.get(10)?,
            error: row.get(11)?,
            log_path: row.get(12)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let state = JobState::parse(&self.state)
            .ok_or_else(|| anyhow!("job {} has unknown state {:?}", self.id, self.state))?;

        Ok(Job {
            id: Uuid::parse_str(&self.id).with_context(|| format!("bad job id {:?}", self.id))?,
            inputs: JobInputs {
                sources: serde_json::from_str(&self.sources)?,
                destination: PathBuf::from(self.destination),
                tool_args: serde_json::from_str(&self.tool_args)?,
                host: self.host,
            },
            created_at: parse_time(&self.created_at)?,
            state,
            progress: self.progress.clamp(0.0, 1.0),
            started_at: self.started_at.as_deref().map(parse_time).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_time).transpose()?,
            error: self.error,
            log_path: PathBuf::from(self.log_path),
        })
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("bad timestamp {:?}", value))?
        .with_timezone(&Utc))
}

const UPSERT_JOB: &str = "INSERT INTO jobs (id, position, sources, destination, tool_args, host,
                          state, progress, created_at, started_at, completed_at, error, log_path)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
     ON CONFLICT(id) DO UPDATE SET
        position = excluded.position,
        state = excluded.state,
        progress = excluded.progress,
        started_at = excluded.started_at,
        completed_at = excluded.completed_at,
        error = excluded.error";

fn upsert_row(c: &rusqlite::Connection, row: &JobRow) -> rusqlite::Result<usize> {
    c.execute(
        UPSERT_JOB,
        params![
            row.id,
            row.position,
            row.sources,
            row.destination,
            row.tool_args,
            row.host,
            row.state,
            row.progress,
            row.created_at,
            row.started_at,
            row.completed_at,
            row.error,
            row.log_path
        ],
    )
}

pub async fn upsert(conn: &Connection, job: &Job, position: usize) -> Result<()> {
    let row = JobRow::from_job(job, position)?;
    conn.call(move |c| {
        upsert_row(c, &row)?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

/// Overwrite the stored list with `jobs` in order; rows not in `jobs` are removed.
pub async fn replace_all(conn: &Connection, jobs: &[Job]) -> Result<()> {
    let rows = jobs
        .iter()
        .enumerate()
        .map(|(position, job)| JobRow::from_job(job, position))
        .collect::<Result<Vec<_>>>()?;

    conn.call(move |c| {
        let tx = c.transaction()?;
        let keep: HashSet<&str> = rows.iter().map(|r| r.id.as_str()).collect();

        let stored: Vec<String> = {
            let mut stmt = tx.prepare("SELECT id FROM jobs")?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?
        };
        for id in stored.iter().filter(|id| !keep.contains(id.as_str())) {
            tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        }
        for row in &rows {
            upsert_row(&tx, row)?;
        }

        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

/// Store the mutable fields of a job after a state change.
pub async fn update_state(conn: &Connection, job: &Job) -> Result<()> {
    let row = JobRow::from_job(job, 0)?;
    conn.call(move |c| {
        c.execute(
            "UPDATE jobs SET state = ?2, progress = ?3, started_at = ?4, completed_at = ?5,
             error = ?6 WHERE id = ?1",
            params![
                row.id,
                row.state,
                row.progress,
                row.started_at,
                row.completed_at,
                row.error
            ],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

pub async fn set_order(conn: &Connection, order: Vec<Uuid>) -> Result<()> {
    conn.call(move |c| {
        let tx = c.transaction()?;
        for (position, id) in order.iter().enumerate() {
            tx.execute(
                "UPDATE jobs SET position = ?2 WHERE id = ?1",
                params![id.to_string(), position as i64],
            )?;
        }
        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

pub async fn delete(conn: &Connection, ids: Vec<Uuid>) -> Result<()> {
    conn.call(move |c| {
        let tx = c.transaction()?;
        for id in &ids {
            tx.execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])?;
        }
        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

/// All stored jobs in queue order.
pub async fn load_all(conn: &Connection) -> Result<Vec<Job>> {
    let rows = conn
        .call(|c| {
            let mut stmt = c.prepare(
                "SELECT id, position, sources, destination, tool_args, host, state, progress,
                        created_at, started_at, completed_at, error, log_path
                 FROM jobs ORDER BY position, created_at",
            )?;
            let rows = stmt
                .query_map([], JobRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })
        .await
        .map_err(|e| anyhow!("Failed to load jobs: {}", e))?;

    rows.into_iter().map(JobRow::into_job).collect()
}

pub async fn record_status(
    conn: &Connection,
    job_id: Uuid,
    state: JobState,
    description: Option<String>,
) -> Result<()> {
    conn.call(move |c| {
        let log_id = Uuid::now_v7().to_string();
        c.execute(
            "INSERT INTO job_status_log (id, job_id, status, description)
             SELECT ?1, ?2, ?3, ?4 WHERE EXISTS (SELECT 1 FROM jobs WHERE id = ?2)",
            params![log_id, job_id.to_string(), state.as_str(), description],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

/// State history of one job, oldest first.
pub async fn history(conn: &Connection, job_id: Uuid) -> Result<Vec<StatusEntry>> {
    conn.call(move |c| {
        let mut stmt = c.prepare(
            "SELECT status, description, created_at FROM job_status_log
             WHERE job_id = ?1 ORDER BY created_at, id",
        )?;
        let entries = stmt
            .query_map(params![job_id.to_string()], |row| {
                Ok(StatusEntry {
                    status: row.get(0)?,
                    description: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok::<_, rusqlite::Error>(entries)
    })
    .await
    .map_err(|e| anyhow!("Failed to get job history: {}", e))
}
