use std::path::Path;

use anyhow::Result;
use tokio_rusqlite::Connection;

pub mod jobs;
pub mod persist;

pub async fn init(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    prepare(Connection::open(path).await?).await
}

pub async fn init_in_memory() -> Result<Connection> {
    prepare(Connection::open_in_memory().await?).await
}

async fn prepare(conn: Connection) -> Result<Connection> {
    conn.call(|conn| {
        // Off by default in SQLite; status history cascades on job deletion.
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok::<(), tokio_rusqlite::rusqlite::Error>(())
    })
    .await?;

    Ok(conn)
}
