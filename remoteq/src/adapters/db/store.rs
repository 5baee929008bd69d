// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr, time::Duration};
use thiserror::Error;

use crate::app::types::Job;

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("stored snapshot for {id} is unreadable: {reason}")]
    CorruptSnapshot { id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, JobStoreError>;

/// SQLite-backed job snapshots. Each job is one row: a few indexed columns
/// for queries plus the full job as JSON.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (or create) a file-backed SQLite DB.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let url = format!("sqlite://{}", path_ref.to_string_lossy());
        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    /// Open an in-memory store (handy for tests).
    pub async fn open_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        // Improve concurrency for file DBs.
        let _ = sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
              id TEXT PRIMARY KEY,
              scheduler TEXT NOT NULL,
              remote_id TEXT,
              state TEXT NOT NULL,
              snapshot TEXT NOT NULL,
              created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
              updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert or replace the snapshot of `job`.
    pub async fn upsert_job(&self, job: &Job) -> Result<()> {
        let snapshot = serde_json::to_string(job)?;
        sqlx::query(
            r#"
            INSERT INTO jobs (id, scheduler, remote_id, state, snapshot)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              scheduler = excluded.scheduler,
              remote_id = excluded.remote_id,
              state = excluded.state,
              snapshot = excluded.snapshot,
              updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
            "#,
        )
        .bind(job.id().as_str())
        .bind(job.scheduler())
        .bind(job.remote_id())
        .bind(job.state().as_str())
        .bind(snapshot)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All stored jobs, oldest first.
    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT id, snapshot FROM jobs ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                let snapshot: String = row.try_get("snapshot")?;
                serde_json::from_str::<Job>(&snapshot).map_err(|err| {
                    JobStoreError::CorruptSnapshot {
                        id,
                        reason: err.to_string(),
                    }
                })
            })
            .collect()
    }
}
