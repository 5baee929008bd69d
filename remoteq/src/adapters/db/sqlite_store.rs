// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use async_trait::async_trait;

use crate::adapters::db::{JobStore, JobStoreError};
use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::JobStorePort;
use crate::app::types::Job;

#[derive(Clone)]
pub struct SqliteJobStore {
    store: Arc<JobStore>,
}

impl SqliteJobStore {
    pub fn new(store: JobStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }
}

/// Persistence errors stop here; the app core only sees `AppError`.
fn map_store_error(err: JobStoreError) -> AppError {
    match err {
        JobStoreError::CorruptSnapshot { .. } => AppError::with_message(
            AppErrorKind::Internal,
            codes::STORE_ERROR,
            err.to_string(),
        ),
        JobStoreError::Sqlx(_) | JobStoreError::Serde(_) => AppError::with_message(
            AppErrorKind::Internal,
            codes::STORE_ERROR,
            format!("job store failed: {err}"),
        ),
    }
}

#[async_trait]
impl JobStorePort for SqliteJobStore {
    async fn save_job(&self, job: &Job) -> AppResult<()> {
        self.store.upsert_job(job).await.map_err(map_store_error)
    }

    async fn load_jobs(&self) -> AppResult<Vec<Job>> {
        self.store.list_jobs().await.map_err(map_store_error)
    }
}
