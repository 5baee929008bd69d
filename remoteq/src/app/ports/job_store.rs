// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::Job;

#[async_trait]
/// Durable snapshots of tracked jobs so a restarted process can resume
/// polling them.
pub trait JobStorePort: Send + Sync {
    async fn save_job(&self, job: &Job) -> AppResult<()>;
    async fn load_jobs(&self) -> AppResult<Vec<Job>>;
}

/// Store that keeps nothing; used when persistence is not wanted.
pub struct NoopJobStore;

#[async_trait]
impl JobStorePort for NoopJobStore {
    async fn save_job(&self, _job: &Job) -> AppResult<()> {
        Ok(())
    }

    async fn load_jobs(&self) -> AppResult<Vec<Job>> {
        Ok(Vec::new())
    }
}
