// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;
use std::time::Duration;

use crate::app::errors::{AppError, AppResult};
use crate::app::ports::{BatchAdapters, RemoteExecPort};
use crate::app::types::{Job, MetricsRecord};

/// Fetches accounting data for finished jobs. Any failure is an
/// `Accounting` error so callers can decide whether to retry; it never
/// touches the job itself.
pub struct MetricsCollector {
    remote: Arc<dyn RemoteExecPort>,
    adapters: Arc<BatchAdapters>,
    command_timeout: Duration,
}

impl MetricsCollector {
    pub fn new(
        remote: Arc<dyn RemoteExecPort>,
        adapters: Arc<BatchAdapters>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            remote,
            adapters,
            command_timeout,
        }
    }

    #[tracing::instrument(
        name = "metrics",
        skip_all,
        fields(job_id = %job.id(), remote_id = job.remote_id().unwrap_or("-"))
    )]
    pub async fn collect(&self, job: &Job) -> AppResult<MetricsRecord> {
        if !job.is_terminal() {
            return Err(AppError::invalid_argument(format!(
                "job {} is still {}",
                job.id(),
                job.state()
            )));
        }
        let remote_id = job.remote_id().ok_or_else(|| {
            AppError::accounting_permanent("job never reached the scheduler")
        })?;
        let adapter = self.adapters.get(job.scheduler())?;
        let query = adapter.render_accounting_query(remote_id)?;
        let capture = self
            .remote
            .exec_capture(&query, self.command_timeout)
            .await
            .map_err(|err| {
                if err.is_transport() {
                    AppError::accounting_transient(format!("accounting query not delivered: {err}"))
                } else {
                    err
                }
            })?;
        let metrics = adapter.parse_accounting(remote_id, &capture)?;
        tracing::debug!(?metrics, "accounting collected");
        Ok(metrics)
    }
}
