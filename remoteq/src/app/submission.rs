// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;
use std::time::Duration;

use crate::app::errors::{AppError, AppResult};
use crate::app::ports::{BatchAdapters, ClockPort, RemoteExecPort};
use crate::app::types::{Job, JobState};

/// Renders a job through its adapter and hands it to the scheduler.
pub struct SubmissionEngine {
    remote: Arc<dyn RemoteExecPort>,
    adapters: Arc<BatchAdapters>,
    clock: Arc<dyn ClockPort>,
    command_timeout: Duration,
}

impl SubmissionEngine {
    pub fn new(
        remote: Arc<dyn RemoteExecPort>,
        adapters: Arc<BatchAdapters>,
        clock: Arc<dyn ClockPort>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            remote,
            adapters,
            clock,
            command_timeout,
        }
    }

    /// Submits a `Created` job.
    ///
    /// * accepted: the job becomes `Submitted` with its remote id.
    /// * refused by the scheduler: the job becomes `Failed` with the reason
    ///   and no remote id.
    /// * transport failure: the job stays `Created` with `last_error` set,
    ///   so the caller may submit it again.
    ///
    /// Validation errors leave the job untouched.
    #[tracing::instrument(
        name = "submit",
        skip_all,
        fields(job_id = %job.id(), scheduler = job.scheduler())
    )]
    pub async fn submit(&self, job: &mut Job) -> AppResult<()> {
        if job.state() != JobState::Created {
            return Err(AppError::conflict(format!(
                "job {} was already submitted ({})",
                job.id(),
                job.state()
            )));
        }
        let adapter = self.adapters.get(job.scheduler())?;
        adapter.validate(job.resources())?;
        let script = adapter.render_submission(job)?;
        let command = adapter.submit_command(job, &script)?;

        let capture = match self.remote.exec_capture(&command, self.command_timeout).await {
            Ok(capture) => capture,
            Err(err) => {
                tracing::warn!(error = %err, "submission did not reach the scheduler");
                job.record_error(format!("submission not delivered: {err}"));
                return Err(err);
            }
        };

        match adapter.parse_submission_result(&capture) {
            Ok(remote_id) => {
                tracing::info!(remote_id = %remote_id, "job accepted by scheduler");
                job.record_submission(remote_id, self.clock.now_utc());
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "scheduler refused job");
                job.reject_submission(err.to_string(), self.clock.now_utc());
                Err(err)
            }
        }
    }
}
