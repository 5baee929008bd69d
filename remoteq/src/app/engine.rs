// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::app::errors::{AppError, AppResult};
use crate::app::polling::{CycleReport, PollingScheduler};
use crate::app::ports::{BatchAdapters, ClockPort, JobStorePort, RemoteExecPort};
use crate::app::registry::{AfterSubmit, JobRegistry};
use crate::app::settings::EngineSettings;
use crate::app::submission::SubmissionEngine;
use crate::app::types::{Job, JobId, JobState};

/// Everything the engine talks to.
pub struct EnginePorts {
    pub remote: Arc<dyn RemoteExecPort>,
    pub adapters: BatchAdapters,
    pub store: Arc<dyn JobStorePort>,
    pub clock: Arc<dyn ClockPort>,
}

/// A submission that did not produce a running job. `job` is the caller's
/// job in its resulting state: `Failed` when the scheduler refused it,
/// still `Created` when the request never got through.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SubmitFailure {
    pub job: Box<Job>,
    pub error: AppError,
}

/// Stored jobs picked up by `JobEngine::restore`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Submitted jobs that still need polling.
    pub live: usize,
    /// Finished jobs queued for another accounting attempt.
    pub awaiting_metrics: usize,
}

enum CancelStep {
    Done(Job),
    Issue(Job),
}

/// Submit, track, cancel and await jobs on one remote cluster.
pub struct JobEngine {
    registry: Arc<JobRegistry>,
    submission: SubmissionEngine,
    poller: Arc<PollingScheduler>,
    remote: Arc<dyn RemoteExecPort>,
    adapters: Arc<BatchAdapters>,
    store: Arc<dyn JobStorePort>,
    clock: Arc<dyn ClockPort>,
    settings: EngineSettings,
}

impl JobEngine {
    pub fn new(ports: EnginePorts, settings: EngineSettings) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let adapters = Arc::new(ports.adapters);
        let submission = SubmissionEngine::new(
            ports.remote.clone(),
            adapters.clone(),
            ports.clock.clone(),
            settings.command_timeout,
        );
        let poller = Arc::new(PollingScheduler::new(
            registry.clone(),
            ports.remote.clone(),
            adapters.clone(),
            ports.store.clone(),
            ports.clock.clone(),
            settings.clone(),
        ));
        Self {
            registry,
            submission,
            poller,
            remote: ports.remote,
            adapters,
            store: ports.store,
            clock: ports.clock,
            settings,
        }
    }

    pub fn adapters(&self) -> &BatchAdapters {
        &self.adapters
    }

    /// Submits the job and starts tracking it.
    ///
    /// Jobs refused by the scheduler are tracked too, already `Failed`, so
    /// watchers and listings see them. Jobs whose submission never got
    /// through stay `Created` and may be passed in again. Only one
    /// submission per job runs at a time; a concurrent one gets `Conflict`.
    pub async fn submit(&self, mut job: Job) -> Result<Job, SubmitFailure> {
        let claim = match self.registry.claim_submission(&job).await {
            Ok(claim) => claim,
            Err(error) => {
                return Err(SubmitFailure {
                    job: Box::new(job),
                    error,
                });
            }
        };

        let outcome = self.submission.submit(&mut job).await;
        let keep = match &outcome {
            Ok(()) => true,
            Err(err) => err.is_transport() || job.state() == JobState::Failed,
        };
        let job = match self.registry.finish_submission(job, keep, claim).await {
            AfterSubmit::Tracked(job) => {
                self.persist(&job).await;
                job
            }
            AfterSubmit::CancelRequested(job) => {
                tracing::info!(job_id = %job.id(), "cancel arrived during submission");
                self.persist(&job).await;
                let job = match self.issue_cancel(job.clone()).await {
                    Ok(updated) => updated,
                    Err(err) => {
                        tracing::warn!(job_id = %job.id(), error = %err, "cancel not issued");
                        job
                    }
                };
                self.persist(&job).await;
                job
            }
            AfterSubmit::Untracked(job) => job,
        };
        match outcome {
            Ok(()) => Ok(job),
            Err(error) => Err(SubmitFailure {
                job: Box::new(job),
                error,
            }),
        }
    }

    pub async fn get(&self, id: &JobId) -> Option<Job> {
        self.registry.get(id).await
    }

    pub async fn list_tracked(&self) -> Vec<Job> {
        self.registry.list().await
    }

    /// Resolves with the final snapshot once the job is terminal and its
    /// first accounting attempt is over.
    pub async fn watch(&self, id: &JobId) -> AppResult<oneshot::Receiver<Job>> {
        self.registry.watch(id).await
    }

    /// `watch` and wait for it.
    pub async fn wait(&self, id: &JobId) -> AppResult<Job> {
        self.watch(id)
            .await?
            .await
            .map_err(|_| AppError::internal(format!("engine dropped watcher for job {id}")))
    }

    /// Requests cancellation. Idempotent: only the first request for a
    /// submitted job reaches the scheduler, and terminal jobs are returned
    /// as they are. The job turns `Cancelled` once the scheduler confirms,
    /// or after the cancel grace period.
    #[tracing::instrument(name = "cancel", skip(self), fields(job_id = %id))]
    pub async fn cancel(&self, id: &JobId) -> AppResult<Job> {
        let now = self.clock.now_utc();
        let step = self
            .registry
            .update(id, |t| {
                if t.job.is_terminal() {
                    return CancelStep::Done(t.job.clone());
                }
                if t.is_submitting() {
                    // Picked up by `submit` once the scheduler answers.
                    t.job.request_cancel(now);
                    return CancelStep::Done(t.job.clone());
                }
                if t.job.state() == JobState::Created {
                    t.job.cancel_unsubmitted(now);
                    t.notify();
                    return CancelStep::Done(t.job.clone());
                }
                if t.job.request_cancel(now) {
                    CancelStep::Issue(t.job.clone())
                } else {
                    CancelStep::Done(t.job.clone())
                }
            })
            .await
            .ok_or_else(|| AppError::not_found(format!("job {id} is not tracked")))?;

        let job = match step {
            CancelStep::Done(job) => {
                tracing::debug!(state = %job.state(), "nothing to cancel");
                job
            }
            CancelStep::Issue(job) => self.issue_cancel(job).await?,
        };
        self.persist(&job).await;
        Ok(job)
    }

    async fn issue_cancel(&self, job: Job) -> AppResult<Job> {
        let remote_id = job
            .remote_id()
            .ok_or_else(|| AppError::internal(format!("submitted job {} has no remote id", job.id())))?;
        let adapter = self.adapters.get(job.scheduler())?;
        let command = adapter.render_cancel(remote_id)?;

        let problem = match self
            .remote
            .exec_capture(&command, self.settings.command_timeout)
            .await
        {
            Ok(capture) if capture.exit_code == 0 => {
                tracing::info!(remote_id, "cancel sent to scheduler");
                None
            }
            Ok(capture) => Some(format!(
                "cancel command exited with {}: {}",
                capture.exit_code,
                capture.stderr_text().trim()
            )),
            Err(err) => Some(format!("cancel command not delivered: {err}")),
        };

        let updated = self
            .registry
            .update(job.id(), |t| {
                if let Some(problem) = problem {
                    tracing::warn!(problem = %problem, "cancel not confirmed; waiting for grace period");
                    if !t.job.is_terminal() {
                        t.job.record_error(problem);
                    }
                }
                t.job.clone()
            })
            .await;
        Ok(updated.unwrap_or(job))
    }

    /// One polling cycle, outside the background loop.
    pub async fn poll_once(&self) -> CycleReport {
        self.poller.run_cycle().await
    }

    /// Spawns the polling loop. It stops once `shutdown` flips to `true`.
    pub fn start_polling(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let poller = self.poller.clone();
        tokio::spawn(poller.run(shutdown))
    }

    /// Loads stored jobs into the registry. Finished jobs still missing
    /// metrics get another round of accounting on the next cycle.
    pub async fn restore(&self) -> AppResult<RestoreSummary> {
        let jobs = self.store.load_jobs().await?;
        let now = self.clock.now_utc();
        let mut summary = RestoreSummary::default();
        for job in jobs {
            let pollable = !job.is_terminal() && job.remote_id().is_some();
            let awaiting_metrics =
                job.is_terminal() && job.remote_id().is_some() && job.metrics().is_none();
            if !self.registry.restore(job, now).await {
                continue;
            }
            if pollable {
                summary.live += 1;
            }
            if awaiting_metrics {
                summary.awaiting_metrics += 1;
            }
        }
        tracing::info!(
            live = summary.live,
            awaiting_metrics = summary.awaiting_metrics,
            "restored jobs from store"
        );
        Ok(summary)
    }

    async fn persist(&self, job: &Job) {
        if let Err(err) = self.store.save_job(job).await {
            tracing::warn!(job_id = %job.id(), error = %err, "failed to persist job snapshot");
        }
    }
}
