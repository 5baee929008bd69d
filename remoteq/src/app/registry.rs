// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;

use time::OffsetDateTime;
use tokio::sync::{RwLock, oneshot};

use crate::app::errors::{AppError, AppResult};
use crate::app::types::{Job, JobId, JobState};

/// Where post-completion accounting stands for a terminal job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MetricsProgress {
    NotStarted,
    Pending { next_at: OffsetDateTime },
    Settled,
}

/// Engine-side bookkeeping around one job.
pub(crate) struct Tracked {
    pub(crate) job: Job,
    /// Consecutive status checks that did not mention the job.
    pub(crate) missing_cycles: u32,
    pub(crate) metrics: MetricsProgress,
    /// Accounting attempts made after the first one.
    pub(crate) metrics_retries: u32,
    /// A submission for this job is talking to the scheduler.
    submitting: bool,
    notified: bool,
    watchers: Vec<oneshot::Sender<Job>>,
}

impl Tracked {
    fn new(job: Job, watchers: Vec<oneshot::Sender<Job>>) -> Self {
        let finished = job.is_terminal();
        let mut tracked = Self {
            job,
            missing_cycles: 0,
            metrics: if finished {
                MetricsProgress::Settled
            } else {
                MetricsProgress::NotStarted
            },
            metrics_retries: 0,
            submitting: false,
            notified: false,
            watchers,
        };
        if finished {
            tracked.notify();
        }
        tracked
    }

    /// Hands the current snapshot to every watcher. Later calls are no-ops.
    pub(crate) fn notify(&mut self) -> bool {
        if self.notified {
            return false;
        }
        self.notified = true;
        for watcher in self.watchers.drain(..) {
            let _ = watcher.send(self.job.clone());
        }
        true
    }

    pub(crate) fn is_submitting(&self) -> bool {
        self.submitting
    }
}

/// Held by the one submission allowed to run for a job at a time.
#[derive(Debug)]
pub(crate) struct SubmissionClaim {
    /// The claim created the registry entry.
    fresh: bool,
}

/// What became of a job once its claimed submission returned.
#[derive(Debug)]
pub(crate) enum AfterSubmit {
    Tracked(Job),
    /// Tracked, and a cancel arrived while the submission was in flight.
    CancelRequested(Job),
    Untracked(Job),
}

/// What the poller needs to query one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PollTarget {
    pub(crate) id: JobId,
    pub(crate) scheduler: String,
    pub(crate) remote_id: String,
}

/// In-memory set of jobs the engine owns.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Tracked>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the job for one submission. Fails with `Conflict` while
    /// another submission holds it, or once the job left `Created`.
    pub(crate) async fn claim_submission(&self, job: &Job) -> AppResult<SubmissionClaim> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(job.id()) {
            Some(existing) if existing.submitting => Err(AppError::conflict(format!(
                "job {} is already being submitted",
                job.id()
            ))),
            Some(existing) if existing.job.state() != JobState::Created => {
                Err(AppError::conflict(format!(
                    "job {} is already tracked as {}",
                    job.id(),
                    existing.job.state()
                )))
            }
            Some(existing) => {
                existing.submitting = true;
                Ok(SubmissionClaim { fresh: false })
            }
            None => {
                let mut tracked = Tracked::new(job.clone(), Vec::new());
                tracked.submitting = true;
                jobs.insert(job.id().clone(), tracked);
                Ok(SubmissionClaim { fresh: true })
            }
        }
    }

    /// Releases the claim. With `keep` the submitted job replaces the
    /// entry; otherwise an entry the claim created is dropped again. A
    /// cancel recorded meanwhile is carried over: local for jobs that never
    /// reached the scheduler, handed back for the rest.
    pub(crate) async fn finish_submission(
        &self,
        mut job: Job,
        keep: bool,
        claim: SubmissionClaim,
    ) -> AfterSubmit {
        let mut jobs = self.jobs.write().await;
        let id = job.id().clone();
        let cancel_at = jobs.get_mut(&id).and_then(|t| {
            t.submitting = false;
            t.job.cancel_requested_at()
        });

        if !keep {
            if claim.fresh {
                jobs.remove(&id);
            } else if let (Some(at), Some(tracked)) = (cancel_at, jobs.get_mut(&id)) {
                if tracked.job.cancel_unsubmitted(at) {
                    tracked.notify();
                }
            }
            return AfterSubmit::Untracked(job);
        }

        let mut cancel_remote = false;
        if let Some(at) = cancel_at {
            if job.state() == JobState::Created {
                job.cancel_unsubmitted(at);
            } else if !job.is_terminal() {
                cancel_remote = job.request_cancel(at);
            }
        }
        let watchers = jobs
            .remove(&id)
            .map(|previous| previous.watchers)
            .unwrap_or_default();
        jobs.insert(id, Tracked::new(job.clone(), watchers));
        if cancel_remote {
            AfterSubmit::CancelRequested(job)
        } else {
            AfterSubmit::Tracked(job)
        }
    }

    /// Adds a stored job unless the id is already tracked. Finished jobs
    /// that never got metrics are queued for accounting at `now`.
    pub(crate) async fn restore(&self, job: Job, now: OffsetDateTime) -> bool {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(job.id()) {
            return false;
        }
        let awaiting_metrics =
            job.is_terminal() && job.remote_id().is_some() && job.metrics().is_none();
        let mut tracked = Tracked::new(job, Vec::new());
        if awaiting_metrics {
            tracked.metrics = MetricsProgress::Pending { next_at: now };
        }
        jobs.insert(tracked.job.id().clone(), tracked);
        true
    }

    pub async fn get(&self, id: &JobId) -> Option<Job> {
        self.jobs.read().await.get(id).map(|t| t.job.clone())
    }

    /// Snapshots of every tracked job, ordered by local id.
    pub async fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .map(|t| t.job.clone())
            .collect();
        jobs.sort_by(|a, b| a.id().cmp(b.id()));
        jobs
    }

    /// Runs `f` under the write lock for one job.
    pub(crate) async fn update<R>(&self, id: &JobId, f: impl FnOnce(&mut Tracked) -> R) -> Option<R> {
        self.jobs.write().await.get_mut(id).map(f)
    }

    /// Submitted, non-terminal jobs, ordered by local id.
    pub(crate) async fn poll_targets(&self) -> Vec<PollTarget> {
        let mut targets: Vec<PollTarget> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|t| !t.job.is_terminal())
            .filter_map(|t| {
                t.job.remote_id().map(|remote_id| PollTarget {
                    id: t.job.id().clone(),
                    scheduler: t.job.scheduler().to_string(),
                    remote_id: remote_id.to_string(),
                })
            })
            .collect();
        targets.sort_by(|a, b| a.id.cmp(&b.id));
        targets
    }

    /// Submitted, non-terminal jobs with a cancellation request, and when
    /// it was made.
    pub(crate) async fn cancel_requests(&self) -> Vec<(JobId, OffsetDateTime)> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|t| !t.job.is_terminal() && t.job.remote_id().is_some())
            .filter_map(|t| t.job.cancel_requested_at().map(|at| (t.job.id().clone(), at)))
            .collect()
    }

    /// Terminal jobs whose deferred accounting retry is due.
    pub(crate) async fn metrics_due(&self, now: OffsetDateTime) -> Vec<JobId> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|t| matches!(t.metrics, MetricsProgress::Pending { next_at } if next_at <= now))
            .map(|t| t.job.id().clone())
            .collect()
    }

    /// Resolves once the job has finished and its first accounting attempt
    /// is over. Resolves at once for jobs already past that point.
    pub(crate) async fn watch(&self, id: &JobId) -> AppResult<oneshot::Receiver<Job>> {
        let mut jobs = self.jobs.write().await;
        let tracked = jobs
            .get_mut(id)
            .ok_or_else(|| AppError::not_found(format!("job {id} is not tracked")))?;
        let (tx, rx) = oneshot::channel();
        if tracked.notified {
            let _ = tx.send(tracked.job.clone());
        } else {
            tracked.watchers.push(tx);
        }
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::errors::codes;
    use crate::app::types::{JobCommand, MetricsRecord};

    fn submitted(remote_id: &str) -> Job {
        let mut job = Job::new("slurm", JobCommand::shell("true"));
        job.record_submission(remote_id.to_string(), OffsetDateTime::UNIX_EPOCH);
        job
    }

    #[tokio::test]
    async fn only_submitted_live_jobs_are_polled() {
        let registry = JobRegistry::new();
        let live = submitted("1");
        let mut done = submitted("2");
        done.advance(JobState::Completed, OffsetDateTime::UNIX_EPOCH);
        let fresh = Job::new("slurm", JobCommand::shell("true"));

        for job in [live.clone(), done, fresh] {
            assert!(registry.restore(job, OffsetDateTime::UNIX_EPOCH).await);
        }

        let targets = registry.poll_targets().await;
        assert_eq!(targets.len(), 1);
        assert_eq!(&targets[0].id, live.id());
        assert_eq!(targets[0].remote_id, "1");
    }

    #[tokio::test]
    async fn one_submission_at_a_time() {
        let registry = JobRegistry::new();
        let job = Job::new("slurm", JobCommand::shell("true"));

        let claim = registry.claim_submission(&job).await.unwrap();
        let err = registry.claim_submission(&job).await.unwrap_err();
        assert_eq!(err.code(), codes::CONFLICT);
        assert!(registry.update(job.id(), |t| t.is_submitting()).await.unwrap());

        let mut accepted = job.clone();
        accepted.record_submission("1".to_string(), OffsetDateTime::UNIX_EPOCH);
        let after = registry.finish_submission(accepted, true, claim).await;
        assert!(matches!(after, AfterSubmit::Tracked(_)));

        let err = registry.claim_submission(&job).await.unwrap_err();
        assert!(err.message().contains("already tracked as submitted"));
    }

    #[tokio::test]
    async fn untracked_outcome_drops_a_fresh_entry() {
        let registry = JobRegistry::new();
        let job = Job::new("slurm", JobCommand::shell("true"));
        let claim = registry.claim_submission(&job).await.unwrap();

        let after = registry.finish_submission(job.clone(), false, claim).await;
        assert!(matches!(after, AfterSubmit::Untracked(_)));
        assert!(registry.get(job.id()).await.is_none());
    }

    #[tokio::test]
    async fn cancel_during_submission_is_handed_back() {
        let registry = JobRegistry::new();
        let job = Job::new("slurm", JobCommand::shell("true"));
        let claim = registry.claim_submission(&job).await.unwrap();
        registry
            .update(job.id(), |t| t.job.request_cancel(OffsetDateTime::UNIX_EPOCH))
            .await;

        let mut accepted = job.clone();
        accepted.record_submission("1".to_string(), OffsetDateTime::UNIX_EPOCH);
        let AfterSubmit::CancelRequested(handed) =
            registry.finish_submission(accepted, true, claim).await
        else {
            panic!("expected the cancel to be handed back");
        };
        assert_eq!(handed.remote_id(), Some("1"));
        assert!(handed.cancel_requested_at().is_some());
        assert_eq!(registry.cancel_requests().await.len(), 1);
    }

    #[tokio::test]
    async fn cancel_during_undelivered_submission_stays_local() {
        let registry = JobRegistry::new();
        let job = Job::new("slurm", JobCommand::shell("true"));
        let claim = registry.claim_submission(&job).await.unwrap();
        let watcher = registry.watch(job.id()).await.unwrap();
        registry
            .update(job.id(), |t| t.job.request_cancel(OffsetDateTime::UNIX_EPOCH))
            .await;

        let after = registry.finish_submission(job.clone(), true, claim).await;
        let AfterSubmit::Tracked(settled) = after else {
            panic!("expected a tracked job");
        };
        assert_eq!(settled.state(), JobState::Cancelled);
        assert_eq!(watcher.await.unwrap().state(), JobState::Cancelled);
        assert!(registry.cancel_requests().await.is_empty());
    }

    #[tokio::test]
    async fn restored_jobs_without_metrics_are_queued_for_accounting() {
        let registry = JobRegistry::new();
        let mut pending = submitted("1");
        pending.advance(JobState::Completed, OffsetDateTime::UNIX_EPOCH);
        let mut measured = submitted("2");
        measured.advance(JobState::Completed, OffsetDateTime::UNIX_EPOCH);
        measured.attach_metrics(MetricsRecord::default());
        let now = OffsetDateTime::UNIX_EPOCH + time::Duration::hours(1);

        registry.restore(pending.clone(), now).await;
        registry.restore(measured, now).await;
        assert!(!registry.restore(pending.clone(), now).await);

        assert_eq!(registry.metrics_due(now).await, vec![pending.id().clone()]);
    }

    #[tokio::test]
    async fn watchers_are_notified_once() {
        let registry = JobRegistry::new();
        let job = submitted("1");
        let id = job.id().clone();
        registry.restore(job, OffsetDateTime::UNIX_EPOCH).await;

        let rx = registry.watch(&id).await.unwrap();
        let first = registry
            .update(&id, |t| {
                t.job.advance(JobState::Completed, OffsetDateTime::UNIX_EPOCH);
                t.notify()
            })
            .await;
        assert_eq!(first, Some(true));
        assert_eq!(rx.await.unwrap().state(), JobState::Completed);

        let second = registry.update(&id, |t| t.notify()).await;
        assert_eq!(second, Some(false));

        // Late watchers get the final snapshot straight away.
        let late = registry.watch(&id).await.unwrap();
        assert_eq!(late.await.unwrap().state(), JobState::Completed);
    }

    #[tokio::test]
    async fn watching_unknown_job_is_not_found() {
        let registry = JobRegistry::new();
        let err = registry.watch(&JobId::from("job-missing")).await.unwrap_err();
        assert_eq!(err.code(), codes::NOT_FOUND);
    }
}
