// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::{StreamExt, stream};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::app::errors::{AccountingErrorKind, AppErrorKind, AppResult};
use crate::app::metrics::MetricsCollector;
use crate::app::ports::{
    BatchAdapter, BatchAdapters, ClockPort, JobStorePort, RawState, RemoteExecPort, StatusReport,
};
use crate::app::registry::{JobRegistry, MetricsProgress, PollTarget, Tracked};
use crate::app::settings::{DisappearancePolicy, EngineSettings};
use crate::app::types::{Job, JobId, JobState, Transition};

/// Counters for one polling cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Jobs included in a status query.
    pub polled: usize,
    pub queries: usize,
    pub failed_queries: usize,
    pub transitions: usize,
    /// Jobs that reached a terminal state this cycle.
    pub finished: usize,
    pub metrics_collected: usize,
}

struct Batch {
    adapter: Arc<dyn BatchAdapter>,
    targets: Vec<PollTarget>,
}

enum Observation<'a> {
    Seen(&'a RawState),
    Missing { explicit: bool },
}

#[derive(Default)]
struct Outcome {
    transitioned: bool,
    finished: bool,
    snapshot: Option<Job>,
}

/// Periodically queries the scheduler for every live job and feeds the
/// answers into the job state machine.
pub struct PollingScheduler {
    registry: Arc<JobRegistry>,
    remote: Arc<dyn RemoteExecPort>,
    adapters: Arc<BatchAdapters>,
    collector: MetricsCollector,
    store: Arc<dyn JobStorePort>,
    clock: Arc<dyn ClockPort>,
    settings: EngineSettings,
}

impl PollingScheduler {
    pub fn new(
        registry: Arc<JobRegistry>,
        remote: Arc<dyn RemoteExecPort>,
        adapters: Arc<BatchAdapters>,
        store: Arc<dyn JobStorePort>,
        clock: Arc<dyn ClockPort>,
        settings: EngineSettings,
    ) -> Self {
        let collector =
            MetricsCollector::new(remote.clone(), adapters.clone(), settings.command_timeout);
        Self {
            registry,
            remote,
            adapters,
            collector,
            store,
            clock,
            settings,
        }
    }

    /// Runs cycles every poll interval until `shutdown` flips to `true` or
    /// its sender goes away. A cycle in progress is finished first.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = self.settings.poll_interval.as_millis() as u64,
            "polling started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    if report.polled > 0 || report.metrics_collected > 0 {
                        tracing::debug!(?report, "polling cycle done");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("polling stopped");
    }

    /// One pass: status queries, disappearance and cancel-grace checks,
    /// then accounting for finished jobs.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        let batches = self.plan_batches(self.registry.poll_targets().await).await;
        report.queries = batches.len();
        report.polled = batches.iter().map(|b| b.targets.len()).sum();

        let answers: Vec<(Batch, AppResult<StatusReport>)> = stream::iter(batches)
            .map(|batch| async move {
                let answer = self.query(&batch).await;
                (batch, answer)
            })
            .buffer_unordered(self.settings.poll_concurrency.max(1))
            .collect()
            .await;

        let now = self.clock.now_utc();
        let mut finished: Vec<JobId> = Vec::new();
        for (batch, answer) in answers {
            let status = match answer {
                Ok(status) => status,
                Err(err) => {
                    report.failed_queries += 1;
                    tracing::warn!(
                        scheduler = batch.adapter.name(),
                        jobs = batch.targets.len(),
                        error = %err,
                        "status query failed"
                    );
                    let message = format!("status query failed: {err}");
                    for target in &batch.targets {
                        let snapshot = self
                            .registry
                            .update(&target.id, |t| {
                                t.job.record_error(message.clone());
                                t.job.clone()
                            })
                            .await;
                        if let Some(job) = snapshot {
                            self.persist(&job).await;
                        }
                    }
                    continue;
                }
            };

            for target in &batch.targets {
                let observation = match status.find(&target.remote_id) {
                    Some(raw) => Observation::Seen(raw),
                    None => Observation::Missing {
                        explicit: status.reported_missing(&target.remote_id),
                    },
                };
                let outcome = self
                    .registry
                    .update(&target.id, |t| {
                        self.apply_observation(t, batch.adapter.as_ref(), observation, now)
                    })
                    .await
                    .unwrap_or_default();
                self.tally(&mut report, &mut finished, &target.id, outcome)
                    .await;
            }
        }

        for (id, requested_at) in self.registry.cancel_requests().await {
            let outcome = self
                .registry
                .update(&id, |t| self.enforce_cancel_grace(t, requested_at, now))
                .await
                .unwrap_or_default();
            self.tally(&mut report, &mut finished, &id, outcome).await;
        }

        for id in &finished {
            if self.collect_metrics(id, false).await {
                report.metrics_collected += 1;
            }
            let snapshot = self
                .registry
                .update(id, |t| {
                    t.notify();
                    t.job.clone()
                })
                .await;
            if let Some(job) = snapshot {
                self.persist(&job).await;
            }
        }

        let due = self.registry.metrics_due(now).await;
        let retried: Vec<bool> = stream::iter(due)
            .map(|id| async move { self.collect_metrics(&id, true).await })
            .buffer_unordered(self.settings.poll_concurrency.max(1))
            .collect()
            .await;
        report.metrics_collected += retried.into_iter().filter(|done| *done).count();
        report
    }

    async fn tally(
        &self,
        report: &mut CycleReport,
        finished: &mut Vec<JobId>,
        id: &JobId,
        outcome: Outcome,
    ) {
        if outcome.transitioned {
            report.transitions += 1;
        }
        if outcome.finished {
            report.finished += 1;
            finished.push(id.clone());
        }
        if let Some(job) = outcome.snapshot {
            self.persist(&job).await;
        }
    }

    /// Groups targets by scheduler and splits each group to the adapter's
    /// batch limit.
    async fn plan_batches(&self, targets: Vec<PollTarget>) -> Vec<Batch> {
        let mut by_scheduler: BTreeMap<String, Vec<PollTarget>> = BTreeMap::new();
        for target in targets {
            by_scheduler
                .entry(target.scheduler.clone())
                .or_default()
                .push(target);
        }

        let mut batches = Vec::new();
        for (scheduler, targets) in by_scheduler {
            let adapter = match self.adapters.get(&scheduler) {
                Ok(adapter) => adapter,
                Err(err) => {
                    tracing::warn!(scheduler = %scheduler, error = %err, "cannot poll jobs");
                    for target in &targets {
                        self.registry
                            .update(&target.id, |t| t.job.record_error(err.to_string()))
                            .await;
                    }
                    continue;
                }
            };
            let size = if adapter.supports_batch_status() {
                adapter.max_batch_size().max(1)
            } else {
                1
            };
            for chunk in targets.chunks(size) {
                batches.push(Batch {
                    adapter: adapter.clone(),
                    targets: chunk.to_vec(),
                });
            }
        }
        batches
    }

    /// Status query with in-cycle retries on transport failures.
    async fn query(&self, batch: &Batch) -> AppResult<StatusReport> {
        let ids: Vec<String> = batch.targets.iter().map(|t| t.remote_id.clone()).collect();
        let command = batch.adapter.render_status_query(&ids)?;
        let retry = &self.settings.cycle_retry;
        let mut attempt: u32 = 0;
        loop {
            match self
                .remote
                .exec_capture(&command, self.settings.command_timeout)
                .await
            {
                Ok(capture) => return batch.adapter.parse_status_response(&capture),
                Err(err) if err.is_transport() && attempt < retry.max_retries => {
                    let delay = retry.delay(attempt);
                    tracing::debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying status query"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn apply_observation(
        &self,
        tracked: &mut Tracked,
        adapter: &dyn BatchAdapter,
        observation: Observation<'_>,
        now: OffsetDateTime,
    ) -> Outcome {
        if tracked.job.is_terminal() {
            return Outcome::default();
        }
        let before = tracked.job.last_error().map(str::to_string);

        let transition = match observation {
            Observation::Seen(raw) => {
                tracked.missing_cycles = 0;
                let observed = adapter.map_state(raw);
                if observed == JobState::Unknown {
                    tracing::warn!(
                        job_id = %tracked.job.id(),
                        raw_state = %raw.state,
                        "unrecognized scheduler state"
                    );
                    tracked
                        .job
                        .record_error(format!("unrecognized scheduler state '{}'", raw.state));
                } else if !matches!(observed, JobState::Failed | JobState::Cancelled) {
                    tracked.job.clear_error();
                }
                let transition = tracked.job.advance(observed, now);
                if tracked.job.is_terminal() {
                    if let Some(code) = raw.exit_code {
                        tracked.job.record_exit_code(code);
                    }
                    explain_terminal(&mut tracked.job, raw);
                }
                transition
            }
            Observation::Missing { explicit } => self.count_missing(tracked, explicit, now),
        };

        log_transition(&tracked.job, transition);
        let changed = !matches!(transition, Transition::Unchanged | Transition::Rejected { .. })
            || tracked.job.last_error() != before.as_deref();
        Outcome {
            transitioned: matches!(transition, Transition::Applied { .. }),
            finished: tracked.job.is_terminal(),
            snapshot: changed.then(|| tracked.job.clone()),
        }
    }

    fn count_missing(&self, tracked: &mut Tracked, explicit: bool, now: OffsetDateTime) -> Transition {
        let threshold = self.settings.disappeared_after.max(1);
        tracked.missing_cycles = match (explicit, self.settings.disappearance_policy) {
            (true, DisappearancePolicy::TrustExplicit) => threshold,
            _ => tracked.missing_cycles.saturating_add(1),
        };
        let misses = tracked.missing_cycles;

        if misses < threshold {
            tracked.job.record_error(format!(
                "job missing from scheduler output ({misses}/{threshold} checks)"
            ));
            return tracked.job.advance(JobState::Unknown, now);
        }

        let (state, reason) = if tracked.job.cancel_requested_at().is_some() {
            (
                JobState::Cancelled,
                "job disappeared from scheduler after cancellation was requested".to_string(),
            )
        } else if explicit && self.settings.disappearance_policy == DisappearancePolicy::TrustExplicit
        {
            (
                JobState::Failed,
                "scheduler reports the job id as unknown".to_string(),
            )
        } else {
            (
                JobState::Failed,
                format!("job disappeared from scheduler after {misses} consecutive status checks"),
            )
        };
        let transition = tracked.job.advance(state, now);
        tracked.job.record_error(reason);
        transition
    }

    fn enforce_cancel_grace(
        &self,
        tracked: &mut Tracked,
        requested_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Outcome {
        if tracked.job.is_terminal() || now - requested_at < self.settings.cancel_grace {
            return Outcome::default();
        }
        let transition = tracked.job.advance(JobState::Cancelled, now);
        tracked.job.record_error(format!(
            "scheduler did not confirm cancellation within {:?}",
            self.settings.cancel_grace
        ));
        log_transition(&tracked.job, transition);
        Outcome {
            transitioned: matches!(transition, Transition::Applied { .. }),
            finished: tracked.job.is_terminal(),
            snapshot: Some(tracked.job.clone()),
        }
    }

    /// One accounting attempt for a terminal job. Returns `true` when
    /// metrics were attached.
    async fn collect_metrics(&self, id: &JobId, deferred: bool) -> bool {
        let Some(job) = self.registry.get(id).await else {
            return false;
        };
        if job.remote_id().is_none() {
            self.registry
                .update(id, |t| t.metrics = MetricsProgress::Settled)
                .await;
            return false;
        }

        let result = self.collector.collect(&job).await;
        let retry_at = self.clock.now_utc() + self.settings.metrics_backoff;
        let max_retries = self.settings.metrics_max_retries;
        let update = self
            .registry
            .update(id, |t| {
                if deferred {
                    t.metrics_retries += 1;
                }
                let collected = match result {
                    Ok(metrics) => {
                        t.metrics = MetricsProgress::Settled;
                        t.job.attach_metrics(metrics)
                    }
                    Err(err)
                        if err.kind() == AppErrorKind::Accounting(AccountingErrorKind::Transient)
                            && t.metrics_retries < max_retries =>
                    {
                        tracing::debug!(
                            job_id = %t.job.id(),
                            retries = t.metrics_retries,
                            error = %err,
                            "accounting not ready; will retry"
                        );
                        t.metrics = MetricsProgress::Pending { next_at: retry_at };
                        false
                    }
                    Err(err) => {
                        tracing::warn!(
                            job_id = %t.job.id(),
                            retries = t.metrics_retries,
                            error = %err,
                            "giving up on accounting"
                        );
                        t.metrics = MetricsProgress::Settled;
                        false
                    }
                };
                (collected, t.job.clone())
            })
            .await;

        match update {
            Some((collected, job)) => {
                if collected {
                    self.persist(&job).await;
                }
                collected
            }
            None => false,
        }
    }

    async fn persist(&self, job: &Job) {
        if let Err(err) = self.store.save_job(job).await {
            tracing::warn!(job_id = %job.id(), error = %err, "failed to persist job snapshot");
        }
    }
}

/// Sets `last_error` for terminal states the caller should hear about.
fn explain_terminal(job: &mut Job, raw: &RawState) {
    match job.state() {
        JobState::Failed => {
            let detail = match raw.exit_code {
                Some(code) => format!("scheduler reported {} (exit code {code})", raw.state),
                None => format!("scheduler reported {}", raw.state),
            };
            job.record_error(detail);
        }
        JobState::Cancelled if job.cancel_requested_at().is_some() => {
            job.record_error(format!(
                "cancelled at caller's request (scheduler reported {})",
                raw.state
            ));
        }
        JobState::Cancelled => {
            job.record_error(format!("cancelled outside remoteq ({})", raw.state));
        }
        _ => {}
    }
}

fn log_transition(job: &Job, transition: Transition) {
    match transition {
        Transition::Applied { from, to } => {
            tracing::info!(job_id = %job.id(), %from, %to, "job state changed");
        }
        Transition::Rejected { current, observed } => {
            tracing::warn!(
                job_id = %job.id(),
                %current,
                %observed,
                "ignoring backward state observation"
            );
        }
        Transition::Unchanged => {}
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::adapters::scheduler::{PbsFlavor, default_adapters};
    use crate::app::ports::NoopJobStore;
    use crate::app::services::backoff::RetryPolicy;
    use crate::app::testing::{ManualClock, ScriptedRemoteExec, at, capture, connection_refused, ok};
    use crate::app::types::JobCommand;

    const SACCT_DONE: &str = "101|COMPLETED|0:0|00:00:05|00:00.500|\n";

    struct Harness {
        remote: Arc<ScriptedRemoteExec>,
        registry: Arc<JobRegistry>,
        clock: Arc<ManualClock>,
        poller: PollingScheduler,
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            cycle_retry: RetryPolicy {
                max_retries: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
            metrics_backoff: Duration::from_secs(10),
            ..EngineSettings::default()
        }
    }

    fn harness(settings: EngineSettings) -> Harness {
        let remote = Arc::new(ScriptedRemoteExec::new());
        let registry = Arc::new(JobRegistry::new());
        let clock = Arc::new(ManualClock::new(at(0)));
        let poller = PollingScheduler::new(
            registry.clone(),
            remote.clone(),
            Arc::new(default_adapters(PbsFlavor::Pro)),
            Arc::new(NoopJobStore),
            clock.clone(),
            settings,
        );
        Harness {
            remote,
            registry,
            clock,
            poller,
        }
    }

    async fn track(h: &Harness, scheduler: &str, remote_id: &str) -> JobId {
        let mut job = Job::new(scheduler, JobCommand::shell("echo hello"));
        job.record_submission(remote_id.to_string(), at(0));
        let id = job.id().clone();
        assert!(h.registry.restore(job, at(0)).await);
        id
    }

    async fn state(h: &Harness, id: &JobId) -> JobState {
        h.registry.get(id).await.unwrap().state()
    }

    #[tokio::test]
    async fn walks_job_to_completion_and_collects_metrics() {
        let h = harness(settings());
        let id = track(&h, "slurm", "101").await;
        let watcher = h.registry.watch(&id).await.unwrap();

        h.remote.on("squeue", ok("101|PENDING\n"));
        h.poller.run_cycle().await;
        assert_eq!(state(&h, &id).await, JobState::Queued);

        h.remote.on("squeue", ok("101|RUNNING\n"));
        h.poller.run_cycle().await;
        assert_eq!(state(&h, &id).await, JobState::Running);

        h.remote.on("squeue", ok("101|COMPLETED|0:0\n"));
        h.remote.on("sacct -j", ok(SACCT_DONE));
        let report = h.poller.run_cycle().await;
        assert_eq!(report.finished, 1);
        assert_eq!(report.metrics_collected, 1);

        let job = watcher.await.unwrap();
        assert_eq!(job.state(), JobState::Completed);
        assert_eq!(job.exit_code(), Some(0));
        assert_eq!(job.metrics().unwrap().wall_time, Some(Duration::from_secs(5)));
        assert!(job.last_error().is_none());

        // Finished jobs drop out of polling.
        assert_eq!(h.poller.run_cycle().await, CycleReport::default());
    }

    #[tokio::test]
    async fn transport_failures_are_retried_within_a_cycle() {
        let h = harness(settings());
        let id = track(&h, "slurm", "101").await;
        h.registry
            .update(&id, |t| t.job.record_error("stale"))
            .await;

        h.remote.on("squeue", connection_refused());
        h.remote.on("squeue", connection_refused());
        h.remote.on("squeue", ok("101|RUNNING\n"));
        let report = h.poller.run_cycle().await;

        assert_eq!(report.failed_queries, 0);
        assert_eq!(h.remote.calls_starting_with("squeue"), 3);
        let job = h.registry.get(&id).await.unwrap();
        assert_eq!(job.state(), JobState::Running);
        assert!(job.last_error().is_none());
    }

    #[tokio::test]
    async fn failed_query_leaves_state_and_records_error() {
        let h = harness(settings());
        let id = track(&h, "slurm", "101").await;
        for _ in 0..3 {
            h.remote.on("squeue", connection_refused());
        }
        let report = h.poller.run_cycle().await;

        assert_eq!(report.failed_queries, 1);
        let job = h.registry.get(&id).await.unwrap();
        assert_eq!(job.state(), JobState::Submitted);
        assert!(job.last_error().unwrap().contains("status query failed"));
    }

    #[tokio::test]
    async fn job_fails_after_disappearing_for_three_cycles() {
        let h = harness(settings());
        let id = track(&h, "slurm", "101").await;
        h.remote.on("squeue", ok("101|RUNNING\n"));
        h.poller.run_cycle().await;

        for _ in 0..2 {
            h.remote.on("squeue", ok(""));
            h.poller.run_cycle().await;
            assert_eq!(state(&h, &id).await, JobState::Unknown);
        }
        h.remote.on("squeue", ok(""));
        h.remote.on("sacct -j", ok(""));
        h.poller.run_cycle().await;

        let job = h.registry.get(&id).await.unwrap();
        assert_eq!(job.state(), JobState::Failed);
        assert!(job.last_error().unwrap().contains("disappeared"));
    }

    #[tokio::test]
    async fn reappearing_job_resets_the_miss_counter() {
        let h = harness(settings());
        let id = track(&h, "slurm", "101").await;
        for reply in ["", "", "101|RUNNING\n", "", ""] {
            h.remote.on("squeue", ok(reply));
            h.poller.run_cycle().await;
        }
        assert_eq!(state(&h, &id).await, JobState::Unknown);
        h.remote.on("squeue", ok("101|RUNNING\n"));
        h.poller.run_cycle().await;
        assert_eq!(state(&h, &id).await, JobState::Running);
    }

    #[tokio::test]
    async fn explicit_unknown_id_fails_at_once_when_trusted() {
        let h = harness(EngineSettings {
            disappearance_policy: DisappearancePolicy::TrustExplicit,
            ..settings()
        });
        let id = track(&h, "pbs", "55.head").await;
        // Status query, then the accounting lookup for the failed job.
        for _ in 0..2 {
            h.remote.on(
                "qstat -x -f",
                Ok(capture("", "qstat: Unknown Job Id 55.head\n", 153)),
            );
        }
        h.poller.run_cycle().await;
        assert_eq!(h.remote.calls_starting_with("qstat"), 2);

        let job = h.registry.get(&id).await.unwrap();
        assert_eq!(job.state(), JobState::Failed);
        assert!(job.last_error().unwrap().contains("unknown"));
    }

    #[tokio::test]
    async fn backward_observations_are_ignored() {
        let h = harness(settings());
        let id = track(&h, "slurm", "101").await;
        h.remote.on("squeue", ok("101|RUNNING\n"));
        h.poller.run_cycle().await;

        h.remote.on("squeue", ok("101|PENDING\n"));
        let report = h.poller.run_cycle().await;

        assert_eq!(report.transitions, 0);
        assert_eq!(state(&h, &id).await, JobState::Running);
    }

    #[tokio::test]
    async fn accounting_is_retried_on_later_cycles() {
        let h = harness(settings());
        let id = track(&h, "slurm", "101").await;
        let watcher = h.registry.watch(&id).await.unwrap();

        h.remote.on("squeue", ok("101|COMPLETED|0:0\n"));
        for _ in 0..3 {
            h.remote.on("sacct -j", ok(""));
        }
        h.remote.on("sacct -j", ok(SACCT_DONE));
        h.poller.run_cycle().await;

        // Notified after the first attempt, before metrics arrive.
        let notified = watcher.await.unwrap();
        assert_eq!(notified.state(), JobState::Completed);
        assert!(notified.metrics().is_none());

        let mut collected = 0;
        for _ in 0..3 {
            h.clock.advance(Duration::from_secs(10));
            collected += h.poller.run_cycle().await.metrics_collected;
        }
        assert_eq!(collected, 1);
        assert_eq!(h.remote.calls_starting_with("sacct -j"), 4);
        let retries = h.registry.update(&id, |t| t.metrics_retries).await;
        assert_eq!(retries, Some(3));
        assert!(h.registry.get(&id).await.unwrap().metrics().is_some());
    }

    #[tokio::test]
    async fn deferred_accounting_waits_for_backoff_and_gives_up() {
        let h = harness(EngineSettings {
            metrics_max_retries: 1,
            ..settings()
        });
        let id = track(&h, "slurm", "101").await;
        h.remote.on("squeue", ok("101|FAILED|1:0\n"));
        h.remote.on("sacct -j", ok(""));
        h.poller.run_cycle().await;

        // Backoff not elapsed: no accounting call.
        h.poller.run_cycle().await;
        assert_eq!(h.remote.calls_starting_with("sacct -j"), 1);

        h.clock.advance(Duration::from_secs(10));
        h.remote.on("sacct -j", ok(""));
        h.poller.run_cycle().await;
        h.clock.advance(Duration::from_secs(10));
        h.poller.run_cycle().await;

        assert_eq!(h.remote.calls_starting_with("sacct -j"), 2);
        let job = h.registry.get(&id).await.unwrap();
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.exit_code(), Some(1));
        assert!(job.metrics().is_none());
        assert!(job.last_error().unwrap().contains("FAILED"));
    }

    #[tokio::test]
    async fn unconfirmed_cancel_is_forced_after_grace() {
        let h = harness(EngineSettings {
            cancel_grace: Duration::from_secs(60),
            ..settings()
        });
        let id = track(&h, "slurm", "101").await;
        h.registry
            .update(&id, |t| t.job.request_cancel(at(0)))
            .await;

        h.remote.on("squeue", ok("101|RUNNING\n"));
        h.poller.run_cycle().await;
        assert_eq!(state(&h, &id).await, JobState::Running);

        h.clock.advance(Duration::from_secs(61));
        h.remote.on("squeue", ok("101|RUNNING\n"));
        h.remote.on("sacct -j", ok("101|CANCELLED by 0|0:15|00:01:01|00:00:01|\n"));
        h.poller.run_cycle().await;
        assert_eq!(state(&h, &id).await, JobState::Cancelled);
    }

    #[tokio::test]
    async fn confirmed_cancel_keeps_a_reason() {
        let h = harness(settings());
        let id = track(&h, "slurm", "101").await;
        h.registry
            .update(&id, |t| {
                t.job.request_cancel(at(0));
                t.job
                    .record_error("cancel command exited with 1: scancel: error: Access denied");
            })
            .await;

        h.remote.on("squeue", ok("101|CANCELLED|0:15\n"));
        h.remote.on("sacct -j", ok("101|CANCELLED by 1000|0:15|00:00:03|00:00.100|\n"));
        h.poller.run_cycle().await;

        let job = h.registry.get(&id).await.unwrap();
        assert_eq!(job.state(), JobState::Cancelled);
        assert_eq!(
            job.last_error(),
            Some("cancelled at caller's request (scheduler reported CANCELLED)")
        );
    }

    #[tokio::test]
    async fn completion_clears_a_stale_error() {
        let h = harness(settings());
        let id = track(&h, "slurm", "101").await;
        h.registry
            .update(&id, |t| t.job.record_error("status query failed: timeout"))
            .await;

        h.remote.on("squeue", ok("101|COMPLETED|0:0\n"));
        h.remote.on("sacct -j", ok(SACCT_DONE));
        h.poller.run_cycle().await;

        let job = h.registry.get(&id).await.unwrap();
        assert_eq!(job.state(), JobState::Completed);
        assert!(job.last_error().is_none());
    }

    #[tokio::test]
    async fn disappearance_after_cancel_means_cancelled() {
        let h = harness(settings());
        let id = track(&h, "slurm", "101").await;
        h.registry
            .update(&id, |t| t.job.request_cancel(at(0)))
            .await;
        h.remote.on("sacct -j", ok(""));
        for _ in 0..3 {
            h.remote.on("squeue", ok(""));
            h.poller.run_cycle().await;
        }
        let job = h.registry.get(&id).await.unwrap();
        assert_eq!(job.state(), JobState::Cancelled);
        assert!(job.last_error().unwrap().contains("cancellation"));
    }

    #[tokio::test]
    async fn jobs_are_batched_per_scheduler() {
        let h = harness(settings());
        let a = track(&h, "slurm", "101").await;
        let b = track(&h, "slurm", "102").await;
        h.remote
            .on("squeue", ok("101|RUNNING\n102|PENDING\n"));

        let report = h.poller.run_cycle().await;

        assert_eq!(report.queries, 1);
        assert_eq!(report.polled, 2);
        assert_eq!(state(&h, &a).await, JobState::Running);
        assert_eq!(state(&h, &b).await, JobState::Queued);
        let query = &h.remote.calls()[0];
        assert!(query.contains("101") && query.contains("102"));
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let h = harness(EngineSettings {
            poll_interval: Duration::from_millis(5),
            ..settings()
        });
        let poller = Arc::new(h.poller);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(poller.run(rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
