// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const JOB_ID_PREFIX: &str = "job-";
const JOB_ID_SUFFIX_LEN: usize = 12;

/// Locally generated job identifier, stable for the lifetime of the job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(JOB_ID_SUFFIX_LEN)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect();
        Self(format!("{JOB_ID_PREFIX}{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Submitted,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Position on the forward path. `Unknown` has none.
    fn rank(self) -> Option<u8> {
        match self {
            JobState::Created => Some(0),
            JobState::Submitted => Some(1),
            JobState::Queued => Some(2),
            JobState::Running => Some(3),
            JobState::Completed | JobState::Failed | JobState::Cancelled => Some(4),
            JobState::Unknown => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Submitted => "submitted",
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the job runs on the compute node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobCommand {
    /// A literal shell command line.
    Shell { command: String },
    /// A serialized function call fed on stdin to `runner` (e.g. `python3 -`).
    Payload { runner: String, payload: String },
}

impl JobCommand {
    pub fn shell(command: impl Into<String>) -> Self {
        JobCommand::Shell {
            command: command.into(),
        }
    }
}

/// Resources requested from the scheduler. Absent fields fall back to the
/// scheduler's own defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequest {
    pub cores: Option<u32>,
    pub nodes: Option<u32>,
    pub memory_mb: Option<u64>,
    pub walltime: Option<Duration>,
    /// Partition (SLURM) or queue (PBS).
    pub queue: Option<String>,
    pub account: Option<String>,
    pub workdir: Option<String>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub exclusive: bool,
    /// Adapter-specific directives, rendered verbatim by the adapter.
    pub extra: BTreeMap<String, String>,
    /// `extra` keys the adapter should accept even if it does not know them.
    pub passthrough: BTreeSet<String>,
}

/// Post-completion accounting for a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub wall_time: Option<Duration>,
    pub cpu_time: Option<Duration>,
    pub max_memory_bytes: Option<u64>,
    pub exit_status: Option<i32>,
}

/// Outcome of feeding one observation into a job's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied { from: JobState, to: JobState },
    Unchanged,
    /// Observation would move the job backwards or out of a terminal state.
    Rejected { current: JobState, observed: JobState },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    remote_id: Option<String>,
    scheduler: String,
    name: Option<String>,
    command: JobCommand,
    #[serde(default)]
    resources: ResourceRequest,
    state: JobState,
    /// Latest state other than `Unknown`; bounds how far back an
    /// ambiguous job may resolve.
    last_definite: JobState,
    #[serde(default, with = "time::serde::rfc3339::option")]
    submit_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    start_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    end_time: Option<OffsetDateTime>,
    exit_code: Option<i32>,
    metrics: Option<MetricsRecord>,
    last_error: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    cancel_requested_at: Option<OffsetDateTime>,
}

impl Job {
    pub fn new(scheduler: impl Into<String>, command: JobCommand) -> Self {
        Self {
            id: JobId::generate(),
            remote_id: None,
            scheduler: scheduler.into(),
            name: None,
            command,
            resources: ResourceRequest::default(),
            state: JobState::Created,
            last_definite: JobState::Created,
            submit_time: None,
            start_time: None,
            end_time: None,
            exit_code: None,
            metrics: None,
            last_error: None,
            cancel_requested_at: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn scheduler(&self) -> &str {
        &self.scheduler
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name handed to the scheduler: the caller's name or the local id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }

    pub fn command(&self) -> &JobCommand {
        &self.command
    }

    pub fn resources(&self) -> &ResourceRequest {
        &self.resources
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn submit_time(&self) -> Option<OffsetDateTime> {
        self.submit_time
    }

    pub fn start_time(&self) -> Option<OffsetDateTime> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<OffsetDateTime> {
        self.end_time
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn metrics(&self) -> Option<&MetricsRecord> {
        self.metrics.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn cancel_requested_at(&self) -> Option<OffsetDateTime> {
        self.cancel_requested_at
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub(crate) fn record_submission(&mut self, remote_id: String, at: OffsetDateTime) {
        self.remote_id = Some(remote_id);
        self.submit_time = Some(at);
        self.state = JobState::Submitted;
        self.last_definite = JobState::Submitted;
        self.last_error = None;
    }

    /// The scheduler refused the job; it never got a remote id.
    pub(crate) fn reject_submission(&mut self, reason: impl Into<String>, at: OffsetDateTime) {
        self.state = JobState::Failed;
        self.last_definite = JobState::Failed;
        self.end_time = Some(at);
        self.last_error = Some(reason.into());
    }

    pub(crate) fn record_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }

    pub(crate) fn clear_error(&mut self) {
        self.last_error = None;
    }

    pub(crate) fn record_exit_code(&mut self, code: i32) {
        if self.exit_code.is_none() {
            self.exit_code = Some(code);
        }
    }

    /// Returns `false` if cancellation had already been requested.
    pub(crate) fn request_cancel(&mut self, at: OffsetDateTime) -> bool {
        if self.cancel_requested_at.is_some() {
            return false;
        }
        self.cancel_requested_at = Some(at);
        true
    }

    /// Cancels a job that never reached the scheduler.
    pub(crate) fn cancel_unsubmitted(&mut self, at: OffsetDateTime) -> bool {
        if self.state != JobState::Created {
            return false;
        }
        self.state = JobState::Cancelled;
        self.last_definite = JobState::Cancelled;
        self.cancel_requested_at.get_or_insert(at);
        self.end_time = Some(at);
        self.last_error = Some("cancelled before submission".to_string());
        true
    }

    /// Metrics only stick to terminal jobs. The exit status fills in a
    /// missing exit code.
    pub(crate) fn attach_metrics(&mut self, metrics: MetricsRecord) -> bool {
        if !self.is_terminal() {
            return false;
        }
        if let Some(code) = metrics.exit_status {
            self.record_exit_code(code);
        }
        self.metrics = Some(metrics);
        true
    }

    /// Feed an observed state into the job. Only forward moves are applied;
    /// `Unknown` may be entered from any submitted, non-terminal state and
    /// resolves to a state no earlier than the last definite one.
    pub(crate) fn advance(&mut self, observed: JobState, at: OffsetDateTime) -> Transition {
        let current = self.state;
        if current.is_terminal() || current == JobState::Created {
            return if observed == current {
                Transition::Unchanged
            } else {
                Transition::Rejected { current, observed }
            };
        }

        if observed == JobState::Unknown {
            if current == JobState::Unknown {
                return Transition::Unchanged;
            }
            self.state = JobState::Unknown;
            return Transition::Applied {
                from: current,
                to: JobState::Unknown,
            };
        }

        let (Some(seen), Some(floor)) = (observed.rank(), self.last_definite.rank()) else {
            return Transition::Rejected { current, observed };
        };
        if seen < floor {
            return Transition::Rejected { current, observed };
        }
        if observed == current {
            return Transition::Unchanged;
        }

        self.state = observed;
        self.last_definite = observed;
        if observed == JobState::Running && self.start_time.is_none() {
            self.start_time = Some(at);
        }
        if observed.is_terminal() && self.end_time.is_none() {
            self.end_time = Some(at);
        }
        Transition::Applied {
            from: current,
            to: observed,
        }
    }
}
