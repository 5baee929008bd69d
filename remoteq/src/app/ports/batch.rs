// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::app::errors::{AppError, AppResult};
use crate::app::ports::ExecCapture;
use crate::app::types::{Job, JobState, MetricsRecord, ResourceRequest};

/// A scheduler-native status as printed by its query tools.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawState {
    pub state: String,
    pub exit_code: Option<i32>,
}

impl RawState {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            exit_code: None,
        }
    }
}

/// Parsed answer to one batched status query.
///
/// Ids absent from both maps were silently missing from the output; ids in
/// `not_found` were explicitly reported unknown by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub states: HashMap<String, RawState>,
    pub not_found: HashSet<String>,
}

fn short_id(id: &str) -> &str {
    id.split('.').next().unwrap_or(id)
}

impl StatusReport {
    /// Looks up a remote id, falling back to the numeric part before the
    /// first `.` (PBS prints `123.server` for a job submitted as
    /// `123.server.domain`).
    pub fn find(&self, remote_id: &str) -> Option<&RawState> {
        if let Some(raw) = self.states.get(remote_id) {
            return Some(raw);
        }
        let wanted = short_id(remote_id);
        self.states
            .iter()
            .find(|(id, _)| short_id(id) == wanted)
            .map(|(_, raw)| raw)
    }

    pub fn reported_missing(&self, remote_id: &str) -> bool {
        let wanted = short_id(remote_id);
        self.not_found.contains(remote_id)
            || self.not_found.iter().any(|id| short_id(id) == wanted)
    }
}

/// Translates the job model to one scheduler family's command syntax and back.
/// Every method is pure: adapters build command text and parse captured
/// output, the remote connector runs it.
pub trait BatchAdapter: Send + Sync {
    /// Registry key stored on each job (`"slurm"`, `"pbs"`).
    fn name(&self) -> &'static str;

    /// Scheduler versions and flag dialect the rendered commands target.
    fn dialect(&self) -> &'static str;

    fn validate(&self, resources: &ResourceRequest) -> AppResult<()>;

    /// Batch script for the job. Same job, same text.
    fn render_submission(&self, job: &Job) -> AppResult<String>;

    /// Remote command that hands `script` to the submitter.
    fn submit_command(&self, job: &Job, script: &str) -> AppResult<String>;

    /// Extracts the scheduler-assigned id, or a `Submission` error when the
    /// output does not carry one (even with exit code 0).
    fn parse_submission_result(&self, capture: &ExecCapture) -> AppResult<String>;

    fn supports_batch_status(&self) -> bool {
        false
    }

    fn max_batch_size(&self) -> usize {
        1
    }

    /// Fails with `UnsupportedOperation` when asked for more ids than the
    /// adapter can serve in one query.
    fn render_status_query(&self, remote_ids: &[String]) -> AppResult<String>;

    fn parse_status_response(&self, capture: &ExecCapture) -> AppResult<StatusReport>;

    /// Total over raw states; anything undocumented maps to `Unknown`.
    fn map_state(&self, raw: &RawState) -> JobState;

    fn render_cancel(&self, remote_id: &str) -> AppResult<String>;

    fn render_accounting_query(&self, remote_id: &str) -> AppResult<String>;

    fn parse_accounting(&self, remote_id: &str, capture: &ExecCapture)
    -> AppResult<MetricsRecord>;
}

/// Adapters keyed by name.
#[derive(Clone, Default)]
pub struct BatchAdapters {
    by_name: HashMap<String, Arc<dyn BatchAdapter>>,
}

impl BatchAdapters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, adapter: Arc<dyn BatchAdapter>) -> Self {
        self.by_name.insert(adapter.name().to_string(), adapter);
        self
    }

    pub fn get(&self, name: &str) -> AppResult<Arc<dyn BatchAdapter>> {
        self.by_name.get(name).cloned().ok_or_else(|| {
            AppError::invalid_argument(format!(
                "no batch adapter registered for scheduler '{name}' (known: {})",
                self.names().join(", ")
            ))
        })
    }

    /// Registered scheduler names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Shared guard for the scheduler-side batch limit.
pub fn ensure_batch_fits(adapter: &dyn BatchAdapter, remote_ids: &[String]) -> AppResult<()> {
    if remote_ids.is_empty() {
        return Err(AppError::invalid_argument("status query needs at least one id"));
    }
    let limit = if adapter.supports_batch_status() {
        adapter.max_batch_size()
    } else {
        1
    };
    if remote_ids.len() > limit {
        return Err(AppError::unsupported(format!(
            "{} status query accepts at most {limit} ids, got {}",
            adapter.name(),
            remote_ids.len()
        )));
    }
    Ok(())
}
