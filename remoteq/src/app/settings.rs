// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::time::Duration;

use serde::Deserialize;

use crate::app::services::backoff::RetryPolicy;

/// How a job missing from status output counts toward disappearance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisappearancePolicy {
    /// Every miss counts once, whether or not the scheduler said "unknown id".
    #[default]
    Uniform,
    /// An explicit "unknown job id" answer fails the job at once; silent
    /// absence still needs the full run of misses.
    TrustExplicit,
}

/// Tunables for submission, polling and metrics collection.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Upper bound for any single remote command.
    pub command_timeout: Duration,
    pub poll_interval: Duration,
    /// Status queries in flight at once; normally the SSH pool size.
    pub poll_concurrency: usize,
    /// Transport retries for a status query within one cycle.
    pub cycle_retry: RetryPolicy,
    pub disappeared_after: u32,
    pub disappearance_policy: DisappearancePolicy,
    pub cancel_grace: Duration,
    pub metrics_max_retries: u32,
    pub metrics_backoff: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(30),
            poll_concurrency: 4,
            cycle_retry: RetryPolicy {
                max_retries: 2,
                initial_backoff: Duration::from_millis(500),
                max_backoff: Duration::from_secs(5),
            },
            disappeared_after: 3,
            disappearance_policy: DisappearancePolicy::Uniform,
            cancel_grace: Duration::from_secs(120),
            metrics_max_retries: 5,
            metrics_backoff: Duration::from_secs(60),
        }
    }
}
