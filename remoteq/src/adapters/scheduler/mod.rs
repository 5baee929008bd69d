// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use crate::app::errors::{AppError, AppResult};
use crate::app::ports::BatchAdapters;
use crate::app::services::shell::{ensure_directive_value, ensure_single_line, heredoc, sh_escape};
use crate::app::types::{Job, JobCommand, ResourceRequest};

pub mod pbs;
pub mod slurm;

pub use pbs::{PbsAdapter, PbsFlavor};
pub use slurm::SlurmAdapter;

const SCRIPT_DELIMITER: &str = "REMOTEQ_SCRIPT";
const PAYLOAD_DELIMITER: &str = "REMOTEQ_PAYLOAD";

/// Both built-in adapters, PBS in the given flavor.
pub fn default_adapters(pbs_flavor: PbsFlavor) -> BatchAdapters {
    BatchAdapters::new()
        .register(Arc::new(SlurmAdapter::new()))
        .register(Arc::new(PbsAdapter::new(pbs_flavor)))
}

/// Checks shared by every scheduler family, plus the adapter's list of
/// known `extra` keys.
fn validate_common(resources: &ResourceRequest, known_extra: &[&str]) -> AppResult<()> {
    if resources.cores == Some(0) {
        return Err(AppError::invalid_argument("cores must be at least 1"));
    }
    if resources.nodes == Some(0) {
        return Err(AppError::invalid_argument("nodes must be at least 1"));
    }
    if resources.memory_mb == Some(0) {
        return Err(AppError::invalid_argument("memory must be at least 1 MB"));
    }
    if resources.walltime.is_some_and(|w| w.as_secs() == 0) {
        return Err(AppError::invalid_argument("walltime must be at least one second"));
    }
    for (field, value) in [
        ("queue", &resources.queue),
        ("account", &resources.account),
        ("workdir", &resources.workdir),
        ("stdout path", &resources.stdout_path),
        ("stderr path", &resources.stderr_path),
    ] {
        if let Some(value) = value {
            ensure_directive_value(field, value)?;
        }
    }
    for (key, value) in &resources.extra {
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(AppError::invalid_argument(format!(
                "invalid scheduler option name '{key}'"
            )));
        }
        if !known_extra.contains(&key.as_str()) && !resources.passthrough.contains(key) {
            return Err(AppError::invalid_argument(format!(
                "unknown scheduler option '{key}' (mark it as passthrough to send it anyway)"
            )));
        }
        if !value.is_empty() {
            ensure_directive_value(key, value)?;
        }
    }
    Ok(())
}

/// Remote ids are interpolated into shell commands; keep them to the
/// characters schedulers actually print.
fn ensure_remote_id(remote_id: &str) -> AppResult<()> {
    let valid = !remote_id.is_empty()
        && remote_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '[' | ']'));
    if valid {
        Ok(())
    } else {
        Err(AppError::invalid_argument(format!(
            "malformed remote job id '{remote_id}'"
        )))
    }
}

/// The part of the batch script that runs the job and hands its exit code
/// back to the scheduler.
fn render_job_body(job: &Job, out: &mut String) -> AppResult<()> {
    let id = job.id().as_str();
    out.push_str(&format!("echo \"remoteq: starting {id} on $(hostname)\"\n"));
    match job.command() {
        JobCommand::Shell { command } => {
            if command.trim().is_empty() {
                return Err(AppError::invalid_argument("command must not be empty"));
            }
            out.push_str(&format!("/bin/bash -c {}\n", sh_escape(command)));
        }
        JobCommand::Payload { runner, payload } => {
            ensure_single_line("runner", runner)?;
            let delimiter = format!("{PAYLOAD_DELIMITER}_{id}");
            out.push_str(&heredoc(runner, &delimiter, payload)?);
        }
    }
    out.push_str("exitcode=$?\n");
    out.push_str(&format!(
        "echo \"remoteq: {id} finished with exit code $exitcode\"\n"
    ));
    out.push_str("exit $exitcode\n");
    Ok(())
}

/// Feeds the batch script to `submitter` on stdin.
fn render_submit_command(submitter: &str, job: &Job, script: &str) -> AppResult<String> {
    let delimiter = format!("{SCRIPT_DELIMITER}_{}", job.id());
    heredoc(submitter, &delimiter, script)
}

/// Exit code as `sh` would report it: a signal-killed process reports
/// `128 + signal`.
fn exit_code_from_parts(code: i32, signal: i32) -> i32 {
    if code == 0 && signal != 0 {
        128 + signal
    } else {
        code
    }
}
