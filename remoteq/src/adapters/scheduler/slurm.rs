// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::batch::ensure_batch_fits;
use crate::app::ports::{BatchAdapter, ExecCapture, RawState, StatusReport};
use crate::app::services::shell::{ensure_directive_value, sh_escape};
use crate::app::services::units::{
    format_slurm_walltime, parse_clock_duration, parse_memory_bytes,
};
use crate::app::types::{Job, JobState, MetricsRecord, ResourceRequest};

use super::{
    ensure_remote_id, exit_code_from_parts, render_job_body, render_submit_command,
    validate_common,
};

const MAX_BATCH: usize = 200;

/// sbatch options accepted in `extra` without a passthrough mark.
const KNOWN_EXTRA: &[&str] = &[
    "qos",
    "constraint",
    "gres",
    "gpus",
    "gpus-per-node",
    "mem-per-cpu",
    "ntasks",
    "ntasks-per-node",
    "reservation",
    "licenses",
    "nodelist",
    "exclude",
    "mail-type",
    "mail-user",
    "comment",
];

const ACCOUNTING_FIELDS: &str = "JobID,State,ExitCode,Elapsed,TotalCPU,MaxRSS";

/// `sbatch`/`squeue`/`sacct`/`scancel`.
#[derive(Debug, Clone, Default)]
pub struct SlurmAdapter;

impl SlurmAdapter {
    pub fn new() -> Self {
        Self
    }
}

/// Picks the id out of `Submitted batch job 11` (or `--parsable` output
/// `11;cluster`). Array submissions keep the part before `_`.
pub fn parse_job_id(line: &str) -> Option<String> {
    let marker = "job ";
    let candidate = match line.find(marker) {
        Some(idx) => &line[idx + marker.len()..],
        None => line,
    };
    let candidate = candidate.trim();
    let candidate = candidate.split(';').next().unwrap_or(candidate);
    let candidate = candidate.split('_').next().unwrap_or(candidate);
    if !candidate.is_empty() && candidate.chars().all(|c| c.is_ascii_digit()) {
        Some(candidate.to_string())
    } else {
        None
    }
}

/// `CANCELLED by 1000`, `COMPLETED+`, `FAILED(…)` all reduce to the bare
/// state word.
fn normalize_slurm_state(state: &str) -> String {
    let token = state
        .split(['+', ':', '(', ' '])
        .next()
        .unwrap_or(state)
        .trim();
    token.to_ascii_uppercase()
}

/// `ExitCode` column, `code:signal`.
fn parse_exit_code(field: &str) -> Option<i32> {
    let field = field.trim();
    if field.is_empty() {
        return None;
    }
    let (code, signal) = field.split_once(':').unwrap_or((field, "0"));
    let code = code.parse::<i32>().ok()?;
    let signal = signal.parse::<i32>().unwrap_or(0);
    Some(exit_code_from_parts(code, signal))
}

fn is_slurm_state_active(state: &str) -> bool {
    matches!(
        state,
        "PENDING"
            | "RUNNING"
            | "CONFIGURING"
            | "COMPLETING"
            | "SUSPENDED"
            | "STOPPED"
            | "RESIZING"
            | "REQUEUED"
            | "REQUEUE_HOLD"
            | "REQUEUE_FED"
            | "RESV_DEL_HOLD"
            | "STAGE_OUT"
            | "STAGE_IN"
            | "SIGNALING"
    )
}

fn is_accounting_disabled(stderr: &str) -> bool {
    stderr
        .to_ascii_lowercase()
        .contains("accounting storage is disabled")
}

struct AccountingRow<'a> {
    job_id: &'a str,
    state: &'a str,
    exit_code: &'a str,
    elapsed: &'a str,
    total_cpu: &'a str,
    max_rss: &'a str,
}

fn parse_accounting_rows(stdout: &str) -> Vec<AccountingRow<'_>> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('|').collect();
            match fields.as_slice() {
                [job_id, state, exit_code, elapsed, total_cpu, max_rss, ..] => {
                    Some(AccountingRow {
                        job_id,
                        state,
                        exit_code,
                        elapsed,
                        total_cpu,
                        max_rss,
                    })
                }
                _ => None,
            }
        })
        .collect()
}

impl BatchAdapter for SlurmAdapter {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn dialect(&self) -> &'static str {
        "Slurm 20.11+ (sbatch --chdir, squeue -t all, sacct -P -X)"
    }

    fn validate(&self, resources: &ResourceRequest) -> AppResult<()> {
        validate_common(resources, KNOWN_EXTRA)
    }

    fn render_submission(&self, job: &Job) -> AppResult<String> {
        let resources = job.resources();
        let name = job.display_name();
        ensure_directive_value("job name", name)?;

        let mut out = String::from("#!/bin/bash\n");
        let mut directive = |flag: String| {
            out.push_str("#SBATCH ");
            out.push_str(&flag);
            out.push('\n');
        };
        directive(format!("--job-name={name}"));
        if let Some(nodes) = resources.nodes {
            directive(format!("--nodes={nodes}"));
        }
        if let Some(cores) = resources.cores {
            directive(format!("--cpus-per-task={cores}"));
        }
        if let Some(memory) = resources.memory_mb {
            directive(format!("--mem={memory}M"));
        }
        if let Some(walltime) = resources.walltime {
            directive(format!("--time={}", format_slurm_walltime(walltime)));
        }
        if let Some(queue) = &resources.queue {
            directive(format!("--partition={queue}"));
        }
        if let Some(account) = &resources.account {
            directive(format!("--account={account}"));
        }
        if let Some(workdir) = &resources.workdir {
            directive(format!("--chdir={workdir}"));
        }
        if let Some(path) = &resources.stdout_path {
            directive(format!("--output={path}"));
        }
        if let Some(path) = &resources.stderr_path {
            directive(format!("--error={path}"));
        }
        if resources.exclusive {
            directive("--exclusive".to_string());
        }
        for (key, value) in &resources.extra {
            if value.is_empty() {
                directive(format!("--{key}"));
            } else {
                directive(format!("--{key}={value}"));
            }
        }

        render_job_body(job, &mut out)?;
        Ok(out)
    }

    fn submit_command(&self, job: &Job, script: &str) -> AppResult<String> {
        render_submit_command("sbatch", job, script)
    }

    fn parse_submission_result(&self, capture: &ExecCapture) -> AppResult<String> {
        let stdout = capture.stdout_text();
        if capture.exit_code != 0 {
            let stderr = capture.stderr_text();
            return Err(AppError::with_message(
                AppErrorKind::Submission,
                codes::SUBMISSION_REJECTED,
                format!(
                    "sbatch exited with {}: {}",
                    capture.exit_code,
                    stderr.trim()
                ),
            ));
        }
        stdout
            .lines()
            .rev()
            .find_map(parse_job_id)
            .ok_or_else(|| {
                AppError::with_message(
                    AppErrorKind::Submission,
                    codes::SUBMISSION_UNPARSEABLE,
                    format!("sbatch output carries no job id: {:?}", stdout.trim()),
                )
            })
    }

    fn supports_batch_status(&self) -> bool {
        true
    }

    fn max_batch_size(&self) -> usize {
        MAX_BATCH
    }

    fn render_status_query(&self, remote_ids: &[String]) -> AppResult<String> {
        ensure_batch_fits(self, remote_ids)?;
        for id in remote_ids {
            ensure_remote_id(id)?;
        }
        let list = sh_escape(&remote_ids.join(","));
        // squeue sees live jobs, sacct keeps finished ones visible; the query
        // only fails if neither tool answered.
        Ok(format!(
            "squeue -h -t all -o '%i|%T' -j {list}; sq=$?; \
             sacct -n -P -X -o JobID,State,ExitCode -j {list}; sa=$?; \
             [ \"$sq\" -eq 0 ] || [ \"$sa\" -eq 0 ]"
        ))
    }

    fn parse_status_response(&self, capture: &ExecCapture) -> AppResult<StatusReport> {
        let stderr = capture.stderr_text();
        if capture.exit_code != 0 && !stderr.contains("Invalid job id specified") {
            return Err(AppError::with_message(
                AppErrorKind::Internal,
                codes::STATUS_QUERY_FAILED,
                format!(
                    "squeue/sacct exited with {}: {}",
                    capture.exit_code,
                    stderr.trim()
                ),
            ));
        }

        let stdout = capture.stdout_text();
        let mut live: HashMap<String, RawState> = HashMap::new();
        let mut accounted: HashMap<String, RawState> = HashMap::new();
        for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let fields: Vec<&str> = line.split('|').collect();
            match fields.as_slice() {
                [id, state] => {
                    live.insert(id.trim().to_string(), RawState::new(state.trim()));
                }
                [id, state, exit_code] => {
                    accounted.insert(
                        id.trim().to_string(),
                        RawState {
                            state: state.trim().to_string(),
                            exit_code: parse_exit_code(exit_code),
                        },
                    );
                }
                _ => {
                    tracing::debug!(line, "skipping unrecognized slurm status line");
                }
            }
        }

        // squeue wins on state; sacct still contributes the exit code.
        let mut states = accounted;
        for (id, mut raw) in live {
            if let Some(previous) = states.get(&id) {
                raw.exit_code = previous.exit_code;
            }
            states.insert(id, raw);
        }
        Ok(StatusReport {
            states,
            not_found: Default::default(),
        })
    }

    fn map_state(&self, raw: &RawState) -> JobState {
        match normalize_slurm_state(&raw.state).as_str() {
            "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED"
            | "RESV_DEL_HOLD" => JobState::Queued,
            "RUNNING" | "COMPLETING" | "STAGE_IN" | "STAGE_OUT" | "SIGNALING" | "RESIZING"
            | "SUSPENDED" | "STOPPED" => JobState::Running,
            "COMPLETED" => JobState::Completed,
            "CANCELLED" => JobState::Cancelled,
            "FAILED" | "TIMEOUT" | "NODE_FAIL" | "BOOT_FAIL" | "OUT_OF_MEMORY" | "DEADLINE"
            | "PREEMPTED" | "SPECIAL_EXIT" | "REVOKED" => JobState::Failed,
            _ => JobState::Unknown,
        }
    }

    fn render_cancel(&self, remote_id: &str) -> AppResult<String> {
        ensure_remote_id(remote_id)?;
        Ok(format!("scancel {}", sh_escape(remote_id)))
    }

    fn render_accounting_query(&self, remote_id: &str) -> AppResult<String> {
        ensure_remote_id(remote_id)?;
        Ok(format!(
            "sacct -j {} -n -P --noconvert -o {ACCOUNTING_FIELDS}",
            sh_escape(remote_id)
        ))
    }

    fn parse_accounting(
        &self,
        remote_id: &str,
        capture: &ExecCapture,
    ) -> AppResult<MetricsRecord> {
        if capture.exit_code != 0 {
            let stderr = capture.stderr_text();
            if is_accounting_disabled(&stderr) {
                return Err(AppError::accounting_permanent(
                    "slurm accounting storage is disabled on this cluster",
                ));
            }
            return Err(AppError::accounting_transient(format!(
                "sacct exited with {}: {}",
                capture.exit_code,
                stderr.trim()
            )));
        }

        let stdout = capture.stdout_text();
        let rows = parse_accounting_rows(&stdout);
        let Some(main) = rows
            .iter()
            .find(|row| row.job_id == remote_id)
            .or_else(|| rows.iter().find(|row| !row.job_id.contains('.')))
        else {
            return Err(AppError::accounting_transient(format!(
                "no accounting record for job {remote_id} yet"
            )));
        };

        let state = normalize_slurm_state(main.state);
        if is_slurm_state_active(&state) {
            return Err(AppError::accounting_transient(format!(
                "accounting for job {remote_id} still reports {state}"
            )));
        }

        let max_memory_bytes = rows
            .iter()
            .filter_map(|row| parse_memory_bytes(row.max_rss))
            .max();
        Ok(MetricsRecord {
            wall_time: parse_clock_duration(main.elapsed),
            cpu_time: parse_clock_duration(main.total_cpu),
            max_memory_bytes,
            exit_status: parse_exit_code(main.exit_code),
        })
    }
}
