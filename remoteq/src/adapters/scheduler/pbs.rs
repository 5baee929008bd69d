// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::batch::ensure_batch_fits;
use crate::app::ports::{BatchAdapter, ExecCapture, RawState, StatusReport};
use crate::app::services::shell::{ensure_directive_value, sh_escape};
use crate::app::services::units::{format_hms, parse_clock_duration, parse_memory_bytes};
use crate::app::types::{Job, JobState, MetricsRecord, ResourceRequest};

use super::{ensure_remote_id, render_job_body, render_submit_command, validate_common};

const MAX_BATCH: usize = 100;

/// Exit status PBS records for a job killed by `qdel` (256 + SIGTERM).
const EXIT_STATUS_DELETED: i32 = 271;

/// `-l` resources accepted in `extra` without a passthrough mark.
const KNOWN_EXTRA: &[&str] = &[
    "select",
    "place",
    "ngpus",
    "gpus",
    "mpiprocs",
    "ompthreads",
    "pmem",
    "vmem",
    "feature",
    "host",
    "naccesspolicy",
];

/// Which PBS lineage the cluster runs. They disagree on how to ask for
/// nodes and on whether finished jobs need `-x` to stay visible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PbsFlavor {
    /// PBS Professional / OpenPBS 19+.
    #[default]
    Pro,
    /// Torque 6.
    Torque,
}

/// `qsub`/`qstat`/`qdel`.
#[derive(Debug, Clone, Default)]
pub struct PbsAdapter {
    flavor: PbsFlavor,
}

impl PbsAdapter {
    pub fn new(flavor: PbsFlavor) -> Self {
        Self { flavor }
    }

    fn qstat_full(&self) -> &'static str {
        match self.flavor {
            PbsFlavor::Pro => "qstat -x -f",
            PbsFlavor::Torque => "qstat -f",
        }
    }

    fn node_request(&self, resources: &ResourceRequest) -> Option<String> {
        if resources.nodes.is_none() && resources.cores.is_none() {
            return None;
        }
        let nodes = resources.nodes.unwrap_or(1);
        Some(match (self.flavor, resources.cores) {
            (PbsFlavor::Pro, Some(cores)) => format!("select={nodes}:ncpus={cores}"),
            (PbsFlavor::Pro, None) => format!("select={nodes}"),
            (PbsFlavor::Torque, Some(cores)) => format!("nodes={nodes}:ppn={cores}"),
            (PbsFlavor::Torque, None) => format!("nodes={nodes}"),
        })
    }
}

/// One `Job Id:` block of `qstat -f` output.
#[derive(Debug, Default)]
struct QstatRecord {
    id: String,
    attrs: HashMap<String, String>,
}

impl QstatRecord {
    fn get(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    fn exit_status(&self) -> Option<i32> {
        self.get("Exit_status").and_then(|v| v.trim().parse().ok())
    }
}

/// Parses `qstat -f` output. Attribute lines are `    key = value`;
/// long values wrap onto tab-indented continuation lines.
fn parse_qstat_full(stdout: &str) -> Vec<QstatRecord> {
    let mut records = Vec::new();
    let mut current: Option<QstatRecord> = None;
    let mut last_key: Option<String> = None;

    for line in stdout.lines() {
        if let Some(id) = line.trim().strip_prefix("Job Id:") {
            if let Some(done) = current.take() {
                records.push(done);
            }
            current = Some(QstatRecord {
                id: id.trim().to_string(),
                attrs: HashMap::new(),
            });
            last_key = None;
            continue;
        }
        let Some(record) = current.as_mut() else {
            continue;
        };
        if line.starts_with('\t') {
            if let Some(value) = last_key.as_ref().and_then(|k| record.attrs.get_mut(k)) {
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((key, value)) = line.trim().split_once(" = ") {
            let key = key.trim().to_string();
            record.attrs.insert(key.clone(), value.trim().to_string());
            last_key = Some(key);
        }
    }
    if let Some(done) = current {
        records.push(done);
    }
    records
}

/// Ids qstat reports on stderr as unknown or no longer listed.
fn parse_unknown_ids(stderr: &str) -> (HashSet<String>, Vec<&str>) {
    let mut unknown = HashSet::new();
    let mut other = Vec::new();
    for line in stderr.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(rest) = line.split_once("Unknown Job Id").map(|(_, rest)| rest) {
            if let Some(id) = rest.split_whitespace().next() {
                unknown.insert(id.to_string());
                continue;
            }
        }
        if line.contains("Job has finished") {
            if let Some(id) = line
                .trim_start_matches("qstat:")
                .split_whitespace()
                .next()
            {
                unknown.insert(id.to_string());
                continue;
            }
        }
        other.push(line);
    }
    (unknown, other)
}

fn is_finished(state: &str) -> bool {
    matches!(state, "C" | "F" | "X")
}

/// `123.server`, or `123[].server` for array jobs.
fn looks_like_pbs_id(line: &str) -> bool {
    let head = line.split('.').next().unwrap_or(line);
    let head = head.strip_suffix("[]").unwrap_or(head);
    !head.is_empty()
        && head.chars().all(|c| c.is_ascii_digit())
        && !line.chars().any(char::is_whitespace)
}

impl BatchAdapter for PbsAdapter {
    fn name(&self) -> &'static str {
        "pbs"
    }

    fn dialect(&self) -> &'static str {
        match self.flavor {
            PbsFlavor::Pro => "PBS Professional / OpenPBS 19+ (qstat -x -f, select=)",
            PbsFlavor::Torque => "Torque 6 (qstat -f, nodes=:ppn=)",
        }
    }

    fn validate(&self, resources: &ResourceRequest) -> AppResult<()> {
        validate_common(resources, KNOWN_EXTRA)?;
        if resources.extra.values().any(String::is_empty) {
            return Err(AppError::invalid_argument(
                "PBS resources need a value (key=value)",
            ));
        }
        Ok(())
    }

    fn render_submission(&self, job: &Job) -> AppResult<String> {
        let resources = job.resources();
        let name = job.display_name();
        ensure_directive_value("job name", name)?;

        let mut out = String::from("#!/bin/bash\n");
        let mut directive = |flag: String| {
            out.push_str("#PBS ");
            out.push_str(&flag);
            out.push('\n');
        };
        directive(format!("-N {name}"));
        if let Some(nodes) = self.node_request(resources) {
            directive(format!("-l {nodes}"));
        }
        if let Some(memory) = resources.memory_mb {
            directive(format!("-l mem={memory}mb"));
        }
        if let Some(walltime) = resources.walltime {
            directive(format!("-l walltime={}", format_hms(walltime)));
        }
        if let Some(queue) = &resources.queue {
            directive(format!("-q {queue}"));
        }
        if let Some(account) = &resources.account {
            directive(format!("-A {account}"));
        }
        if let Some(path) = &resources.stdout_path {
            directive(format!("-o {path}"));
        }
        if let Some(path) = &resources.stderr_path {
            directive(format!("-e {path}"));
        }
        if resources.exclusive {
            match self.flavor {
                PbsFlavor::Pro => directive("-l place=excl".to_string()),
                PbsFlavor::Torque => directive("-n".to_string()),
            }
        }
        for (key, value) in &resources.extra {
            directive(format!("-l {key}={value}"));
        }

        if let Some(workdir) = &resources.workdir {
            out.push_str(&format!("cd {} || exit 1\n", sh_escape(workdir)));
        }
        render_job_body(job, &mut out)?;
        Ok(out)
    }

    fn submit_command(&self, job: &Job, script: &str) -> AppResult<String> {
        render_submit_command("qsub", job, script)
    }

    fn parse_submission_result(&self, capture: &ExecCapture) -> AppResult<String> {
        let stdout = capture.stdout_text();
        if capture.exit_code != 0 {
            return Err(AppError::with_message(
                AppErrorKind::Submission,
                codes::SUBMISSION_REJECTED,
                format!(
                    "qsub exited with {}: {}",
                    capture.exit_code,
                    capture.stderr_text().trim()
                ),
            ));
        }
        stdout
            .lines()
            .map(str::trim)
            .find(|line| looks_like_pbs_id(line))
            .map(str::to_string)
            .ok_or_else(|| {
                AppError::with_message(
                    AppErrorKind::Submission,
                    codes::SUBMISSION_UNPARSEABLE,
                    format!("qsub output carries no job id: {:?}", stdout.trim()),
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
        let mut command = self.qstat_full().to_string();
        for id in remote_ids {
            ensure_remote_id(id)?;
            command.push(' ');
            command.push_str(&sh_escape(id));
        }
        Ok(command)
    }

    fn parse_status_response(&self, capture: &ExecCapture) -> AppResult<StatusReport> {
        let stderr = capture.stderr_text();
        let (not_found, other) = parse_unknown_ids(&stderr);
        if capture.exit_code != 0 && !other.is_empty() {
            return Err(AppError::with_message(
                AppErrorKind::Internal,
                codes::STATUS_QUERY_FAILED,
                format!("qstat exited with {}: {}", capture.exit_code, other.join("; ")),
            ));
        }

        let states = parse_qstat_full(&capture.stdout_text())
            .into_iter()
            .filter_map(|record| {
                let state = record.get("job_state")?.to_string();
                let exit_code = record.exit_status();
                Some((record.id, RawState { state, exit_code }))
            })
            .collect();
        Ok(StatusReport { states, not_found })
    }

    fn map_state(&self, raw: &RawState) -> JobState {
        match raw.state.trim() {
            "Q" | "W" | "H" | "T" => JobState::Queued,
            "R" | "E" | "B" | "S" | "U" => JobState::Running,
            state if is_finished(state) => match raw.exit_code {
                Some(0) => JobState::Completed,
                Some(EXIT_STATUS_DELETED) => JobState::Cancelled,
                Some(_) => JobState::Failed,
                // Torque always records an exit status for jobs that ran;
                // a finished PBS Pro job without one was deleted before start.
                None if state == "C" => JobState::Completed,
                None => JobState::Cancelled,
            },
            _ => JobState::Unknown,
        }
    }

    fn render_cancel(&self, remote_id: &str) -> AppResult<String> {
        ensure_remote_id(remote_id)?;
        Ok(format!("qdel {}", sh_escape(remote_id)))
    }

    fn render_accounting_query(&self, remote_id: &str) -> AppResult<String> {
        ensure_remote_id(remote_id)?;
        Ok(format!("{} {}", self.qstat_full(), sh_escape(remote_id)))
    }

    fn parse_accounting(
        &self,
        remote_id: &str,
        capture: &ExecCapture,
    ) -> AppResult<MetricsRecord> {
        let stderr = capture.stderr_text();
        let (unknown, other) = parse_unknown_ids(&stderr);
        if !unknown.is_empty() {
            return Err(AppError::accounting_permanent(format!(
                "job history for {remote_id} is no longer kept by the PBS server"
            )));
        }
        if capture.exit_code != 0 {
            return Err(AppError::accounting_transient(format!(
                "qstat exited with {}: {}",
                capture.exit_code,
                other.join("; ")
            )));
        }

        let records = parse_qstat_full(&capture.stdout_text());
        let short = remote_id.split('.').next().unwrap_or(remote_id);
        let Some(record) = records.iter().find(|r| {
            r.id == remote_id || r.id.split('.').next().unwrap_or(&r.id) == short
        }) else {
            return Err(AppError::accounting_transient(format!(
                "no accounting record for job {remote_id} yet"
            )));
        };

        let state = record.get("job_state").unwrap_or_default();
        if !is_finished(state) {
            return Err(AppError::accounting_transient(format!(
                "job {remote_id} still in state {state}"
            )));
        }

        let wall_time = record
            .get("resources_used.walltime")
            .and_then(parse_clock_duration);
        let cpu_time = record
            .get("resources_used.cput")
            .and_then(parse_clock_duration);
        let max_memory_bytes = record.get("resources_used.mem").and_then(parse_memory_bytes);
        let exit_status = record.exit_status();
        if wall_time.is_none() && cpu_time.is_none() && max_memory_bytes.is_none() {
            if exit_status.is_none() {
                return Err(AppError::accounting_permanent(format!(
                    "job {remote_id} finished without ever running"
                )));
            }
            return Err(AppError::accounting_transient(format!(
                "usage for job {remote_id} not recorded yet"
            )));
        }
        Ok(MetricsRecord {
            wall_time,
            cpu_time,
            max_memory_bytes,
            exit_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::app::errors::AccountingErrorKind;
    use crate::app::types::JobCommand;

    const FINISHED: &str = "Job Id: 4711.pbs01.cluster.org
    Job_Name = demo
    Job_Owner = alice@login01
    resources_used.cput = 00:00:42
    resources_used.mem = 20480kb
    resources_used.walltime = 00:01:03
    job_state = F
    queue = workq
    Exit_status = 0
    Variable_List = PBS_O_HOME=/home/alice,PBS_O_LANG=C,
\tPBS_O_PATH=/usr/bin
";

    fn capture(stdout: &str, stderr: &str, exit_code: i32) -> ExecCapture {
        ExecCapture {
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
            exit_code,
        }
    }

    #[test]
    fn qstat_full_joins_continuation_lines() {
        let records = parse_qstat_full(FINISHED);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "4711.pbs01.cluster.org");
        assert_eq!(
            records[0].get("Variable_List"),
            Some("PBS_O_HOME=/home/alice,PBS_O_LANG=C,PBS_O_PATH=/usr/bin")
        );
    }

    #[test]
    fn render_submission_per_flavor() {
        let resources = ResourceRequest {
            cores: Some(8),
            nodes: Some(2),
            walltime: Some(Duration::from_secs(30 * 3600)),
            workdir: Some("/scratch/alice".to_string()),
            exclusive: true,
            ..ResourceRequest::default()
        };
        let job = Job::new("pbs", JobCommand::shell("./run.sh"))
            .with_name("demo")
            .with_resources(resources);

        let pro = PbsAdapter::new(PbsFlavor::Pro).render_submission(&job).unwrap();
        assert!(pro.contains("#PBS -N demo\n"));
        assert!(pro.contains("#PBS -l select=2:ncpus=8\n"));
        assert!(pro.contains("#PBS -l walltime=30:00:00\n"));
        assert!(pro.contains("#PBS -l place=excl\n"));
        assert!(pro.contains("cd '/scratch/alice' || exit 1\n"));

        let torque = PbsAdapter::new(PbsFlavor::Torque)
            .render_submission(&job)
            .unwrap();
        assert!(torque.contains("#PBS -l nodes=2:ppn=8\n"));
        assert!(torque.contains("#PBS -n\n"));
    }

    #[test]
    fn validate_requires_resource_values() {
        let adapter = PbsAdapter::default();
        let mut resources = ResourceRequest::default();
        resources.extra.insert("ngpus".to_string(), String::new());
        assert!(adapter.validate(&resources).is_err());
        resources.extra.insert("ngpus".to_string(), "2".to_string());
        assert!(adapter.validate(&resources).is_ok());
    }

    #[test]
    fn submission_id_pattern() {
        let adapter = PbsAdapter::default();
        assert_eq!(
            adapter
                .parse_submission_result(&capture("4711.pbs01.cluster.org\n", "", 0))
                .unwrap(),
            "4711.pbs01.cluster.org"
        );
        assert_eq!(
            adapter
                .parse_submission_result(&capture("88[].pbs01\n", "", 0))
                .unwrap(),
            "88[].pbs01"
        );
        let err = adapter
            .parse_submission_result(&capture("job queued\n", "", 0))
            .unwrap_err();
        assert_eq!(err.code(), codes::SUBMISSION_UNPARSEABLE);
        let err = adapter
            .parse_submission_result(&capture("", "qsub: Unknown queue", 168))
            .unwrap_err();
        assert_eq!(err.code(), codes::SUBMISSION_REJECTED);
    }

    #[test]
    fn status_query_uses_history_flag_for_pro() {
        let ids = vec!["1.pbs".to_string(), "2.pbs".to_string()];
        assert_eq!(
            PbsAdapter::new(PbsFlavor::Pro)
                .render_status_query(&ids)
                .unwrap(),
            "qstat -x -f '1.pbs' '2.pbs'"
        );
        assert_eq!(
            PbsAdapter::new(PbsFlavor::Torque)
                .render_status_query(&ids)
                .unwrap(),
            "qstat -f '1.pbs' '2.pbs'"
        );
    }

    #[test]
    fn status_collects_unknown_ids() {
        let adapter = PbsAdapter::default();
        let stdout = format!("{FINISHED}\nJob Id: 4712.pbs01\n    job_state = R\n");
        let report = adapter
            .parse_status_response(&capture(
                &stdout,
                "qstat: Unknown Job Id 4700.pbs01\n",
                153,
            ))
            .unwrap();
        assert_eq!(report.states.len(), 2);
        assert_eq!(
            report.find("4711.pbs01.cluster.org"),
            Some(&RawState {
                state: "F".to_string(),
                exit_code: Some(0)
            })
        );
        assert!(report.reported_missing("4700.pbs01"));

        let err = adapter
            .parse_status_response(&capture("", "qstat: cannot connect to server pbs01", 2))
            .unwrap_err();
        assert_eq!(err.code(), codes::STATUS_QUERY_FAILED);
    }

    #[test]
    fn map_state_uses_exit_status_for_finished_jobs() {
        let adapter = PbsAdapter::default();
        let finished = |exit_code| RawState {
            state: "F".to_string(),
            exit_code,
        };
        assert_eq!(adapter.map_state(&RawState::new("Q")), JobState::Queued);
        assert_eq!(adapter.map_state(&RawState::new("H")), JobState::Queued);
        assert_eq!(adapter.map_state(&RawState::new("R")), JobState::Running);
        assert_eq!(adapter.map_state(&RawState::new("E")), JobState::Running);
        assert_eq!(adapter.map_state(&finished(Some(0))), JobState::Completed);
        assert_eq!(adapter.map_state(&finished(Some(1))), JobState::Failed);
        assert_eq!(adapter.map_state(&finished(Some(271))), JobState::Cancelled);
        assert_eq!(adapter.map_state(&finished(None)), JobState::Cancelled);
        assert_eq!(adapter.map_state(&RawState::new("Z")), JobState::Unknown);
    }

    #[test]
    fn accounting_reads_resources_used() {
        let adapter = PbsAdapter::default();
        let metrics = adapter
            .parse_accounting("4711.pbs01.cluster.org", &capture(FINISHED, "", 0))
            .unwrap();
        assert_eq!(metrics.wall_time, Some(Duration::from_secs(63)));
        assert_eq!(metrics.cpu_time, Some(Duration::from_secs(42)));
        assert_eq!(metrics.max_memory_bytes, Some(20480 * 1024));
        assert_eq!(metrics.exit_status, Some(0));
    }

    #[test]
    fn accounting_errors_are_classified() {
        let adapter = PbsAdapter::default();
        let permanent = adapter
            .parse_accounting("9.pbs01", &capture("", "qstat: Unknown Job Id 9.pbs01", 153))
            .unwrap_err();
        assert_eq!(
            permanent.kind(),
            AppErrorKind::Accounting(AccountingErrorKind::Permanent)
        );

        let running = "Job Id: 9.pbs01\n    job_state = R\n";
        let transient = adapter
            .parse_accounting("9.pbs01", &capture(running, "", 0))
            .unwrap_err();
        assert_eq!(
            transient.kind(),
            AppErrorKind::Accounting(AccountingErrorKind::Transient)
        );
    }
}
