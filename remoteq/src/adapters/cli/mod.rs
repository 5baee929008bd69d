// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, CommandFactory, FromArgMatches, Parser, Subcommand};

use crate::app::services::units::parse_clock_duration;
use crate::app::types::ResourceRequest;

#[derive(Parser, Debug)]
#[command(
    name = "remoteq",
    version,
    about,
    long_about = None,
    after_help = "Configuration precedence: defaults < config file < command-line flags.\n\
Config path precedence: defaults < REMOTEQ_CONFIG_PATH < command-line flags.\n\
If --config is omitted, remoteq tries REMOTEQ_CONFIG_PATH, then the default config file location; missing default config is OK.\n\
Paths in the config file are resolved relative to the config file directory; paths passed as flags are resolved relative to the current working directory.\n\
Logging: REMOTEQ_LOG, REMOTEQ_LOG_FORMAT (compact|pretty|json), REMOTEQ_LOG_SPAN_EVENTS, REMOTEQ_LOG_FILE."
)]
pub struct Opts {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to a TOML config file. When omitted, remoteq uses REMOTEQ_CONFIG_PATH if set, otherwise the default config file location if available."
    )]
    pub config: Option<PathBuf>,
    #[arg(
        long,
        value_name = "PATH",
        help = "Path to the SQLite job database. Overrides `database_path` from the config file."
    )]
    pub database_path: Option<PathBuf>,
    #[arg(
        long,
        value_name = "HOST",
        help = "Cluster login node. Overrides `host` from the config file."
    )]
    pub host: Option<String>,
    #[arg(
        short,
        long,
        value_name = "PORT",
        help = "SSH port. Overrides `port` from the config file."
    )]
    pub port: Option<u16>,
    #[arg(
        short,
        long,
        value_name = "NAME",
        help = "SSH user. Overrides `username` from the config file."
    )]
    pub user: Option<String>,
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Private key for SSH authentication. Overrides `identity_path` from the config file."
    )]
    pub identity: Option<PathBuf>,
    #[arg(
        long,
        value_name = "SECS",
        help = "How often to poll the scheduler. Overrides `poll_interval_secs` from the config file."
    )]
    pub poll_interval_secs: Option<u64>,
    #[arg(
        short,
        long,
        action = clap::ArgAction::SetTrue,
        help = "Enable debug logging. Overrides `verbose` from the config file."
    )]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Submit a job and wait until it finishes; prints the final job as JSON.
    Submit(SubmitArgs),
    /// Track every unfinished job from the database until it finishes.
    Resume,
    /// Print the jobs stored in the database.
    List,
    /// Ask the scheduler to cancel a stored job.
    Cancel {
        /// Local job id (`job-...`).
        job_id: String,
    },
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    #[arg(long, value_name = "NAME", help = "Adapter to submit with (slurm, pbs). Overrides `scheduler` from the config file.")]
    pub scheduler: Option<String>,
    #[arg(long, value_name = "NAME", help = "Job name shown by the scheduler.")]
    pub name: Option<String>,
    #[arg(long, value_name = "N")]
    pub cores: Option<u32>,
    #[arg(long, value_name = "N")]
    pub nodes: Option<u32>,
    #[arg(long, value_name = "MB")]
    pub memory_mb: Option<u64>,
    #[arg(long, value_name = "[D-]HH:MM:SS", value_parser = parse_walltime)]
    pub walltime: Option<Duration>,
    #[arg(long, value_name = "NAME", help = "Partition (SLURM) or queue (PBS).")]
    pub queue: Option<String>,
    #[arg(long, value_name = "NAME")]
    pub account: Option<String>,
    #[arg(long, value_name = "DIR", help = "Working directory on the cluster.")]
    pub workdir: Option<String>,
    #[arg(long, value_name = "PATH")]
    pub stdout: Option<String>,
    #[arg(long, value_name = "PATH")]
    pub stderr: Option<String>,
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub exclusive: bool,
    #[arg(
        long = "extra",
        value_name = "KEY=VALUE",
        value_parser = parse_key_value,
        help = "Scheduler-specific directive; repeatable."
    )]
    pub extra: Vec<(String, String)>,
    #[arg(
        long = "passthrough",
        value_name = "KEY",
        help = "Accept this --extra key even if the adapter does not know it; repeatable."
    )]
    pub passthrough: Vec<String>,
    #[arg(long, action = clap::ArgAction::SetTrue, help = "Print the submitted job and exit without waiting.")]
    pub no_wait: bool,
    #[arg(
        last = true,
        required = true,
        value_name = "COMMAND",
        help = "Shell command to run on the compute node."
    )]
    pub command: Vec<String>,
}

impl SubmitArgs {
    pub fn resources(&self) -> ResourceRequest {
        ResourceRequest {
            cores: self.cores,
            nodes: self.nodes,
            memory_mb: self.memory_mb,
            walltime: self.walltime,
            queue: self.queue.clone(),
            account: self.account.clone(),
            workdir: self.workdir.clone(),
            stdout_path: self.stdout.clone(),
            stderr_path: self.stderr.clone(),
            exclusive: self.exclusive,
            extra: self.extra.iter().cloned().collect::<BTreeMap<_, _>>(),
            passthrough: self.passthrough.iter().cloned().collect::<BTreeSet<_>>(),
        }
    }

    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

fn parse_walltime(raw: &str) -> Result<Duration, String> {
    match parse_clock_duration(raw) {
        Some(d) if !d.is_zero() => Ok(d),
        _ => Err(format!("'{raw}' is not a walltime like 1-02:00:00 or 30:00")),
    }
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("'{raw}' is not KEY=VALUE")),
    }
}

pub struct ParsedOpts {
    pub opts: Opts,
    pub verbose_override: Option<bool>,
}

pub fn cli_command() -> clap::Command {
    Opts::command()
}

pub fn parse_opts() -> ParsedOpts {
    let matches = cli_command().get_matches();
    let verbose_override = if matches.get_flag("verbose") {
        Some(true)
    } else {
        None
    };
    let opts = Opts::from_arg_matches(&matches).unwrap_or_else(|err| err.exit());
    ParsedOpts {
        opts,
        verbose_override,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Opts {
        let matches = cli_command().try_get_matches_from(args).unwrap();
        Opts::from_arg_matches(&matches).unwrap()
    }

    #[test]
    fn command_definition_is_consistent() {
        cli_command().debug_assert();
    }

    #[test]
    fn submit_collects_resources_and_command() {
        let opts = parse(&[
            "remoteq",
            "--host",
            "login",
            "submit",
            "--cores",
            "4",
            "--walltime",
            "01:30:00",
            "--extra",
            "gres=gpu:1",
            "--passthrough",
            "gres",
            "--",
            "echo",
            "hello",
        ]);
        assert_eq!(opts.host.as_deref(), Some("login"));
        let Command::Submit(args) = opts.command else {
            panic!("expected submit");
        };
        let resources = args.resources();
        assert_eq!(resources.cores, Some(4));
        assert_eq!(resources.walltime, Some(Duration::from_secs(5400)));
        assert_eq!(resources.extra.get("gres").map(String::as_str), Some("gpu:1"));
        assert!(resources.passthrough.contains("gres"));
        assert_eq!(args.command_line(), "echo hello");
    }

    #[test]
    fn submit_requires_a_command() {
        assert!(
            cli_command()
                .try_get_matches_from(["remoteq", "submit"])
                .is_err()
        );
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(parse_walltime("soon").is_err());
        assert!(parse_walltime("00:00:00").is_err());
        assert!(parse_key_value("novalue").is_err());
        assert_eq!(
            parse_key_value("constraint=a=b").unwrap(),
            ("constraint".to_string(), "a=b".to_string())
        );
    }

    #[test]
    fn cancel_takes_a_job_id() {
        let opts = parse(&["remoteq", "cancel", "job-abc"]);
        assert!(matches!(opts.command, Command::Cancel { job_id } if job_id == "job-abc"));
    }
}
