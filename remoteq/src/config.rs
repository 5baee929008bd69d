// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::adapters::scheduler::PbsFlavor;
use crate::adapters::ssh::SshParams;
use crate::app::services::backoff::RetryPolicy;
use crate::app::settings::{DisappearancePolicy, EngineSettings};

const APP_DIR_NAME: &str = "remoteq";
const CONFIG_FILE_NAME: &str = "remoteq.toml";
const CONFIG_ENV_VAR: &str = "REMOTEQ_CONFIG_PATH";
const DATABASE_FILE_NAME: &str = "remoteq.sqlite";

const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_KEEPALIVE_SECS: u64 = 30;
const DEFAULT_POOL_SIZE: usize = 4;
const DEFAULT_POOL_ACQUIRE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;
const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_DISAPPEARED_AFTER: u32 = 3;
const DEFAULT_CANCEL_GRACE_SECS: u64 = 120;
const DEFAULT_METRICS_MAX_RETRIES: u32 = 5;
const DEFAULT_METRICS_BACKOFF_SECS: u64 = 60;
const DEFAULT_SCHEDULER: &str = "slurm";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    identity_path: Option<String>,
    known_hosts_path: Option<String>,
    keepalive_secs: Option<u64>,
    database_path: Option<String>,
    pool_size: Option<usize>,
    pool_acquire_timeout_secs: Option<u64>,
    command_timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    poll_interval_secs: Option<u64>,
    disappeared_after: Option<u32>,
    disappearance_policy: Option<DisappearancePolicy>,
    cancel_grace_secs: Option<u64>,
    metrics_max_retries: Option<u32>,
    metrics_backoff_secs: Option<u64>,
    scheduler: Option<String>,
    pbs_flavor: Option<PbsFlavor>,
    verbose: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Login node. Only commands that talk to the cluster need it.
    pub host: Option<String>,
    pub port: u16,
    /// Falls back to `$USER` when unset.
    pub username: Option<String>,
    pub identity_path: Option<PathBuf>,
    pub known_hosts_path: Option<PathBuf>,
    pub keepalive_secs: u64,
    pub database_path: PathBuf,
    pub pool_size: usize,
    pub pool_acquire_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub poll_interval_secs: u64,
    pub disappeared_after: u32,
    pub disappearance_policy: DisappearancePolicy,
    pub cancel_grace_secs: u64,
    pub metrics_max_retries: u32,
    pub metrics_backoff_secs: u64,
    /// Adapter used for new submissions.
    pub scheduler: String,
    pub pbs_flavor: PbsFlavor,
    pub verbose: bool,
    pub config_path: Option<PathBuf>,
}

impl Config {
    pub fn ssh_params(&self) -> Result<SshParams> {
        let host = self
            .host
            .clone()
            .context("no cluster host configured; set host in the config file or pass --host")?;
        let username = match &self.username {
            Some(name) => name.clone(),
            None => std::env::var("USER")
                .ok()
                .filter(|name| !name.is_empty())
                .context("no username configured and $USER is unset")?,
        };
        Ok(SshParams {
            host,
            port: self.port,
            username,
            identity_path: self.identity_path.clone(),
            known_hosts_path: self.known_hosts_path.clone(),
            keepalive_secs: self.keepalive_secs,
        })
    }

    /// Backoff for reconnecting within one remote command.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    pub fn pool_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_acquire_timeout_secs)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            poll_concurrency: self.pool_size,
            cycle_retry: self.retry_policy(),
            disappeared_after: self.disappeared_after,
            disappearance_policy: self.disappearance_policy,
            cancel_grace: Duration::from_secs(self.cancel_grace_secs),
            metrics_max_retries: self.metrics_max_retries,
            metrics_backoff: Duration::from_secs(self.metrics_backoff_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Override,
    Env,
    ConfigFile,
    Default,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Override => "override",
            ConfigSource::Env => "env",
            ConfigSource::ConfigFile => "config",
            ConfigSource::Default => "default",
        }
    }
}

/// One resolved setting and where it came from.
#[derive(Debug, Clone)]
pub struct ConfigEntry {
    pub key: &'static str,
    pub value: String,
    pub source: ConfigSource,
}

#[derive(Debug)]
pub struct ConfigReport {
    pub config_path: Option<PathBuf>,
    pub config_path_source: Option<ConfigSource>,
    pub config_file_present: bool,
    pub entries: Vec<ConfigEntry>,
}

impl ConfigReport {
    pub fn source_of(&self, key: &str) -> Option<ConfigSource> {
        self.entries
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.source)
    }

    /// Emits one log line per setting.
    pub fn log(&self) {
        match &self.config_path {
            Some(path) => tracing::info!(
                path = %path.display(),
                source = self.config_path_source.map(ConfigSource::as_str).unwrap_or("-"),
                present = self.config_file_present,
                "config file"
            ),
            None => tracing::info!("no config file location available"),
        }
        for entry in &self.entries {
            tracing::info!(
                key = entry.key,
                value = %entry.value,
                source = entry.source.as_str(),
                "config value"
            );
        }
    }
}

#[derive(Debug)]
pub struct LoadResult {
    pub config: Config,
    pub report: ConfigReport,
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub identity_path: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub poll_interval_secs: Option<u64>,
    pub scheduler: Option<String>,
    pub verbose: Option<bool>,
}

#[allow(dead_code)]
pub fn load(config_path_override: Option<PathBuf>, overrides: Overrides) -> Result<Config> {
    Ok(load_with_report(config_path_override, overrides)?.config)
}

/// Picks override, then file, then default, and records the winner.
fn pick<T: fmt::Debug>(
    entries: &mut Vec<ConfigEntry>,
    key: &'static str,
    overridden: Option<T>,
    from_file: Option<T>,
    default: T,
) -> T {
    let (value, source) = match (overridden, from_file) {
        (Some(value), _) => (value, ConfigSource::Override),
        (None, Some(value)) => (value, ConfigSource::ConfigFile),
        (None, None) => (default, ConfigSource::Default),
    };
    entries.push(ConfigEntry {
        key,
        value: format!("{value:?}"),
        source,
    });
    value
}

fn pick_optional<T: fmt::Debug>(
    entries: &mut Vec<ConfigEntry>,
    key: &'static str,
    overridden: Option<T>,
    from_file: Option<T>,
) -> Option<T> {
    let (value, source) = match (overridden, from_file) {
        (Some(value), _) => (Some(value), ConfigSource::Override),
        (None, Some(value)) => (Some(value), ConfigSource::ConfigFile),
        (None, None) => (None, ConfigSource::Default),
    };
    entries.push(ConfigEntry {
        key,
        value: format!("{value:?}"),
        source,
    });
    value
}

pub fn load_with_report(
    config_path_override: Option<PathBuf>,
    overrides: Overrides,
) -> Result<LoadResult> {
    let (config_path, config_path_source, required) = match config_path_override {
        Some(path) => (Some(expand_path(path)), Some(ConfigSource::Override), true),
        None => match config_path_from_env()? {
            Some(path) => (Some(expand_path(path)), Some(ConfigSource::Env), true),
            None => match default_config_path().ok() {
                Some(path) => (Some(path), Some(ConfigSource::Default), false),
                None => (None, None, false),
            },
        },
    };
    let config_file_present = config_path
        .as_deref()
        .map(|path| path.exists())
        .unwrap_or(false);

    let file = match config_path.as_deref() {
        Some(path) => read_config_file(path, required)?,
        None => FileConfig::default(),
    };
    let base_dir = config_path.as_deref().and_then(|path| path.parent());
    let mut entries = Vec::new();

    let host = pick_optional(&mut entries, "host", overrides.host, file.host);
    let port = pick(&mut entries, "port", overrides.port, file.port, DEFAULT_SSH_PORT);
    let username = pick_optional(&mut entries, "username", overrides.username, file.username);
    let identity_path = pick_optional(
        &mut entries,
        "identity_path",
        overrides.identity_path.map(expand_path),
        file.identity_path.map(|raw| resolve_path(&raw, base_dir)),
    );
    let known_hosts_path = pick_optional(
        &mut entries,
        "known_hosts_path",
        None,
        file.known_hosts_path.map(|raw| resolve_path(&raw, base_dir)),
    );
    let keepalive_secs = pick(
        &mut entries,
        "keepalive_secs",
        None,
        file.keepalive_secs,
        DEFAULT_KEEPALIVE_SECS,
    );

    let database_from_file = file.database_path.map(|raw| resolve_path(&raw, base_dir));
    let database_default = match (&overrides.database_path, &database_from_file) {
        (None, None) => default_database_path().with_context(|| {
            "failed to resolve default database path; specify --database-path or set database_path in the config file"
        })?,
        _ => PathBuf::new(),
    };
    let database_path = pick(
        &mut entries,
        "database_path",
        overrides.database_path.map(expand_path),
        database_from_file,
        database_default,
    );

    let pool_size = pick(&mut entries, "pool_size", None, file.pool_size, DEFAULT_POOL_SIZE);
    let pool_acquire_timeout_secs = pick(
        &mut entries,
        "pool_acquire_timeout_secs",
        None,
        file.pool_acquire_timeout_secs,
        DEFAULT_POOL_ACQUIRE_TIMEOUT_SECS,
    );
    let command_timeout_secs = pick(
        &mut entries,
        "command_timeout_secs",
        None,
        file.command_timeout_secs,
        DEFAULT_COMMAND_TIMEOUT_SECS,
    );
    let max_retries = pick(
        &mut entries,
        "max_retries",
        None,
        file.max_retries,
        DEFAULT_MAX_RETRIES,
    );
    let initial_backoff_ms = pick(
        &mut entries,
        "initial_backoff_ms",
        None,
        file.initial_backoff_ms,
        DEFAULT_INITIAL_BACKOFF_MS,
    );
    let max_backoff_ms = pick(
        &mut entries,
        "max_backoff_ms",
        None,
        file.max_backoff_ms,
        DEFAULT_MAX_BACKOFF_MS,
    );
    let poll_interval_secs = pick(
        &mut entries,
        "poll_interval_secs",
        overrides.poll_interval_secs,
        file.poll_interval_secs,
        DEFAULT_POLL_INTERVAL_SECS,
    );
    let disappeared_after = pick(
        &mut entries,
        "disappeared_after",
        None,
        file.disappeared_after,
        DEFAULT_DISAPPEARED_AFTER,
    );
    let disappearance_policy = pick(
        &mut entries,
        "disappearance_policy",
        None,
        file.disappearance_policy,
        DisappearancePolicy::default(),
    );
    let cancel_grace_secs = pick(
        &mut entries,
        "cancel_grace_secs",
        None,
        file.cancel_grace_secs,
        DEFAULT_CANCEL_GRACE_SECS,
    );
    let metrics_max_retries = pick(
        &mut entries,
        "metrics_max_retries",
        None,
        file.metrics_max_retries,
        DEFAULT_METRICS_MAX_RETRIES,
    );
    let metrics_backoff_secs = pick(
        &mut entries,
        "metrics_backoff_secs",
        None,
        file.metrics_backoff_secs,
        DEFAULT_METRICS_BACKOFF_SECS,
    );
    let scheduler = pick(
        &mut entries,
        "scheduler",
        overrides.scheduler,
        file.scheduler,
        DEFAULT_SCHEDULER.to_string(),
    );
    let pbs_flavor = pick(
        &mut entries,
        "pbs_flavor",
        None,
        file.pbs_flavor,
        PbsFlavor::default(),
    );
    let verbose = pick(&mut entries, "verbose", overrides.verbose, file.verbose, false);

    if port == 0 {
        anyhow::bail!("port must be between 1 and 65535");
    }
    if pool_size == 0 {
        anyhow::bail!("pool_size must be at least 1");
    }
    if poll_interval_secs == 0 {
        anyhow::bail!("poll_interval_secs must be at least 1");
    }
    if disappeared_after == 0 {
        anyhow::bail!("disappeared_after must be at least 1");
    }
    if command_timeout_secs == 0 {
        anyhow::bail!("command_timeout_secs must be at least 1");
    }
    if initial_backoff_ms > max_backoff_ms {
        anyhow::bail!("initial_backoff_ms must not exceed max_backoff_ms");
    }
    if scheduler.trim().is_empty() {
        anyhow::bail!("scheduler must not be empty");
    }

    let config = Config {
        host,
        port,
        username,
        identity_path,
        known_hosts_path,
        keepalive_secs,
        database_path,
        pool_size,
        pool_acquire_timeout_secs,
        command_timeout_secs,
        max_retries,
        initial_backoff_ms,
        max_backoff_ms,
        poll_interval_secs,
        disappeared_after,
        disappearance_policy,
        cancel_grace_secs,
        metrics_max_retries,
        metrics_backoff_secs,
        scheduler,
        pbs_flavor,
        verbose,
        config_path: config_path.clone(),
    };

    let report = ConfigReport {
        config_path,
        config_path_source,
        config_file_present,
        entries,
    };

    Ok(LoadResult { config, report })
}

pub fn ensure_database_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }
    Ok(())
}

fn read_config_file(path: &Path, required: bool) -> Result<FileConfig> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        return path;
    }
    match base_dir {
        Some(dir) => dir.join(path),
        None => path,
    }
}

fn expand_path(path: PathBuf) -> PathBuf {
    let path_string = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&path_string);
    PathBuf::from(expanded.as_ref())
}

fn config_path_from_env() -> Result<Option<PathBuf>> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) => {
            if value.is_empty() {
                anyhow::bail!("{CONFIG_ENV_VAR} is set but empty");
            }
            Ok(Some(PathBuf::from(value)))
        }
        None => Ok(None),
    }
}

fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("failed to resolve config directory")?;
    Ok(base.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

fn default_database_path() -> Result<PathBuf> {
    let base = dirs::data_dir().context("failed to resolve data directory")?;
    Ok(base.join(APP_DIR_NAME).join(DATABASE_FILE_NAME))
}
