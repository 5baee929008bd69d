// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use anyhow::Context;
use futures_util::future::join_all;
use tokio::sync::watch;

use remoteq::adapters::cli::{self, Command, ParsedOpts, SubmitArgs};
use remoteq::adapters::db::{JobStore, SqliteJobStore};
use remoteq::adapters::scheduler::default_adapters;
use remoteq::adapters::ssh::SshConnector;
use remoteq::adapters::time::SystemClock;
use remoteq::app::ports::JobStorePort;
use remoteq::app::types::{Job, JobCommand, JobId};
use remoteq::app::{EnginePorts, JobEngine};
use remoteq::config::{self, Config, LoadResult};
use remoteq::logging;

struct Runtime {
    engine: JobEngine,
    connector: Arc<SshConnector>,
}

fn build_engine(config: &Config, store: Arc<dyn JobStorePort>) -> anyhow::Result<Runtime> {
    let connector = Arc::new(SshConnector::new(
        config.ssh_params()?,
        config.pool_size,
        config.pool_acquire_timeout(),
        config.retry_policy(),
    ));
    let adapters = default_adapters(config.pbs_flavor);
    for name in adapters.names() {
        let adapter = adapters.get(name)?;
        tracing::debug!(scheduler = name, dialect = adapter.dialect(), "batch adapter ready");
    }
    let engine = JobEngine::new(
        EnginePorts {
            remote: connector.clone(),
            adapters,
            store,
            clock: Arc::new(SystemClock::new()),
        },
        config.engine_settings(),
    );
    Ok(Runtime { engine, connector })
}

fn print_job(job: &Job) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(job)?);
    Ok(())
}

/// Polls in the background until every job in `ids` has finished or the
/// user hits Ctrl-C.
async fn track_until_done(runtime: &Runtime, ids: Vec<JobId>) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = runtime.engine.start_polling(shutdown_rx);

    let waits = join_all(ids.iter().map(|id| runtime.engine.wait(id)));
    let outcome = tokio::select! {
        finished = waits => Some(finished),
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted; unfinished jobs stay in the database for `remoteq resume`");
            None
        }
    };

    let _ = shutdown_tx.send(true);
    if let Err(err) = poller.await {
        tracing::warn!(error = %err, "polling task ended abnormally");
    }
    runtime.connector.shutdown().await;

    for finished in outcome.unwrap_or_default() {
        print_job(&finished?)?;
    }
    Ok(())
}

async fn submit(config: &Config, store: Arc<dyn JobStorePort>, args: SubmitArgs) -> anyhow::Result<()> {
    let runtime = build_engine(config, store)?;
    let scheduler = args
        .scheduler
        .clone()
        .unwrap_or_else(|| config.scheduler.clone());
    let mut job = Job::new(scheduler, JobCommand::shell(args.command_line()))
        .with_resources(args.resources());
    if let Some(name) = &args.name {
        job = job.with_name(name.clone());
    }

    let job = match runtime.engine.submit(job).await {
        Ok(job) => job,
        Err(failure) => {
            print_job(&failure.job)?;
            runtime.connector.shutdown().await;
            return Err(failure.error).context("submission failed");
        }
    };
    tracing::info!(job_id = %job.id(), remote_id = job.remote_id().unwrap_or("-"), "submitted");
    if args.no_wait {
        runtime.connector.shutdown().await;
        return print_job(&job);
    }
    track_until_done(&runtime, vec![job.id().clone()]).await
}

async fn resume(config: &Config, store: Arc<dyn JobStorePort>) -> anyhow::Result<()> {
    let runtime = build_engine(config, store)?;
    let restored = runtime.engine.restore().await?;
    if restored.live == 0 {
        if restored.awaiting_metrics > 0 {
            let report = runtime.engine.poll_once().await;
            tracing::info!(collected = report.metrics_collected, "accounting retried for finished jobs");
        } else {
            tracing::info!("no unfinished jobs to resume");
        }
        runtime.connector.shutdown().await;
        return Ok(());
    }
    let ids = runtime
        .engine
        .list_tracked()
        .await
        .into_iter()
        .filter(|job| !job.is_terminal() && job.remote_id().is_some())
        .map(|job| job.id().clone())
        .collect();
    track_until_done(&runtime, ids).await
}

async fn cancel(config: &Config, store: Arc<dyn JobStorePort>, job_id: String) -> anyhow::Result<()> {
    let runtime = build_engine(config, store)?;
    runtime.engine.restore().await?;
    let outcome = runtime.engine.cancel(&JobId::from(job_id.as_str())).await;
    runtime.connector.shutdown().await;
    print_job(&outcome?)
}

async fn list(store: Arc<dyn JobStorePort>) -> anyhow::Result<()> {
    for job in store.load_jobs().await? {
        println!("{}", serde_json::to_string(&job)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ParsedOpts {
        opts,
        verbose_override,
    } = cli::parse_opts();
    let LoadResult { config, report } = config::load_with_report(
        opts.config,
        config::Overrides {
            host: opts.host,
            port: opts.port,
            username: opts.user,
            identity_path: opts.identity,
            database_path: opts.database_path,
            poll_interval_secs: opts.poll_interval_secs,
            scheduler: match &opts.command {
                Command::Submit(args) => args.scheduler.clone(),
                _ => None,
            },
            verbose: verbose_override,
        },
    )?;
    logging::init(config.verbose);
    report.log();

    config::ensure_database_dir(&config.database_path)?;
    let db = JobStore::open(&config.database_path)
        .await
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    let store: Arc<dyn JobStorePort> = Arc::new(SqliteJobStore::new(db));

    match opts.command {
        Command::Submit(args) => submit(&config, store, args).await,
        Command::Resume => resume(&config, store).await,
        Command::List => list(store).await,
        Command::Cancel { job_id } => cancel(&config, store, job_id).await,
    }
}
