// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::env;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{EnvFilter, Layer, Registry};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const LOG_ENV: &str = "REMOTEQ_LOG";
const LOG_FORMAT_ENV: &str = "REMOTEQ_LOG_FORMAT";
const LOG_SPAN_EVENTS_ENV: &str = "REMOTEQ_LOG_SPAN_EVENTS";
const LOG_FILE_ENV: &str = "REMOTEQ_LOG_FILE";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

#[derive(Clone, Debug, PartialEq)]
struct LogSettings {
    directives: String,
    format: LogFormat,
    span_events: FmtSpan,
    file: Option<PathBuf>,
}

impl LogSettings {
    fn from_lookup(verbose: bool, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let value = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let directives = value(LOG_ENV).unwrap_or_else(|| {
            if verbose {
                "debug".to_string()
            } else {
                "info".to_string()
            }
        });
        let format = match value(LOG_FORMAT_ENV).map(|v| v.to_ascii_lowercase()).as_deref() {
            Some("json") => LogFormat::Json,
            Some("pretty") => LogFormat::Pretty,
            _ => LogFormat::Compact,
        };
        let span_events = match value(LOG_SPAN_EVENTS_ENV)
            .map(|v| v.to_ascii_lowercase())
            .as_deref()
        {
            Some("new") => FmtSpan::NEW,
            Some("enter") => FmtSpan::ENTER,
            Some("exit") => FmtSpan::EXIT,
            Some("close") => FmtSpan::CLOSE,
            _ => FmtSpan::NONE,
        };
        Self {
            directives,
            format,
            span_events,
            file: value(LOG_FILE_ENV).map(PathBuf::from),
        }
    }
}

/// Installs the global subscriber. Logs go to stderr, and also to
/// `REMOTEQ_LOG_FILE` when set; stdout is left for command output.
pub fn init(verbose: bool) {
    let settings = LogSettings::from_lookup(verbose, |key| env::var(key).ok());
    let mut layers: Vec<BoxedLayer> = vec![fmt_layer(
        settings.format,
        settings.span_events.clone(),
        std::io::stderr,
        true,
    )];
    if let Some((writer, guard)) = settings.file.as_deref().and_then(build_file_writer) {
        layers.push(fmt_layer(
            settings.format,
            settings.span_events.clone(),
            writer,
            false,
        ));
        let _ = FILE_GUARD.set(guard);
    }

    let filter =
        EnvFilter::try_new(&settings.directives).unwrap_or_else(|_| EnvFilter::new("info"));
    Registry::default()
        .with(layers)
        .with(filter)
        .with(tracing_error::ErrorLayer::default())
        .init();
}

fn fmt_layer<W>(format: LogFormat, span_events: FmtSpan, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_timer(UtcTime::rfc_3339())
        .with_span_events(span_events);
    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    }
}

fn build_file_writer(path: &Path) -> Option<(NonBlocking, WorkerGuard)> {
    let file_name = path.file_name()?.to_string_lossy().to_string();
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let appender = tracing_appender::rolling::never(dir, file_name);
    Some(tracing_appender::non_blocking(appender))
}
