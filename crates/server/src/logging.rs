//! Structured logging to `<data_dir>/logs/server.log`.
//!
//! JSON lines by default; `PLATEWISE_SERVER_LOG_FORMAT=pretty` for humans.
//! The filter comes from `PLATEWISE_SERVER_LOG_FILTER`, then `RUST_LOG`.

use std::path::Path;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::paths;

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";
const LOG_FILE: &str = "server.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn from_env_value(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        }
    }
}

pub struct LoggingHandle {
    pub run_id: String,
    /// Flushes the non-blocking writer on drop; keep alive for the process lifetime.
    pub _guard: WorkerGuard,
}

pub fn init_logging() -> anyhow::Result<LoggingHandle> {
    let log_dir = paths::log_dir();
    std::fs::create_dir_all(&log_dir)?;
    if std::env::var("PLATEWISE_TRUNCATE_SERVER_LOG_ON_START").as_deref() == Ok("1") {
        truncate(&log_dir.join(LOG_FILE))?;
    }

    let directive = filter_directive(
        std::env::var("PLATEWISE_SERVER_LOG_FILTER").ok(),
        std::env::var("RUST_LOG").ok(),
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let format = LogFormat::from_env_value(std::env::var("PLATEWISE_SERVER_LOG_FORMAT").ok().as_deref());

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&log_dir, LOG_FILE));
    install(filter, format, writer)?;

    let run_id = std::env::var("PLATEWISE_SERVER_RUN_ID")
        .unwrap_or_else(|_| default_run_id(std::process::id(), platewise_protocol::now_millis()));

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        run_id = %run_id,
        log_path = %log_dir.join(LOG_FILE).display(),
        format = format.as_str(),
        filter = %directive,
    );

    Ok(LoggingHandle {
        run_id,
        _guard: guard,
    })
}

fn install(filter: EnvFilter, format: LogFormat, writer: NonBlocking) -> anyhow::Result<()> {
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .pretty()
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_current_span(true),
            )
            .try_init()?,
    }
    Ok(())
}

fn truncate(path: &Path) -> std::io::Result<()> {
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map(drop)
}

/// First non-empty of the explicit filter and `RUST_LOG`, else the default.
fn filter_directive(explicit: Option<String>, rust_log: Option<String>) -> String {
    explicit
        .into_iter()
        .chain(rust_log)
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

fn default_run_id(pid: u32, now_millis: u64) -> String {
    format!("pid-{pid}-{now_millis}")
}
