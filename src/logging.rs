//! Logging setup for msgqueue using tracing.
//!
//! Everything goes to a daily-rolling `msgqueue.log`, as text or JSON lines
//! depending on `MSGQUEUE_LOG_FORMAT`. The console layer sits on stderr so it
//! never mixes with command output on stdout, and its level is chosen per
//! command: the long-running `process` loop reports progress, one-shot
//! commands only surface warnings.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Env var selecting the log file format (`text` or `json`).
pub const LOG_FORMAT_ENV: &str = "MSGQUEUE_LOG_FORMAT";

const LOG_FILE_NAME: &str = "msgqueue.log";
const DEFAULT_FILTER: &str = "info,msgqueue=debug";

/// Log file line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    /// Read from `MSGQUEUE_LOG_FORMAT`, defaulting to text.
    pub fn from_env() -> Self {
        std::env::var(LOG_FORMAT_ENV)
            .map(|value| Self::parse(&value))
            .unwrap_or_default()
    }

    fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the file filter. The returned guard flushes the file
/// writer on drop and must be held until the process exits.
pub fn init(log_dir: Option<&Path>, console_level: LevelFilter) -> Result<(WorkerGuard, PathBuf)> {
    let log_dir = match log_dir {
        Some(dir) => dir.to_path_buf(),
        None => default_log_dir()?,
    };
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let format = LogFormat::from_env();

    let json_file = (format == LogFormat::Json).then(|| {
        fmt::layer()
            .json()
            .with_writer(non_blocking.clone())
            .with_current_span(true)
            .with_span_list(false)
            .with_filter(file_filter())
    });
    let text_file = (format == LogFormat::Text).then(|| {
        fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_filter(file_filter())
    });

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_level);

    tracing_subscriber::registry()
        .with(json_file)
        .with(text_file)
        .with(console_layer)
        .try_init()?;

    tracing::debug!("Logging to {} ({:?})", log_dir.join(LOG_FILE_NAME).display(), format);

    Ok((guard, log_dir))
}

fn file_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// `<data_dir>/logs` for the msgqueue project.
pub fn default_log_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "msgqueue", "msgqueue")
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;

    Ok(dirs.data_dir().join("logs"))
}

/// Route this crate's events to the test harness output.
///
/// Safe to call from several tests; only the first call installs a subscriber.
#[cfg(test)]
pub fn init_test() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("msgqueue=trace"));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer().with_filter(filter))
        .try_init();
}
