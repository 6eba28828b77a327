//! Logging initialization shared by DBO binaries.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default filter when RUST_LOG is unset (trace, debug, info, warn, error).
    pub level: String,
    /// Optional file to append logs to, rotated daily.
    pub file: Option<PathBuf>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json: false,
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// RUST_LOG takes precedence over the configured level. When file logging is
/// enabled the returned guard must be held for the lifetime of the process,
/// or buffered lines are lost on exit.
pub fn init_logging(config: &LogConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    match &config.file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "dbod.log".into());
            let appender = tracing_appender::rolling::daily(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            if config.json {
                tracing_subscriber::registry()
                    .with(fmt::layer().json().with_writer(writer).with_ansi(false))
                    .with(filter)
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(fmt::layer().with_writer(writer).with_ansi(false))
                    .with(filter)
                    .init();
            }
            Some(guard)
        }
        None => {
            if config.json {
                tracing_subscriber::registry()
                    .with(fmt::layer().json())
                    .with(filter)
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(fmt::layer())
                    .with(filter)
                    .init();
            }
            None
        }
    }
}
