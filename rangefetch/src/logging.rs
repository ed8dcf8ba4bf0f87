//! Tracing subscriber setup.
//!
//! Console output honours `RUST_LOG` and falls back to the level chosen by the
//! caller. When a log directory is given, everything down to `debug` is also
//! written to `<dir>/rangefetch.log` through a non-blocking appender.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Name of the log file created inside the log directory.
pub const LOG_FILE_NAME: &str = "rangefetch.log";

/// Errors that can occur while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a global tracing subscriber is already installed: {0}")]
    AlreadyInitialized(String),
}

/// Keeps the file appender flushing. Hold it until the program exits.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    file: Option<WorkerGuard>,
}

impl LoggingGuard {
    /// Returns true if log lines are also going to a file.
    pub fn has_file_output(&self) -> bool {
        self.file.is_some()
    }
}

/// Installs the global subscriber.
///
/// # Arguments
///
/// * `console_level` - Level used when `RUST_LOG` is not set
/// * `log_dir` - Directory for the debug log file, or `None` for console only
///
/// # Errors
///
/// - `LoggingError::CreateDir` - The log directory could not be created
/// - `LoggingError::AlreadyInitialized` - Another subscriber is installed
pub fn init_logging(
    console_level: Level,
    log_dir: Option<&Path>,
) -> Result<LoggingGuard, LoggingError> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| LoggingError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
            let appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(writer)
                .with_filter(EnvFilter::new("rangefetch=debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    tracing::debug!(
        level = %console_level,
        file = ?log_dir.map(|d| d.join(LOG_FILE_NAME)),
        "logging initialized"
    );
    Ok(LoggingGuard { file: guard })
}
