//! CLI error type.

use std::path::PathBuf;

use rangefetch::{ConfigError, LoggingError, TransferError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("logging setup failed: {0}")]
    Logging(#[from] LoggingError),

    #[error("{0}")]
    Transfer(#[from] TransferError),

    #[error("transfer failed without a reported cause")]
    Failed,

    #[error("failed to read {path}: {source}")]
    ReadInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write output: {0}")]
    WriteOutput(#[source] std::io::Error),

    #[error("failed to install Ctrl-C handler: {0}")]
    Signal(String),
}
