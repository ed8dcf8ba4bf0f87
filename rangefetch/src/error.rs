//! Error types for the transfer engine.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for transfer operations.
pub type TransferResult<T> = Result<T, TransferError>;

/// Errors that can occur while preparing or running a transfer.
///
/// Most of these never reach the caller as a `Result`: they are recorded on the
/// request (see `TransferRequest::last_error`) and reported through the
/// completion callback with `success == false`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// A closed range that is empty or runs past `u64::MAX` was requested.
    #[error("invalid range: {range}")]
    InvalidRange { range: String },

    /// The request URI could not be parsed.
    #[error("invalid URI {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },

    /// The engine cannot speak this scheme.
    #[error("unsupported scheme: {scheme}")]
    UnsupportedScheme { scheme: String },

    /// `submit` was called on a request that is still registered.
    #[error("request is already active")]
    AlreadyActive,

    /// `submit` was called on a finished request that was not `reset`.
    #[error("request already finished; reset it before submitting again")]
    AlreadyFinished,

    /// The server answered with an error status (fail-on-error).
    #[error("HTTP {status} from {uri}")]
    HttpStatus { uri: String, status: u16 },

    /// The transfer did not complete in time.
    #[error("timed out after {timeout_secs}s: {uri}")]
    Timeout { uri: String, timeout_secs: u64 },

    /// Any other failure reported by the transport layer.
    #[error("transfer of {uri} failed: {reason}")]
    Transport { uri: String, reason: String },

    /// The write callback refused received bytes.
    #[error("received data was rejected")]
    WriteRejected,

    /// The request was cancelled with `abort()`.
    #[error("transfer aborted")]
    Aborted,

    /// The reactor is shutting down and accepts no more work.
    #[error("reactor is shutting down")]
    ShuttingDown,

    /// A background thread could not be started.
    #[error("failed to spawn {name} thread: {reason}")]
    Spawn { name: String, reason: String },
}

impl TransferError {
    /// Returns true if the failure came from the remote side or the network,
    /// as opposed to a local programming or cancellation condition.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            TransferError::HttpStatus { .. }
                | TransferError::Timeout { .. }
                | TransferError::Transport { .. }
        )
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid INI.
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// A key holds a value of the wrong shape.
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}
