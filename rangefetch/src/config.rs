//! Transfer engine configuration.
//!
//! Settings live in the `[transfer]` section of an INI file:
//!
//! ```ini
//! [transfer]
//! user_agent = my-app/1.0
//! connect_timeout_secs = 5
//! request_timeout_secs = 0      ; 0 disables the overall timeout
//! max_idle_connections = 8
//! max_concurrent_transfers = 16
//! fail_on_error = true
//! buffer_size = 65536
//! upload_window = 4
//! idle_poll_ms = 1000
//! use_system_proxy = true
//! ```
//!
//! Every key is optional; missing keys keep their defaults.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;

use crate::error::ConfigError;

/// User agent sent with every request.
pub const DEFAULT_USER_AGENT: &str = concat!("rangefetch/", env!("CARGO_PKG_VERSION"));

/// Default time allowed for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default number of idle connections kept per host.
pub const DEFAULT_MAX_IDLE_CONNECTIONS: usize = 8;

/// Default number of transfers talking to the network at once.
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 16;

/// Default size of body read and upload chunks.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default number of upload chunks queued ahead of the connection.
pub const DEFAULT_UPLOAD_WINDOW: usize = 4;

/// Default reactor wake-up interval while transfers are active.
pub const DEFAULT_IDLE_POLL_MS: u64 = 1000;

const SECTION: &str = "transfer";
const FILE_NAME: &str = "transfer.ini";

/// Settings for [`HttpEngine`](crate::transport::HttpEngine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    pub user_agent: String,
    pub connect_timeout: Duration,
    /// Limit on a whole transfer, `None` for no limit.
    pub request_timeout: Option<Duration>,
    pub max_idle_connections: usize,
    /// Transfers beyond this many wait for a running one to finish.
    pub max_concurrent_transfers: usize,
    /// Treat HTTP status codes of 400 and above as failures.
    pub fail_on_error: bool,
    pub buffer_size: usize,
    pub upload_window: usize,
    pub idle_poll_interval: Duration,
    /// Honour `HTTP_PROXY`/`HTTPS_PROXY` from the environment.
    pub use_system_proxy: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            request_timeout: None,
            max_idle_connections: DEFAULT_MAX_IDLE_CONNECTIONS,
            max_concurrent_transfers: DEFAULT_MAX_CONCURRENT_TRANSFERS,
            fail_on_error: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
            upload_window: DEFAULT_UPLOAD_WINDOW,
            idle_poll_interval: Duration::from_millis(DEFAULT_IDLE_POLL_MS),
            use_system_proxy: true,
        }
    }
}

impl TransferConfig {
    /// `$XDG_CONFIG_HOME/rangefetch/transfer.ini` or the platform equivalent.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("rangefetch").join(FILE_NAME))
    }

    /// Loads the file at [`default_path`](Self::default_path), or defaults if
    /// there is none.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Loads configuration from an INI file.
    ///
    /// # Errors
    ///
    /// - `ConfigError::ReadFailed` - The file could not be read
    /// - `ConfigError::Parse` - The file is not valid INI
    /// - `ConfigError::InvalidValue` - A key holds an unusable value
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ini_str(&text)
    }

    /// Parses configuration from INI text.
    pub fn from_ini_str(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let mut config = Self::default();
        let Some(section) = ini.section(Some(SECTION)) else {
            return Ok(config);
        };

        if let Some(agent) = section.get("user_agent") {
            config.user_agent = agent.trim().to_string();
        }
        let connect = parse_key::<u64>(section.get("connect_timeout_secs"), "connect_timeout_secs")?;
        if let Some(secs) = connect {
            config.connect_timeout = Duration::from_secs(secs);
        }
        let request = parse_key::<u64>(section.get("request_timeout_secs"), "request_timeout_secs")?;
        if let Some(secs) = request {
            config.request_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(n) = parse_key(section.get("max_idle_connections"), "max_idle_connections")? {
            config.max_idle_connections = n;
        }
        let concurrent = section.get("max_concurrent_transfers");
        if let Some(n) = parse_positive(concurrent, "max_concurrent_transfers")? {
            config.max_concurrent_transfers = n;
        }
        if let Some(flag) = parse_key(section.get("fail_on_error"), "fail_on_error")? {
            config.fail_on_error = flag;
        }
        if let Some(size) = parse_positive(section.get("buffer_size"), "buffer_size")? {
            config.buffer_size = size;
        }
        if let Some(window) = parse_positive(section.get("upload_window"), "upload_window")? {
            config.upload_window = window;
        }
        if let Some(ms) = parse_positive::<u64>(section.get("idle_poll_ms"), "idle_poll_ms")? {
            config.idle_poll_interval = Duration::from_millis(ms);
        }
        if let Some(flag) = parse_key(section.get("use_system_proxy"), "use_system_proxy")? {
            config.use_system_proxy = flag;
        }
        Ok(config)
    }

    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = agent.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_transfers(mut self, limit: usize) -> Self {
        self.max_concurrent_transfers = limit.max(1);
        self
    }

    pub fn with_fail_on_error(mut self, fail: bool) -> Self {
        self.fail_on_error = fail;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    pub fn with_upload_window(mut self, window: usize) -> Self {
        self.upload_window = window.max(1);
        self
    }

    pub fn with_idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    pub fn with_system_proxy(mut self, enabled: bool) -> Self {
        self.use_system_proxy = enabled;
        self
    }
}

fn parse_key<T: FromStr>(value: Option<&str>, key: &str) -> Result<Option<T>, ConfigError> {
    let Some(value) = value else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

fn parse_positive<T>(value: Option<&str>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    match parse_key::<T>(value, key)? {
        Some(n) if n <= T::default() => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.unwrap_or_default().to_string(),
        }),
        other => Ok(other),
    }
}
