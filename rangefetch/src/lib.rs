//! rangefetch - range-aware transfer engine
//!
//! Fetches, stores and deletes byte ranges of remote resources without
//! blocking the caller. Requests are multiplexed by a background [`Reactor`]
//! over a pluggable [`MultiplexEngine`]; results land in a [`SparseBuffer`]
//! and are reported through a one-shot completion callback.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐ submit/abort ┌─────────┐  add/remove/perform  ┌────────────────┐
//! │ TransferRequest  │─────────────►│ Reactor │─────────────────────►│ MultiplexEngine│
//! │  SparseBuffer    │◄─────────────│ thread  │◄─────────────────────│ Http/Scripted  │
//! └──────────────────┘   callback   └─────────┘ header/write/read    └────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use rangefetch::{ByteRange, HttpEngine, Reactor, TransferConfig, TransferRequest};
//!
//! let reactor = Reactor::start(HttpEngine::new(TransferConfig::default()))?;
//! let request = TransferRequest::get(
//!     "https://example.com/disk.img",
//!     ByteRange::new(4096, 512),
//!     Vec::new(),
//!     Box::new(|request, data, success| {
//!         println!("{}: {} bytes, success={}", request.uri(), data.len(), success);
//!     }),
//! )?;
//! request.submit(&reactor)?;
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod logging;
pub mod range;
pub mod reactor;
pub mod request;
pub mod stats;
pub mod transport;

pub use buffer::{SparseBuffer, Span};
pub use config::TransferConfig;
pub use error::{ConfigError, TransferError, TransferResult};
pub use logging::{init_logging, LoggingError, LoggingGuard};
pub use range::{ByteRange, ParseRangeError};
pub use reactor::{GlobalReactorGuard, Notifier, Reactor, ReactorHandle};
pub use request::{RequestState, TransferCallback, TransferRequest};
pub use stats::{ReactorStats, StatsSnapshot};
pub use transport::{
    HttpEngine, Method, MultiplexEngine, Perform, ScriptedControl, ScriptedEngine,
    ScriptedResponse, TransferHandle, TransferIo, TransferSpec,
};
