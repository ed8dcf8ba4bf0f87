//! Transport boundary of the transfer engine.
//!
//! The reactor never touches sockets itself. It drives a [`MultiplexEngine`],
//! which owns every in-flight transfer and reports back through two channels:
//!
//! - **Stepping**: [`MultiplexEngine::perform`] runs whatever I/O is ready and
//!   hands received header lines and body bytes to a [`TransferIo`], which also
//!   supplies upload bytes on demand.
//! - **Completion**: finished transfers queue up and are drained one at a time
//!   with [`MultiplexEngine::next_completed`].
//!
//! ```text
//!   Reactor thread                    MultiplexEngine
//!   ──────────────                    ───────────────
//!   add(handle, spec) ──────────────► start transfer
//!   perform(io) ────────────────────► io.header / io.write / io.read
//!   next_completed() ◄──────────────── Completion { handle, result }
//!   timeout() ◄─────────────────────── next deadline, if any
//! ```
//!
//! Engines wake the reactor through the [`Notifier`] passed to `attach`
//! whenever new work becomes ready.
//!
//! Two engines are provided: [`HttpEngine`] speaks HTTP(S) through reqwest,
//! [`ScriptedEngine`] replays canned responses in memory.

mod http;
mod scripted;

use std::fmt;
use std::time::Duration;

use reqwest::Url;

use crate::error::TransferResult;
use crate::reactor::Notifier;

pub use http::HttpEngine;
pub use scripted::{ScriptedControl, ScriptedEngine, ScriptedResponse};

/// Identifies one registered transfer inside an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferHandle(u64);

impl TransferHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transfer verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Everything an engine needs to start a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSpec {
    pub url: Url,
    pub method: Method,
    /// Request header lines (`Name: value`), HTTP only.
    pub headers: Vec<String>,
    /// Commands run after the transfer (FTP `DELE`, SFTP `rm`, ...).
    pub post_quote: Vec<String>,
    /// Wire range expression (`"100-"`, `"100-199"`), if any.
    pub range: Option<String>,
    /// Number of bytes the engine will pull through `TransferIo::read`.
    pub upload_len: Option<u64>,
    /// Do not expect a response body.
    pub no_body: bool,
}

impl TransferSpec {
    /// A plain GET of the whole resource.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: Method::Get,
            headers: Vec::new(),
            post_quote: Vec::new(),
            range: None,
            upload_len: None,
            no_body: false,
        }
    }
}

/// Callbacks from an engine into the transfers it is driving.
pub trait TransferIo {
    /// One raw response header line, including status lines.
    fn header(&mut self, handle: TransferHandle, line: &str);

    /// Received body bytes. Returning less than `data.len()` fails the
    /// transfer.
    fn write(&mut self, handle: TransferHandle, data: &[u8]) -> usize;

    /// Fills `out` with upload bytes. Returning 0 ends the upload.
    fn read(&mut self, handle: TransferHandle, out: &mut [u8]) -> usize;
}

/// Outcome of one `perform` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perform {
    /// More work is immediately available; call `perform` again.
    CallAgain,
    /// Nothing left to do until the engine signals or times out.
    Idle,
}

/// A finished transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub handle: TransferHandle,
    pub result: TransferResult<()>,
}

/// Multiplexed, non-blocking transfer driver.
///
/// All methods are called with the reactor lock held, from whichever thread
/// holds it; none of them may block.
pub trait MultiplexEngine: Send + 'static {
    /// Gives the engine the notifier it must signal when work is ready.
    fn attach(&mut self, notifier: Notifier);

    /// Registers and starts a transfer.
    fn add(&mut self, handle: TransferHandle, spec: TransferSpec) -> TransferResult<()>;

    /// Detaches a transfer. No further callbacks or completions are produced
    /// for `handle`. Unknown handles are ignored.
    fn remove(&mut self, handle: TransferHandle);

    /// Runs one non-blocking I/O step.
    fn perform(&mut self, io: &mut dyn TransferIo) -> Perform;

    /// Pops the next finished transfer.
    fn next_completed(&mut self) -> Option<Completion>;

    /// How long the reactor may sleep before calling `perform` again.
    fn timeout(&self) -> Option<Duration>;

    /// Number of registered transfers.
    fn active_count(&self) -> usize;
}
