//! In-memory engine that replays canned responses.
//!
//! Responses are registered per URL through a [`ScriptedControl`], which stays
//! usable after the engine has been moved into a reactor. Each `perform` step
//! delivers at most one body chunk per transfer, so chunking and interleaving
//! are deterministic.
//!
//! # Example
//!
//! ```ignore
//! let (engine, control) = ScriptedEngine::new();
//! control.respond("http://test/data", ScriptedResponse::ok(vec![0u8; 1024]).honoring_ranges());
//! let reactor = Reactor::start(engine)?;
//! ```

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    Completion, Method, MultiplexEngine, Perform, TransferHandle, TransferIo, TransferSpec,
};
use crate::error::{TransferError, TransferResult};
use crate::range::ByteRange;
use crate::reactor::Notifier;

/// Default body chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

const UPLOAD_READ_SIZE: usize = 4096;

/// A canned response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    chunk_size: usize,
    honor_ranges: bool,
    content_length: bool,
    held: bool,
    failure: Option<TransferError>,
}

impl ScriptedResponse {
    /// `200` with `body`.
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            honor_ranges: false,
            content_length: true,
            held: false,
            failure: None,
        }
    }

    /// An empty response with `status`.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::ok(Vec::new())
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Delivers the body in chunks of `size` bytes (at least one).
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Answers range requests with `206` and the requested slice.
    pub fn honoring_ranges(mut self) -> Self {
        self.honor_ranges = true;
        self
    }

    /// Omits the `Content-Length` header.
    pub fn without_content_length(mut self) -> Self {
        self.content_length = false;
        self
    }

    /// Holds the transfer until [`ScriptedControl::release`] is called.
    pub fn held(mut self) -> Self {
        self.held = true;
        self
    }

    /// Delivers the body, then fails the transfer with `error`.
    pub fn failing_with(mut self, error: TransferError) -> Self {
        self.failure = Some(error);
        self
    }
}

#[derive(Default)]
struct ScriptState {
    responses: HashMap<String, ScriptedResponse>,
    released: HashSet<String>,
    requests: Vec<TransferSpec>,
    uploads: Vec<(String, Vec<u8>)>,
    notifier: Option<Notifier>,
}

/// Test-side handle to a [`ScriptedEngine`].
#[derive(Clone)]
pub struct ScriptedControl {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedControl {
    /// Registers the response served for `url`. Unknown URLs get a `404`.
    pub fn respond(&self, url: &str, response: ScriptedResponse) {
        self.state.lock().responses.insert(url.to_string(), response);
    }

    /// Lets held transfers of `url` proceed, now and in future.
    pub fn release(&self, url: &str) {
        let notifier = {
            let mut state = self.state.lock();
            state.released.insert(url.to_string());
            state.notifier.clone()
        };
        if let Some(notifier) = notifier {
            notifier.signal();
        }
    }

    /// Every spec passed to `add`, in order.
    pub fn requests(&self) -> Vec<TransferSpec> {
        self.state.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Every uploaded body as `(url, bytes)`, in completion order.
    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().uploads.clone()
    }
}

struct Scripted {
    url: String,
    spec: TransferSpec,
    headers: Vec<String>,
    headers_sent: bool,
    body: Vec<u8>,
    sent: usize,
    chunk_size: usize,
    held: bool,
    status: u16,
    failure: Option<TransferError>,
}

impl Scripted {
    fn new(spec: TransferSpec, response: ScriptedResponse) -> Self {
        let url = spec.url.to_string();
        let mut status = response.status;
        let mut body = response.body;
        let mut headers = response.headers;

        if response.honor_ranges && status == 200 {
            if let Some(range) = spec.range.as_deref().and_then(|r| r.parse::<ByteRange>().ok()) {
                let total = body.len() as u64;
                if range.start() >= total {
                    status = 416;
                    body.clear();
                } else {
                    let end = range.end().map_or(total, |end| end.min(total));
                    headers.push((
                        "Content-Range".to_string(),
                        format!("bytes {}-{}/{}", range.start(), end - 1, total),
                    ));
                    body = body[range.start() as usize..end as usize].to_vec();
                    status = 206;
                }
            }
        }

        let mut lines = vec![format!("HTTP/1.1 {}", status)];
        lines.extend(headers.iter().map(|(name, value)| format!("{}: {}", name, value)));
        if response.content_length {
            lines.push(format!("Content-Length: {}", body.len()));
        }
        lines.push(String::new());

        if spec.no_body || status >= 400 {
            body.clear();
        }

        Self {
            url,
            spec,
            headers: lines,
            headers_sent: false,
            body,
            sent: 0,
            chunk_size: response.chunk_size,
            held: response.held,
            status,
            failure: response.failure,
        }
    }

    fn upload(&self, handle: TransferHandle, io: &mut dyn TransferIo) -> Vec<u8> {
        let limit = self.spec.upload_len.unwrap_or(0) as usize;
        let mut received = Vec::with_capacity(limit);
        let mut chunk = [0u8; UPLOAD_READ_SIZE];
        while received.len() < limit {
            let want = (limit - received.len()).min(UPLOAD_READ_SIZE);
            let n = io.read(handle, &mut chunk[..want]);
            if n == 0 {
                break;
            }
            received.extend_from_slice(&chunk[..n]);
        }
        received
    }

    /// Runs one step. Returns the result once the transfer is done.
    fn step(
        &mut self,
        handle: TransferHandle,
        io: &mut dyn TransferIo,
        state: &mut ScriptState,
    ) -> Option<TransferResult<()>> {
        if !self.headers_sent {
            if self.spec.method == Method::Put {
                let uploaded = self.upload(handle, io);
                trace!(%handle, bytes = uploaded.len(), "scripted upload");
                state.uploads.push((self.url.clone(), uploaded));
            }
            for line in &self.headers {
                io.header(handle, line);
            }
            self.headers_sent = true;
            if self.status >= 400 {
                return Some(Err(TransferError::HttpStatus {
                    uri: self.url.clone(),
                    status: self.status,
                }));
            }
        }

        if self.sent < self.body.len() {
            let end = (self.sent + self.chunk_size).min(self.body.len());
            let chunk = &self.body[self.sent..end];
            if io.write(handle, chunk) < chunk.len() {
                return Some(Err(TransferError::WriteRejected));
            }
            self.sent = end;
            if self.sent < self.body.len() {
                return None;
            }
        }

        Some(match self.failure.take() {
            Some(error) => Err(error),
            None => Ok(()),
        })
    }
}

/// [`MultiplexEngine`] serving [`ScriptedResponse`]s from memory.
pub struct ScriptedEngine {
    state: Arc<Mutex<ScriptState>>,
    transfers: BTreeMap<TransferHandle, Scripted>,
    completed: VecDeque<Completion>,
}

impl ScriptedEngine {
    /// Creates an engine and the control used to script it.
    pub fn new() -> (Self, ScriptedControl) {
        let state = Arc::new(Mutex::new(ScriptState::default()));
        let engine = Self {
            state: Arc::clone(&state),
            transfers: BTreeMap::new(),
            completed: VecDeque::new(),
        };
        (engine, ScriptedControl { state })
    }
}

impl MultiplexEngine for ScriptedEngine {
    fn attach(&mut self, notifier: Notifier) {
        self.state.lock().notifier = Some(notifier);
    }

    fn add(&mut self, handle: TransferHandle, spec: TransferSpec) -> TransferResult<()> {
        let mut state = self.state.lock();
        let response = state
            .responses
            .get(spec.url.as_str())
            .cloned()
            .unwrap_or_else(|| ScriptedResponse::status(404));
        debug!(%handle, url = %spec.url, status = response.status, "scripted transfer added");
        state.requests.push(spec.clone());
        self.transfers.insert(handle, Scripted::new(spec, response));
        Ok(())
    }

    fn remove(&mut self, handle: TransferHandle) {
        self.transfers.remove(&handle);
        self.completed.retain(|c| c.handle != handle);
    }

    fn perform(&mut self, io: &mut dyn TransferIo) -> Perform {
        let mut state = self.state.lock();
        let mut done = Vec::new();
        let mut pending = false;

        for (&handle, transfer) in self.transfers.iter_mut() {
            if transfer.held {
                if !state.released.contains(&transfer.url) {
                    continue;
                }
                transfer.held = false;
            }
            match transfer.step(handle, io, &mut state) {
                Some(result) => done.push(Completion { handle, result }),
                None => pending = true,
            }
        }

        for completion in done {
            self.transfers.remove(&completion.handle);
            self.completed.push_back(completion);
        }

        if pending {
            Perform::CallAgain
        } else {
            Perform::Idle
        }
    }

    fn next_completed(&mut self) -> Option<Completion> {
        self.completed.pop_front()
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn active_count(&self) -> usize {
        self.transfers.len()
    }
}
