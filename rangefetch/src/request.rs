//! A single fetch, store or delete operation.
//!
//! # Lifecycle
//!
//! ```text
//!            submit()                  transport done
//!   Idle ──────────────► Active ──────────────────────► Completed
//!     │                    │
//!     │ abort()            │ abort()
//!     └────────────────────┴──────────────────────────► Aborted
//! ```
//!
//! While `Active`, a request holds a strong reference to itself
//! (`self_retain`) so that it outlives every external owner until the reactor
//! has delivered its completion. The completion path takes a second reference
//! onto the stack, clears `self_retain`, runs the callback, and only then lets
//! the stack reference go. See [`crate::reactor`] for the other half.
//!
//! # Example
//!
//! ```ignore
//! use rangefetch::{ByteRange, Reactor, TransferRequest};
//!
//! let request = TransferRequest::get(
//!     "http://example.com/big.bin",
//!     ByteRange::new(1024, 4096),
//!     Vec::new(),
//!     Box::new(|_request, data, success| {
//!         println!("got {} bytes (success: {})", data.len(), success);
//!     }),
//! )?;
//! request.submit(Reactor::global()?)?;
//! ```

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use reqwest::Url;
use tracing::{debug, trace};

use crate::buffer::SparseBuffer;
use crate::error::{TransferError, TransferResult};
use crate::range::ByteRange;
use crate::reactor::{Reactor, ReactorHandle, Shared};
use crate::transport::{Method, TransferHandle, TransferSpec};

/// Completion callback: `(request, data, success)`.
///
/// Runs on the reactor thread (or synchronously inside `submit`/`abort`) with
/// no engine lock held, so it may submit or abort other requests freely.
pub type TransferCallback = Box<dyn FnOnce(&Arc<TransferRequest>, Arc<SparseBuffer>, bool) + Send>;

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    Active,
    Completed,
    Aborted,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Aborted)
    }
}

struct RequestInner {
    state: RequestState,
    requested_range: ByteRange,
    range_spec: Option<String>,
    response: Arc<SparseBuffer>,
    write_offset: u64,
    upload_offset: u64,
    status: Option<u16>,
    callback: Option<TransferCallback>,
    transport: Option<TransferHandle>,
    reactor: Option<Weak<Shared>>,
    self_retain: Option<Arc<TransferRequest>>,
    last_error: Option<TransferError>,
}

/// One logical transfer.
///
/// Always handled through `Arc<TransferRequest>`; the constructors return one.
pub struct TransferRequest {
    uri: Url,
    method: Method,
    headers: Vec<String>,
    upload: Option<SparseBuffer>,
    inner: Mutex<RequestInner>,
}

/// What `prepare` decided about a submission.
pub(crate) enum Activation {
    /// Hand this spec to the engine.
    Ready(TransferSpec),
    /// The request failed before reaching the engine.
    Rejected(Finished),
}

/// A completed request waiting for its callback to run.
///
/// Built under the reactor lock, fired after it is released.
pub(crate) struct Finished {
    request: Arc<TransferRequest>,
    callback: Option<TransferCallback>,
    data: Arc<SparseBuffer>,
    success: bool,
    retain: Option<Arc<TransferRequest>>,
}

impl Finished {
    pub(crate) fn success(&self) -> bool {
        self.success
    }

    /// Runs the callback, then drops the request's former self-reference.
    pub(crate) fn fire(self) {
        let Finished {
            request,
            callback,
            data,
            success,
            retain,
        } = self;
        if let Some(callback) = callback {
            callback(&request, data, success);
        }
        drop(retain);
        drop(request);
    }
}

impl TransferRequest {
    /// Creates an idle request. No I/O happens until `submit`.
    ///
    /// # Arguments
    ///
    /// * `uri` - Target resource (`http`, `https`, `ftp`, `sftp`, ...)
    /// * `range` - Bytes to fetch, or the part of `upload` to send
    /// * `method` - Transfer verb
    /// * `headers` - Raw `Name: value` lines (HTTP) or commands (FTP)
    /// * `upload` - Source bytes for `Put`
    /// * `callback` - Fired exactly once per submission
    pub fn new(
        uri: &str,
        range: ByteRange,
        method: Method,
        headers: Vec<String>,
        upload: Option<SparseBuffer>,
        callback: TransferCallback,
    ) -> TransferResult<Arc<Self>> {
        let uri = Url::parse(uri).map_err(|e| TransferError::InvalidUri {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Arc::new(Self {
            uri,
            method,
            headers,
            upload,
            inner: Mutex::new(RequestInner {
                state: RequestState::Idle,
                requested_range: range,
                range_spec: None,
                response: Arc::new(SparseBuffer::for_range(range)),
                write_offset: range.start(),
                upload_offset: range.start(),
                status: None,
                callback: Some(callback),
                transport: None,
                reactor: None,
                self_retain: None,
                last_error: None,
            }),
        }))
    }

    /// Creates a download request.
    pub fn get(
        uri: &str,
        range: ByteRange,
        headers: Vec<String>,
        callback: TransferCallback,
    ) -> TransferResult<Arc<Self>> {
        Self::new(uri, range, Method::Get, headers, None, callback)
    }

    /// Creates an upload of `upload`, starting at its base offset.
    pub fn put(
        uri: &str,
        upload: SparseBuffer,
        headers: Vec<String>,
        callback: TransferCallback,
    ) -> TransferResult<Arc<Self>> {
        let range = ByteRange::from_offset(upload.base());
        Self::new(uri, range, Method::Put, headers, Some(upload), callback)
    }

    /// Creates a delete request.
    pub fn delete(
        uri: &str,
        headers: Vec<String>,
        callback: TransferCallback,
    ) -> TransferResult<Arc<Self>> {
        Self::new(uri, ByteRange::whole(), Method::Delete, headers, None, callback)
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn upload(&self) -> Option<&SparseBuffer> {
        self.upload.as_ref()
    }

    pub fn state(&self) -> RequestState {
        self.inner.lock().state
    }

    /// The range currently being fetched.
    ///
    /// Becomes the whole resource if the server ignored a partial request.
    pub fn requested_range(&self) -> ByteRange {
        self.inner.lock().requested_range
    }

    /// Snapshot of the bytes received so far.
    pub fn response(&self) -> Arc<SparseBuffer> {
        Arc::clone(&self.inner.lock().response)
    }

    /// Last status code seen in a status line.
    pub fn status(&self) -> Option<u16> {
        self.inner.lock().status
    }

    /// Why the last submission failed, if it did.
    pub fn last_error(&self) -> Option<TransferError> {
        self.inner.lock().last_error.clone()
    }

    /// Engine handle while active.
    pub fn transport_handle(&self) -> Option<TransferHandle> {
        self.inner.lock().transport
    }

    /// Registers this request with `reactor`.
    ///
    /// Invalid ranges and engine refusals are reported through the callback
    /// with `success == false` before this returns.
    ///
    /// # Errors
    ///
    /// - `TransferError::AlreadyActive` - The request is still in flight
    /// - `TransferError::AlreadyFinished` - The request finished and was not
    ///   [`reset`](Self::reset)
    pub fn submit(self: &Arc<Self>, reactor: &Reactor) -> TransferResult<()> {
        reactor.submit(self)
    }

    /// Like [`submit`](Self::submit), through a cloned handle.
    pub fn submit_to(self: &Arc<Self>, reactor: &ReactorHandle) -> TransferResult<()> {
        reactor.submit(self)
    }

    /// Re-arms a finished request with a new range and callback.
    ///
    /// The previous response is discarded. May be called from inside the
    /// request's own callback.
    ///
    /// # Errors
    ///
    /// - `TransferError::AlreadyActive` - The request is still in flight
    pub fn reset(&self, range: ByteRange, callback: TransferCallback) -> TransferResult<()> {
        let mut inner = self.inner.lock();
        if inner.state == RequestState::Active {
            return Err(TransferError::AlreadyActive);
        }
        inner.state = RequestState::Idle;
        inner.requested_range = range;
        inner.range_spec = None;
        inner.response = Arc::new(SparseBuffer::for_range(range));
        inner.write_offset = range.start();
        inner.upload_offset = range.start();
        inner.status = None;
        inner.callback = Some(callback);
        inner.last_error = None;
        Ok(())
    }

    /// Cancels the request.
    ///
    /// The transport handle is detached before this returns, then the
    /// callback fires with `success == false` and whatever arrived so far. If
    /// the reactor completed the request first, this is a no-op.
    pub fn abort(self: &Arc<Self>) {
        let reactor = self.inner.lock().reactor.as_ref().and_then(Weak::upgrade);
        let finished = match reactor {
            Some(shared) => shared.abort(self),
            None => self.finish_aborted(),
        };
        if let Some(finished) = finished {
            finished.fire();
        }
    }

    // =========================================================================
    // Reactor-side lifecycle (called with the reactor lock held)
    // =========================================================================

    /// Validates the request and builds its engine spec.
    pub(crate) fn prepare(self: &Arc<Self>) -> TransferResult<Activation> {
        let mut inner = self.inner.lock();
        match inner.state {
            RequestState::Active => return Err(TransferError::AlreadyActive),
            RequestState::Completed | RequestState::Aborted => {
                return Err(TransferError::AlreadyFinished)
            }
            RequestState::Idle => {}
        }

        let range = inner.requested_range;
        if !range.is_valid() {
            debug!(uri = %self.uri, %range, "rejecting invalid range");
            inner.response = Arc::new(SparseBuffer::for_range(range));
            let error = TransferError::InvalidRange {
                range: range.to_string(),
            };
            return Ok(Activation::Rejected(self.finish_locked(
                &mut inner,
                RequestState::Completed,
                Some(error),
            )));
        }

        debug_assert!(inner.transport.is_none());
        inner.range_spec = range.to_range_spec();
        inner.response = Arc::new(SparseBuffer::for_range(range));
        inner.write_offset = range.start();
        inner.upload_offset = range.start();
        inner.status = None;
        inner.last_error = None;

        Ok(Activation::Ready(self.build_spec(range, inner.range_spec.clone())))
    }

    fn build_spec(&self, range: ByteRange, range_spec: Option<String>) -> TransferSpec {
        let scheme = self.uri.scheme();
        let is_http = scheme == "http" || scheme == "https";

        let mut spec = TransferSpec::get(self.uri.clone());
        spec.method = self.method;
        spec.range = range_spec;
        if is_http {
            spec.headers = self.headers.clone();
        } else {
            spec.post_quote = self.headers.clone();
        }

        match self.method {
            Method::Get => {}
            Method::Put => {
                let source_end = self.upload.as_ref().map_or(0, SparseBuffer::end);
                let end = range.end().map_or(source_end, |end| end.min(source_end));
                spec.upload_len = Some(end.saturating_sub(range.start()));
            }
            Method::Delete => {
                spec.no_body = true;
                let file = self.file_name();
                match scheme {
                    "ftp" | "ftps" => spec.post_quote.push(format!("DELE {}", file)),
                    "sftp" => spec.post_quote.push(format!("rm {}", file)),
                    _ => {}
                }
            }
        }
        spec
    }

    fn file_name(&self) -> String {
        self.uri
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default()
            .to_string()
    }

    /// Marks the request active under `handle`.
    pub(crate) fn activate(self: &Arc<Self>, handle: TransferHandle, reactor: Weak<Shared>) {
        let mut inner = self.inner.lock();
        inner.state = RequestState::Active;
        inner.transport = Some(handle);
        inner.reactor = Some(reactor);
        inner.self_retain = Some(Arc::clone(self));
    }

    /// Records a failure that prevented activation.
    pub(crate) fn reject(self: &Arc<Self>, error: TransferError) -> Finished {
        let mut inner = self.inner.lock();
        self.finish_locked(&mut inner, RequestState::Completed, Some(error))
    }

    /// Takes the transport handle, leaving `None`.
    pub(crate) fn take_handle(&self) -> Option<TransferHandle> {
        self.inner.lock().transport.take()
    }

    /// Completion of an engine transfer.
    pub(crate) fn complete(self: &Arc<Self>, result: TransferResult<()>) -> Finished {
        let mut inner = self.inner.lock();
        inner.transport = None;
        self.finish_locked(&mut inner, RequestState::Completed, result.err())
    }

    /// Abort path. `None` if the request already finished.
    pub(crate) fn finish_aborted(self: &Arc<Self>) -> Option<Finished> {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return None;
        }
        inner.transport = None;
        Some(self.finish_locked(
            &mut inner,
            RequestState::Aborted,
            Some(TransferError::Aborted),
        ))
    }

    fn finish_locked(
        self: &Arc<Self>,
        inner: &mut RequestInner,
        state: RequestState,
        error: Option<TransferError>,
    ) -> Finished {
        inner.state = state;
        let success = error.is_none();
        inner.last_error = error;
        Finished {
            request: Arc::clone(self),
            callback: inner.callback.take(),
            data: Arc::clone(&inner.response),
            success,
            retain: inner.self_retain.take(),
        }
    }

    // =========================================================================
    // Transport callbacks
    // =========================================================================

    /// Stores received body bytes at the write cursor.
    pub(crate) fn on_write(&self, data: &[u8]) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let open_ended = inner.requested_range.goes_to_end();
        let response = Arc::make_mut(&mut inner.response);

        let base = response.base();
        let offset = inner.write_offset;
        let (at, payload) = if offset < base {
            let skip = (base - offset).min(data.len() as u64) as usize;
            (base, &data[skip..])
        } else {
            (offset, data)
        };

        let needed = (at - base).saturating_add(payload.len() as u64);
        if response.len() < needed {
            response.set_length(needed, open_ended);
        }
        response.write_at(at, payload);

        inner.write_offset = inner.write_offset.saturating_add(data.len() as u64);
        data.len()
    }

    /// Serves upload bytes from the cursor, zero-filling gaps.
    pub(crate) fn on_read(&self, out: &mut [u8]) -> usize {
        let Some(upload) = &self.upload else {
            return 0;
        };
        let mut inner = self.inner.lock();
        let offset = inner.upload_offset;
        if offset < upload.base() {
            return 0;
        }
        let limit = inner
            .requested_range
            .end()
            .map_or(out.len() as u64, |end| end.saturating_sub(offset))
            .min(out.len() as u64) as usize;

        let n = upload.read_into(offset, &mut out[..limit]);
        inner.upload_offset += n as u64;
        n
    }

    /// Interprets one response header line.
    pub(crate) fn on_header(&self, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let Some((name, value)) = line.split_once(':') else {
            // "HTTP/1.1 200 OK", or the blank line closing the header block.
            let mut parts = line.split_whitespace();
            let _version = parts.next();
            let Some(code) = parts.next().and_then(|c| c.parse::<u16>().ok()) else {
                return;
            };
            inner.status = Some(code);

            if code == 200 && !inner.requested_range.is_whole() {
                debug!(
                    uri = %self.uri,
                    requested = %inner.requested_range,
                    "server ignored range, receiving whole resource"
                );
                inner.requested_range = ByteRange::whole();
                inner.write_offset = 0;
                let response = Arc::make_mut(&mut inner.response);
                response.set_base(0);
                response.set_length(0, true);
            }
            return;
        };

        let value = value.trim();
        if name.trim().eq_ignore_ascii_case("content-length") {
            if let Ok(length) = value.parse::<u64>() {
                if length > 0 {
                    let open_ended = inner.requested_range.goes_to_end();
                    let response = Arc::make_mut(&mut inner.response);
                    response.set_length(length, open_ended);
                    debug!(uri = %self.uri, range = %response.range(), "sized response");
                }
            }
        }
        trace!(uri = %self.uri, header = name, value, "got header");
    }
}

impl fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TransferRequest")
            .field("uri", &self.uri.as_str())
            .field("method", &self.method)
            .field("state", &inner.state)
            .field("requested_range", &inner.requested_range)
            .field("transport", &inner.transport)
            .finish()
    }
}
