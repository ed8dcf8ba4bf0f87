//! HTTP(S) engine built on reqwest, driven by a small tokio runtime.
//!
//! # Architecture
//!
//! ```text
//!   reactor thread (perform)                runtime task (one per transfer)
//!   ────────────────────────                ───────────────────────────────
//!                                           permits.acquire()   (queued here)
//!                                           client.request(...).send()
//!   io.header(line) ◄──── Event::Header ─── status line, header lines, ""
//!   io.write(bytes) ◄──── Event::Body ───── response.chunk() loop
//!   completed.push  ◄──── Event::Done ───── Ok / HttpStatus / Timeout / ...
//!
//!   io.read(buf) ──► UploadPump ══ mpsc(upload_window) ══► upload_stream
//!                                                          └► Body::wrap_stream
//! ```
//!
//! Every event is pushed to a shared queue and followed by a notifier signal,
//! so the reactor sleeps until there is something to dispatch. Upload bytes
//! flow the other way: the reactor pulls them from the request and keeps the
//! bounded channel topped up; the upload stream signals each time it takes a
//! chunk so the reactor refills it.
//!
//! Removing a transfer aborts its task. The response is dropped with it, so a
//! connection stalled mid-body is closed rather than left open. At most
//! `max_concurrent_transfers` tasks talk to the network at a time; the rest
//! wait for a permit.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, Stream};
use parking_lot::Mutex;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Body, Client};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{
    Completion, Method, MultiplexEngine, Perform, TransferHandle, TransferIo, TransferSpec,
};
use crate::config::TransferConfig;
use crate::error::{TransferError, TransferResult};
use crate::reactor::Notifier;

/// Name of the runtime's worker threads.
pub const HTTP_THREAD_NAME: &str = "rangefetch-http";

/// Worker threads of the engine's runtime.
const RUNTIME_THREADS: usize = 2;

enum Event {
    Header(String),
    Body(Bytes),
    Done(TransferResult<()>),
}

type EventQueue = Arc<Mutex<VecDeque<(TransferHandle, Event)>>>;

/// Task-side end of the event queue for one transfer.
struct EventSink {
    handle: TransferHandle,
    queue: EventQueue,
    notifier: Notifier,
}

impl EventSink {
    fn emit(&self, event: Event) {
        self.queue.lock().push_back((self.handle, event));
        self.notifier.signal();
    }
}

/// Reactor-side feeder of a streaming upload.
struct UploadPump {
    tx: Sender<Bytes>,
    pending: Option<Bytes>,
    remaining: u64,
}

/// Request body fed by the reactor's [`UploadPump`].
///
/// Signals `notifier` after every chunk it takes, since that frees a slot in
/// the channel.
fn upload_stream(
    rx: Receiver<Bytes>,
    notifier: Notifier,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    stream::unfold((rx, notifier), |(mut rx, notifier)| async move {
        let chunk = rx.recv().await?;
        notifier.signal();
        Some((Ok::<_, io::Error>(chunk), (rx, notifier)))
    })
}

struct Running {
    task: JoinHandle<()>,
    upload: Option<UploadPump>,
}

struct Job {
    spec: TransferSpec,
    upload: Option<Receiver<Bytes>>,
    fail_on_error: bool,
    buffer_size: usize,
    timeout_secs: u64,
}

/// Runtime, client and concurrency limit, built on first use.
struct Backend {
    runtime: Runtime,
    client: Client,
    permits: Arc<Semaphore>,
}

/// [`MultiplexEngine`] for `http` and `https` URLs.
pub struct HttpEngine {
    config: TransferConfig,
    backend: Option<Backend>,
    notifier: Notifier,
    events: EventQueue,
    transfers: HashMap<TransferHandle, Running>,
    completed: VecDeque<Completion>,
}

impl HttpEngine {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            backend: None,
            notifier: Notifier::new(),
            events: Arc::new(Mutex::new(VecDeque::new())),
            transfers: HashMap::new(),
            completed: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Returns the shared backend, building it on first use.
    fn backend(&mut self, uri: &str) -> TransferResult<&Backend> {
        if self.backend.is_none() {
            self.backend = Some(self.build_backend(uri)?);
        }
        self.backend.as_ref().ok_or(TransferError::ShuttingDown)
    }

    fn build_backend(&self, uri: &str) -> TransferResult<Backend> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(RUNTIME_THREADS)
            .thread_name(HTTP_THREAD_NAME)
            .enable_all()
            .build()
            .map_err(|e| TransferError::Spawn {
                name: HTTP_THREAD_NAME.to_string(),
                reason: e.to_string(),
            })?;

        let mut builder = Client::builder()
            .user_agent(self.config.user_agent.clone())
            .connect_timeout(self.config.connect_timeout)
            .pool_max_idle_per_host(self.config.max_idle_connections);
        if let Some(timeout) = self.config.request_timeout {
            builder = builder.timeout(timeout);
        }
        if !self.config.use_system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder.build().map_err(|e| TransferError::Transport {
            uri: uri.to_string(),
            reason: format!("failed to create HTTP client: {}", e),
        })?;

        let limit = self.config.max_concurrent_transfers.max(1);
        debug!(max_transfers = limit, "HTTP backend ready");
        Ok(Backend {
            runtime,
            client,
            permits: Arc::new(Semaphore::new(limit)),
        })
    }

    /// Keeps the upload channel of every transfer full.
    fn pump_uploads(&mut self, io: &mut dyn TransferIo) {
        let buffer_size = self.config.buffer_size;
        for (&handle, running) in self.transfers.iter_mut() {
            let Some(pump) = running.upload.as_mut() else {
                continue;
            };
            let finished = loop {
                let chunk = match pump.pending.take() {
                    Some(chunk) => chunk,
                    None => {
                        if pump.remaining == 0 {
                            break true;
                        }
                        let want = pump.remaining.min(buffer_size as u64) as usize;
                        let mut buf = vec![0u8; want];
                        let n = io.read(handle, &mut buf);
                        if n == 0 {
                            break true;
                        }
                        buf.truncate(n);
                        pump.remaining -= n as u64;
                        Bytes::from(buf)
                    }
                };
                match pump.tx.try_send(chunk) {
                    Ok(()) => {}
                    Err(TrySendError::Full(chunk)) => {
                        pump.pending = Some(chunk);
                        break false;
                    }
                    Err(TrySendError::Closed(_)) => break true,
                }
            };
            if finished {
                trace!(%handle, "upload source drained");
                running.upload = None;
            }
        }
    }
}

impl MultiplexEngine for HttpEngine {
    fn attach(&mut self, notifier: Notifier) {
        self.notifier = notifier;
    }

    fn add(&mut self, handle: TransferHandle, spec: TransferSpec) -> TransferResult<()> {
        let scheme = spec.url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(TransferError::UnsupportedScheme {
                scheme: scheme.to_string(),
            });
        }

        let (pump, upload) = match spec.upload_len {
            Some(len) if spec.method == Method::Put => {
                let (tx, rx) = mpsc::channel(self.config.upload_window.max(1));
                let pump = UploadPump {
                    tx,
                    pending: None,
                    remaining: len,
                };
                (Some(pump), Some(rx))
            }
            _ => (None, None),
        };

        let job = Job {
            spec,
            upload,
            fail_on_error: self.config.fail_on_error,
            buffer_size: self.config.buffer_size.max(1),
            timeout_secs: self.config.request_timeout.map_or(0, |t| t.as_secs()),
        };
        let sink = EventSink {
            handle,
            queue: Arc::clone(&self.events),
            notifier: self.notifier.clone(),
        };

        let backend = self.backend(job.spec.url.as_str())?;
        let client = backend.client.clone();
        let permits = Arc::clone(&backend.permits);
        let task = backend.runtime.spawn(async move {
            let result = execute(client, permits, job, &sink).await;
            sink.emit(Event::Done(result));
        });

        self.transfers.insert(handle, Running { task, upload: pump });
        Ok(())
    }

    fn remove(&mut self, handle: TransferHandle) {
        if let Some(running) = self.transfers.remove(&handle) {
            running.task.abort();
        }
        self.events.lock().retain(|(h, _)| *h != handle);
        self.completed.retain(|c| c.handle != handle);
    }

    fn perform(&mut self, io: &mut dyn TransferIo) -> Perform {
        let events = std::mem::take(&mut *self.events.lock());

        for (handle, event) in events {
            if !self.transfers.contains_key(&handle) {
                continue;
            }
            let result = match event {
                Event::Header(line) => {
                    io.header(handle, &line);
                    continue;
                }
                Event::Body(data) => {
                    if io.write(handle, &data) == data.len() {
                        continue;
                    }
                    Err(TransferError::WriteRejected)
                }
                Event::Done(result) => result,
            };
            if let Some(running) = self.transfers.remove(&handle) {
                running.task.abort();
            }
            self.completed.push_back(Completion { handle, result });
        }

        self.pump_uploads(io);

        if self.events.lock().is_empty() {
            Perform::Idle
        } else {
            Perform::CallAgain
        }
    }

    fn next_completed(&mut self) -> Option<Completion> {
        self.completed.pop_front()
    }

    fn timeout(&self) -> Option<Duration> {
        if self.transfers.is_empty() {
            None
        } else {
            Some(self.config.idle_poll_interval)
        }
    }

    fn active_count(&self) -> usize {
        self.transfers.len()
    }
}

impl Drop for HttpEngine {
    fn drop(&mut self) {
        for running in self.transfers.values() {
            running.task.abort();
        }
        if let Some(backend) = self.backend.take() {
            backend.runtime.shutdown_background();
        }
    }
}

/// Runs one transfer to completion on the engine's runtime.
async fn execute(
    client: Client,
    permits: Arc<Semaphore>,
    job: Job,
    sink: &EventSink,
) -> TransferResult<()> {
    let Job {
        spec,
        upload,
        fail_on_error,
        buffer_size,
        timeout_secs,
    } = job;
    let uri = spec.url.to_string();

    let _permit = permits
        .acquire_owned()
        .await
        .map_err(|_| TransferError::ShuttingDown)?;
    trace!(uri = %uri, "transfer slot acquired");

    let method = match spec.method {
        Method::Get => reqwest::Method::GET,
        Method::Put => reqwest::Method::PUT,
        Method::Delete => reqwest::Method::DELETE,
    };
    let mut builder = client.request(method, spec.url.clone());
    for line in &spec.headers {
        match line.split_once(':') {
            Some((name, value)) => builder = builder.header(name.trim(), value.trim()),
            None => warn!(uri = %uri, header = %line, "skipping malformed header"),
        }
    }
    if spec.method == Method::Get {
        if let Some(range) = &spec.range {
            builder = builder.header(RANGE, format!("bytes={}", range));
        }
    }
    if let Some(rx) = upload {
        let body = Body::wrap_stream(upload_stream(rx, sink.notifier.clone()));
        builder = builder
            .header(CONTENT_LENGTH, spec.upload_len.unwrap_or(0))
            .body(body);
    }

    let mut response = builder
        .send()
        .await
        .map_err(|e| classify(&uri, timeout_secs, e.is_timeout(), e.to_string()))?;

    let status = response.status();
    debug!(uri = %uri, %status, "response received");
    sink.emit(Event::Header(format!("{:?} {}", response.version(), status)));
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            sink.emit(Event::Header(format!("{}: {}", name, value)));
        }
    }
    sink.emit(Event::Header(String::new()));

    if fail_on_error && status.as_u16() >= 400 {
        return Err(TransferError::HttpStatus {
            uri,
            status: status.as_u16(),
        });
    }
    if spec.no_body {
        return Ok(());
    }

    while let Some(mut chunk) = response
        .chunk()
        .await
        .map_err(|e| classify(&uri, timeout_secs, e.is_timeout(), e.to_string()))?
    {
        while !chunk.is_empty() {
            let piece = chunk.split_to(chunk.len().min(buffer_size));
            sink.emit(Event::Body(piece));
        }
    }
    Ok(())
}

fn classify(uri: &str, timeout_secs: u64, timed_out: bool, reason: String) -> TransferError {
    if timed_out {
        TransferError::Timeout {
            uri: uri.to_string(),
            timeout_secs,
        }
    } else {
        TransferError::Transport {
            uri: uri.to_string(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::TryStreamExt;
    use reqwest::Url;

    struct NullIo;

    impl TransferIo for NullIo {
        fn header(&mut self, _handle: TransferHandle, _line: &str) {}

        fn write(&mut self, _handle: TransferHandle, data: &[u8]) -> usize {
            data.len()
        }

        fn read(&mut self, _handle: TransferHandle, _out: &mut [u8]) -> usize {
            0
        }
    }

    #[test]
    fn test_rejects_non_http_schemes() {
        let mut engine = HttpEngine::new(TransferConfig::default());
        for url in ["ftp://example.com/a", "sftp://example.com/a", "file:///tmp/a"] {
            let spec = TransferSpec::get(Url::parse(url).unwrap());
            let result = engine.add(TransferHandle::new(1), spec);
            assert!(matches!(result, Err(TransferError::UnsupportedScheme { .. })));
        }
        assert_eq!(engine.active_count(), 0);
        assert!(engine.backend.is_none());
    }

    #[test]
    fn test_idle_engine_has_no_timeout() {
        let engine = HttpEngine::new(TransferConfig::default());
        assert_eq!(engine.timeout(), None);
    }

    #[test]
    fn test_events_for_removed_transfers_are_dropped() {
        let mut engine = HttpEngine::new(TransferConfig::default());
        let handle = TransferHandle::new(3);
        engine.events.lock().push_back((handle, Event::Done(Ok(()))));

        assert_eq!(engine.perform(&mut NullIo), Perform::Idle);
        assert!(engine.next_completed().is_none());
    }

    #[test]
    fn test_upload_stream_signals_on_each_chunk() {
        let notifier = Notifier::new();
        let (tx, rx) = mpsc::channel(2);
        tx.try_send(Bytes::from_static(b"abc")).unwrap();
        tx.try_send(Bytes::from_static(b"de")).unwrap();
        drop(tx);

        let chunks: Vec<Bytes> =
            block_on(upload_stream(rx, notifier.clone()).try_collect()).unwrap();
        assert_eq!(chunks.concat(), b"abcde");
        assert!(notifier.is_pending());
    }

    #[test]
    fn test_classify_timeout() {
        let error = classify("http://h/a", 30, true, "deadline".to_string());
        assert_eq!(
            error,
            TransferError::Timeout {
                uri: "http://h/a".to_string(),
                timeout_secs: 30
            }
        );
        assert!(matches!(
            classify("http://h/a", 30, false, "reset".to_string()),
            TransferError::Transport { .. }
        ));
    }
}
