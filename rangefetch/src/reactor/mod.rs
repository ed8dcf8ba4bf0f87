//! The reactor: one background thread multiplexing every active transfer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Reactor                               │
//! │                                                                  │
//! │  caller threads                      reactor thread              │
//! │  ──────────────                      ──────────────              │
//! │  submit() ──┐                   ┌──► 1. drain completions        │
//! │  abort() ───┼─► Mutex<Core> ◄───┤       (callbacks run unlocked) │
//! │             │   ├ engine        ├──► 2. engine.timeout()         │
//! │             │   └ active map    │    3. notifier.wait(timeout)   │
//! │             │                   └──► 4. engine.perform() loop    │
//! │             └─► Notifier ────────────────────┘                   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The core mutex guards the engine and the handle registry and is never
//! held while a user callback runs, so callbacks may submit new requests,
//! abort others, or drop the last reference to their own request.
//!
//! # Lifetime of a request
//!
//! The registry only holds `Weak` references. What keeps an active request
//! alive is its own `self_retain`. On completion the reactor upgrades the
//! weak reference onto its stack, takes `self_retain` out of the request,
//! releases the lock and runs the callback; the request can only be freed
//! once that stack frame unwinds.

mod notifier;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::error::{TransferError, TransferResult};
use crate::request::{Activation, Finished, TransferRequest};
use crate::stats::{ReactorStats, StatsSnapshot};
use crate::transport::{HttpEngine, MultiplexEngine, Perform, TransferHandle, TransferIo};

pub use notifier::Notifier;

/// Name given to the background thread.
pub const REACTOR_THREAD_NAME: &str = "rangefetch-reactor";

static GLOBAL: OnceLock<Reactor> = OnceLock::new();
static GLOBAL_INIT: Mutex<()> = parking_lot::const_mutex(());

// =============================================================================
// Shared state
// =============================================================================

struct Core {
    engine: Box<dyn MultiplexEngine>,
    active: HashMap<TransferHandle, Weak<TransferRequest>>,
    next_handle: u64,
}

impl Core {
    fn allocate_handle(&mut self) -> TransferHandle {
        self.next_handle += 1;
        TransferHandle::new(self.next_handle)
    }
}

/// State shared by the reactor thread and every handle.
pub(crate) struct Shared {
    core: Mutex<Core>,
    notifier: Notifier,
    shutdown: AtomicBool,
    stats: ReactorStats,
}

impl Shared {
    fn submit(self: &Arc<Self>, request: &Arc<TransferRequest>) -> TransferResult<()> {
        let rejected = {
            let mut core = self.core.lock();
            match request.prepare()? {
                Activation::Rejected(finished) => Some(finished),
                Activation::Ready(_) if self.shutdown.load(Ordering::Acquire) => {
                    Some(request.reject(TransferError::ShuttingDown))
                }
                Activation::Ready(spec) => {
                    let handle = core.allocate_handle();
                    debug!(
                        %handle,
                        method = %spec.method,
                        uri = %spec.url,
                        range = spec.range.as_deref().unwrap_or("-"),
                        "starting transfer"
                    );
                    match core.engine.add(handle, spec) {
                        Ok(()) => {
                            request.activate(handle, Arc::downgrade(self));
                            core.active.insert(handle, Arc::downgrade(request));
                            self.stats.transfer_submitted();
                            None
                        }
                        Err(e) => {
                            warn!(%handle, error = %e, "engine refused transfer");
                            Some(request.reject(e))
                        }
                    }
                }
            }
        };

        match rejected {
            Some(finished) => {
                self.stats.transfer_finished(false);
                finished.fire();
            }
            None => self.notifier.signal(),
        }
        Ok(())
    }

    /// Detaches `request` from the engine and builds its aborted completion.
    pub(crate) fn abort(&self, request: &Arc<TransferRequest>) -> Option<Finished> {
        let mut core = self.core.lock();
        if let Some(handle) = request.take_handle() {
            debug!(%handle, uri = %request.uri(), "aborting transfer");
            core.engine.remove(handle);
            core.active.remove(&handle);
        }
        let finished = request.finish_aborted();
        if finished.is_some() {
            self.stats.transfer_aborted();
        }
        finished
    }

    /// Step 1: deliver every finished transfer, one lock scope each.
    fn dispatch_completions(&self) {
        loop {
            let finished = {
                let mut core = self.core.lock();
                let Some(completion) = core.engine.next_completed() else {
                    break;
                };
                core.engine.remove(completion.handle);
                let Some(request) = core
                    .active
                    .remove(&completion.handle)
                    .and_then(|weak| weak.upgrade())
                else {
                    continue;
                };
                match &completion.result {
                    Ok(()) => debug!(handle = %completion.handle, "transfer finished"),
                    Err(e) => {
                        debug!(handle = %completion.handle, error = %e, "transfer failed")
                    }
                }
                request.complete(completion.result)
            };
            self.stats.transfer_finished(finished.success());
            finished.fire();
        }
    }

    /// Step 4: run the engine until it has no immediate work.
    fn perform(&self) {
        let mut core = self.core.lock();
        let Core { engine, active, .. } = &mut *core;
        let mut io = Dispatch {
            active,
            stats: &self.stats,
        };
        while engine.perform(&mut io) == Perform::CallAgain {}
    }

    /// Completes every transfer still registered with `ShuttingDown`.
    fn abandon_all(&self) {
        let finished: Vec<Finished> = {
            let mut core = self.core.lock();
            let Core { engine, active, .. } = &mut *core;
            active
                .drain()
                .filter_map(|(handle, weak)| {
                    engine.remove(handle);
                    weak.upgrade()
                })
                .map(|request| request.complete(Err(TransferError::ShuttingDown)))
                .collect()
        };
        if !finished.is_empty() {
            info!(count = finished.len(), "abandoning transfers at shutdown");
        }
        for finished in finished {
            self.stats.transfer_finished(false);
            finished.fire();
        }
    }
}

/// Routes engine callbacks to the registered requests.
struct Dispatch<'a> {
    active: &'a HashMap<TransferHandle, Weak<TransferRequest>>,
    stats: &'a ReactorStats,
}

impl Dispatch<'_> {
    fn lookup(&self, handle: TransferHandle) -> Option<Arc<TransferRequest>> {
        self.active.get(&handle).and_then(Weak::upgrade)
    }
}

impl TransferIo for Dispatch<'_> {
    fn header(&mut self, handle: TransferHandle, line: &str) {
        if let Some(request) = self.lookup(handle) {
            request.on_header(line);
        }
    }

    fn write(&mut self, handle: TransferHandle, data: &[u8]) -> usize {
        let Some(request) = self.lookup(handle) else {
            return 0;
        };
        let written = request.on_write(data);
        self.stats.bytes_received(written);
        written
    }

    fn read(&mut self, handle: TransferHandle, out: &mut [u8]) -> usize {
        let Some(request) = self.lookup(handle) else {
            return 0;
        };
        let read = request.on_read(out);
        self.stats.bytes_sent(read);
        read
    }
}

fn run(shared: Arc<Shared>) {
    debug!("reactor thread started");
    while !shared.shutdown.load(Ordering::Acquire) {
        shared.dispatch_completions();

        let timeout = shared.core.lock().engine.timeout();
        shared.notifier.wait(timeout);
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        shared.perform();
    }
    debug!("reactor thread stopped");
}

// =============================================================================
// Public handles
// =============================================================================

/// Owner of a reactor thread.
///
/// Dropping the owner shuts the reactor down; cloned [`ReactorHandle`]s keep
/// working afterwards but every submission is rejected with `ShuttingDown`.
pub struct Reactor {
    handle: ReactorHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap, cloneable access to a running reactor, for use inside callbacks.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl Reactor {
    /// Starts a reactor thread driving `engine`.
    ///
    /// # Errors
    ///
    /// - `TransferError::Spawn` - The background thread could not be created
    pub fn start<E: MultiplexEngine>(mut engine: E) -> TransferResult<Self> {
        let notifier = Notifier::new();
        engine.attach(notifier.clone());

        let shared = Arc::new(Shared {
            core: Mutex::new(Core {
                engine: Box::new(engine),
                active: HashMap::new(),
                next_handle: 0,
            }),
            notifier,
            shutdown: AtomicBool::new(false),
            stats: ReactorStats::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(REACTOR_THREAD_NAME.to_string())
            .spawn(move || run(thread_shared))
            .map_err(|e| TransferError::Spawn {
                name: REACTOR_THREAD_NAME.to_string(),
                reason: e.to_string(),
            })?;

        info!("reactor started");
        Ok(Self {
            handle: ReactorHandle { shared },
            thread: Mutex::new(Some(thread)),
        })
    }

    /// The process-wide reactor over an [`HttpEngine`], started on first use.
    ///
    /// Configuration comes from [`TransferConfig::load_default`].
    ///
    /// Statics are never dropped, so nothing tears this reactor down on its
    /// own: the thread simply ends with the process. Hold the guard from
    /// [`global_guard`](Self::global_guard) in `main`, or call
    /// [`shutdown`](Self::shutdown), to stop the thread and fail outstanding
    /// transfers. Once shut down the global reactor stays shut down; later
    /// submissions fail with `TransferError::ShuttingDown`.
    pub fn global() -> TransferResult<&'static Reactor> {
        if let Some(reactor) = GLOBAL.get() {
            return Ok(reactor);
        }
        let _init = GLOBAL_INIT.lock();
        if let Some(reactor) = GLOBAL.get() {
            return Ok(reactor);
        }

        let config = TransferConfig::load_default().unwrap_or_else(|e| {
            warn!(error = %e, "using default transfer configuration");
            TransferConfig::default()
        });
        let reactor = Reactor::start(HttpEngine::new(config))?;
        Ok(GLOBAL.get_or_init(|| reactor))
    }

    /// Starts the global reactor if needed and returns a guard that shuts it
    /// down when dropped.
    pub fn global_guard() -> TransferResult<GlobalReactorGuard> {
        Reactor::global().map(|reactor| GlobalReactorGuard { reactor })
    }

    /// Returns a cloneable handle to this reactor.
    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Registers `request` with the engine and wakes the reactor thread.
    ///
    /// # Errors
    ///
    /// - `TransferError::AlreadyActive` - The request is still in flight
    /// - `TransferError::AlreadyFinished` - The request needs a `reset` first
    pub fn submit(&self, request: &Arc<TransferRequest>) -> TransferResult<()> {
        self.handle.submit(request)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.handle.stats()
    }

    pub fn active_count(&self) -> usize {
        self.handle.active_count()
    }

    /// True until `shutdown` has been called.
    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Stops the reactor thread and fails every transfer still in flight.
    ///
    /// Idempotent. When called from the reactor thread itself (inside a
    /// callback) the thread is not joined; it exits after the callback returns.
    pub fn shutdown(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        let shared = &self.handle.shared;
        info!("shutting down reactor");

        shared.shutdown.store(true, Ordering::Release);
        shared.notifier.signal();
        if thread.thread().id() != thread::current().id() && thread.join().is_err() {
            warn!("reactor thread panicked");
        }

        shared.abandon_all();
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Shuts the global reactor down on drop. See [`Reactor::global_guard`].
#[must_use = "the global reactor is shut down when the guard is dropped"]
pub struct GlobalReactorGuard {
    reactor: &'static Reactor,
}

impl GlobalReactorGuard {
    pub fn reactor(&self) -> &'static Reactor {
        self.reactor
    }
}

impl Drop for GlobalReactorGuard {
    fn drop(&mut self) {
        self.reactor.shutdown();
    }
}

impl ReactorHandle {
    /// See [`Reactor::submit`].
    pub fn submit(&self, request: &Arc<TransferRequest>) -> TransferResult<()> {
        self.shared.submit(request)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Number of transfers currently registered.
    pub fn active_count(&self) -> usize {
        self.shared.core.lock().active.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}
