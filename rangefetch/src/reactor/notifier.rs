//! Cross-thread wakeup for the reactor's readiness wait.
//!
//! Any thread may [`signal`](Notifier::signal); the reactor thread blocks in
//! [`wait`](Notifier::wait). Signals are edge-triggered and collapse: however
//! many arrive while the reactor is busy, the next wait returns once and
//! clears the pending flag.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct NotifierInner {
    pending: Mutex<bool>,
    ready: Condvar,
}

/// Cloneable wakeup channel shared between the reactor and its producers.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a wakeup as pending. Idempotent.
    pub fn signal(&self) {
        let mut pending = self.inner.pending.lock();
        if !*pending {
            *pending = true;
            self.inner.ready.notify_one();
        }
    }

    /// Blocks until signalled or until `timeout` elapses (`None` waits
    /// forever), then consumes the pending wakeup.
    ///
    /// Returns true if a wakeup was consumed.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut pending = self.inner.pending.lock();
        if !*pending {
            match timeout {
                Some(timeout) => {
                    self.inner.ready.wait_for(&mut pending, timeout);
                }
                None => self.inner.ready.wait(&mut pending),
            }
        }
        std::mem::replace(&mut *pending, false)
    }

    /// True if a wakeup is waiting to be consumed.
    pub fn is_pending(&self) -> bool {
        *self.inner.pending.lock()
    }
}
