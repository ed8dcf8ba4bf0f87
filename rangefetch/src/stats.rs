//! Reactor counters.
//!
//! Lock-free atomic counters updated from the reactor thread and from
//! callers of `submit`/`abort`, read through point-in-time snapshots.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for one reactor.
#[derive(Debug, Default)]
pub struct ReactorStats {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    aborted: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl ReactorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn transfer_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn transfer_finished(&self, success: bool) {
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn transfer_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bytes_received(&self, bytes: usize) {
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn bytes_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Takes a point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ReactorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Requests handed to the engine.
    pub submitted: u64,
    /// Completions reported as successful.
    pub succeeded: u64,
    /// Completions reported as failed, including rejected submissions.
    pub failed: u64,
    /// Requests cancelled with `abort()` while active.
    pub aborted: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

impl StatsSnapshot {
    /// Requests that have reached a terminal state.
    pub fn finished(&self) -> u64 {
        self.succeeded + self.failed + self.aborted
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} submitted, {} ok, {} failed, {} aborted, {} bytes in, {} bytes out",
            self.submitted,
            self.succeeded,
            self.failed,
            self.aborted,
            self.bytes_received,
            self.bytes_sent
        )
    }
}
