//! Counters for cache and poller activity.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Monotonic counters shared by the handler, the poller and the sweeper.
///
/// All counters use relaxed ordering; they are for observation, not
/// synchronization.
#[derive(Debug, Default)]
pub struct SpongeStats {
    /// Requests answered straight from the entry store.
    pub hits: AtomicU64,
    /// Requests that found their key cold.
    pub misses: AtomicU64,
    /// Cold fetches issued to the backend (one per single-flight group).
    pub backend_fetches: AtomicU64,
    /// Cold fetches that failed.
    pub fetch_errors: AtomicU64,
    /// Poll sessions spawned.
    pub polls_started: AtomicU64,
    /// Poll attempts issued to the backend.
    pub poll_attempts: AtomicU64,
    /// Poll attempts that failed.
    pub poll_errors: AtomicU64,
    /// Poll sessions that ended by observing a change.
    pub poll_changes: AtomicU64,
    /// Entries removed by the expiry sweep.
    pub evictions: AtomicU64,
}

impl SpongeStats {
    /// Creates a zeroed set of counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Returns the current value of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            backend_fetches: self.backend_fetches.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            polls_started: self.polls_started.load(Ordering::Relaxed),
            poll_attempts: self.poll_attempts.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
            poll_changes: self.poll_changes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SpongeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub backend_fetches: u64,
    pub fetch_errors: u64,
    pub polls_started: u64,
    pub poll_attempts: u64,
    pub poll_errors: u64,
    pub poll_changes: u64,
    pub evictions: u64,
}

impl StatsSnapshot {
    /// Total number of backend calls, cold and poll.
    pub fn total_backend_calls(&self) -> u64 {
        self.backend_fetches + self.poll_attempts
    }
}
