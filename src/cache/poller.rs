//! Change poller: bounded background re-fetching after a cold fetch.
//!
//! A session runs as its own Tokio task, detached from the request that
//! triggered it. It wakes every `poll_interval`, re-fetches the backend, and
//! compares the fresh result with the cached one via
//! [`CachedResult::same_as`]. The first difference is installed into the
//! store and ends the session; otherwise the session ends quietly after
//! `poll_attempts` attempts. The only channel back to the rest of the system
//! is the entry store.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, trace, warn};

use super::session::{OwnerId, SessionId};
use super::{CacheKey, EntryStore, SpongeStats};
use crate::config::PollErrorPolicy;
use crate::http::Request;
use crate::proxy::{Backend, CachedResult};

/// How a poll session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Attempt `attempt` (1-based) observed a change, which was installed.
    Changed { attempt: u32 },
    /// Every attempt matched the cached result.
    Exhausted,
    /// The entry vanished from the store mid-session.
    Evicted,
    /// Attempt `attempt` failed under [`PollErrorPolicy::Abort`].
    Aborted { attempt: u32 },
}

/// Spawns poll sessions for one backend.
///
/// Sessions are registered in the store's [`PollRegistry`](super::PollRegistry)
/// under `owner`, so the handler that owns this poller can stop its own
/// sessions without touching those of other handlers sharing the store.
pub struct Poller<B: Backend> {
    backend: Arc<B>,
    store: EntryStore<B::Output>,
    stats: Arc<SpongeStats>,
    interval: Duration,
    attempts: u32,
    on_error: PollErrorPolicy,
    owner: OwnerId,
}

impl<B: Backend> Poller<B> {
    /// Creates a poller. `interval` must be non-zero.
    pub fn new(
        backend: Arc<B>,
        store: EntryStore<B::Output>,
        stats: Arc<SpongeStats>,
        interval: Duration,
        attempts: u32,
        on_error: PollErrorPolicy,
        owner: OwnerId,
    ) -> Self {
        Self {
            backend,
            store,
            stats,
            interval,
            attempts,
            on_error,
            owner,
        }
    }

    /// Starts a poll session for `key`, re-fetching with `request`.
    ///
    /// Returns `false` (and spawns nothing) when the attempt budget is zero.
    pub fn start(&self, key: CacheKey, request: Request) -> bool {
        if self.attempts == 0 {
            return false;
        }

        let sessions = self.store.sessions();
        let id = sessions.next_id();
        let session = Session {
            id,
            key: key.clone(),
            request,
            backend: Arc::clone(&self.backend),
            store: self.store.clone(),
            stats: Arc::clone(&self.stats),
            interval: self.interval,
            attempts: self.attempts,
            on_error: self.on_error,
        };

        let task = tokio::spawn(session.run());
        sessions.register(key, id, self.owner, task.abort_handle());
        SpongeStats::incr(&self.stats.polls_started);
        true
    }
}

impl<B: Backend> Clone for Poller<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            store: self.store.clone(),
            stats: Arc::clone(&self.stats),
            interval: self.interval,
            attempts: self.attempts,
            on_error: self.on_error,
            owner: self.owner,
        }
    }
}

// Everything one session task owns.
struct Session<B: Backend> {
    id: SessionId,
    key: CacheKey,
    request: Request,
    backend: Arc<B>,
    store: EntryStore<B::Output>,
    stats: Arc<SpongeStats>,
    interval: Duration,
    attempts: u32,
    on_error: PollErrorPolicy,
}

impl<B: Backend> Session<B> {
    async fn run(self) -> PollOutcome {
        debug!(key = %self.key, attempts = self.attempts, "poll session started");

        let outcome = self.poll().await;
        self.store.sessions().finish(self.key.as_str(), self.id);

        info!(key = %self.key, outcome = ?outcome, "poll session ended");
        outcome
    }

    async fn poll(&self) -> PollOutcome {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for attempt in 1..=self.attempts {
            ticker.tick().await;
            SpongeStats::incr(&self.stats.poll_attempts);

            let fresh = match self.backend.fetch(&self.request).await {
                Ok(fresh) => fresh,
                Err(e) => {
                    SpongeStats::incr(&self.stats.poll_errors);
                    warn!(key = %self.key, attempt, error = %e, "poll attempt failed");
                    match self.on_error {
                        PollErrorPolicy::Skip => continue,
                        PollErrorPolicy::Abort => return PollOutcome::Aborted { attempt },
                    }
                }
            };

            let Some(current) = self.store.get(self.key.as_str()) else {
                return PollOutcome::Evicted;
            };

            if current.result().same_as(&fresh) {
                trace!(key = %self.key, attempt, "backend unchanged");
                continue;
            }

            if !self.store.replace(self.key.as_str(), Arc::new(fresh)) {
                return PollOutcome::Evicted;
            }
            SpongeStats::incr(&self.stats.poll_changes);
            return PollOutcome::Changed { attempt };
        }

        PollOutcome::Exhausted
    }
}
