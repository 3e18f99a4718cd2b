//! Expiry sweep, the standing background task that evicts stale entries.
//!
//! An entry expires once its age reaches
//! `extra_expiration + poll_interval × poll_attempts`, i.e. the longest a poll
//! session could have kept it fresh, plus a grace period. Eviction removes the
//! entry outright, so the next request for its key is a cold miss and restarts
//! the fetch-then-poll cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info};

use super::session::SessionId;
use super::{CacheKey, EntryStore, SpongeStats};

/// Derived expiration rule for cache entries.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use sponge::cache::ExpiryPolicy;
///
/// let policy = ExpiryPolicy::new(Duration::from_secs(1), 3, Duration::from_secs(2));
/// assert_eq!(policy.threshold(), Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    threshold: Duration,
}

impl ExpiryPolicy {
    /// Builds the policy from the poll cadence and the extra grace period.
    pub fn new(poll_interval: Duration, poll_attempts: u32, extra_expiration: Duration) -> Self {
        let poll_window = poll_interval.saturating_mul(poll_attempts);
        Self {
            threshold: extra_expiration.saturating_add(poll_window),
        }
    }

    /// Age at which an entry is evicted.
    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Returns `true` if an entry stamped `last_updated` has expired at `now`.
    ///
    /// An entry whose age equals the threshold counts as expired.
    pub fn is_expired(&self, last_updated: Instant, now: Instant) -> bool {
        now.saturating_duration_since(last_updated) >= self.threshold
    }
}

/// A key removed by [`evict`], with the poll session that was attached to
/// the removed entry at the moment of removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evicted {
    pub key: CacheKey,
    pub session: Option<SessionId>,
}

/// Deletes every entry expired at `now`.
///
/// Each key's session id is read while its shard is still locked, so it
/// names the session of the removed entry, never one started afterwards.
pub fn evict<R>(store: &EntryStore<R>, policy: &ExpiryPolicy, now: Instant) -> Vec<Evicted> {
    let sessions = store.sessions();
    let mut evicted = Vec::new();
    store.remove_where(|key, entry| {
        if !policy.is_expired(entry.last_updated(), now) {
            return false;
        }
        evicted.push(Evicted {
            key: key.clone(),
            session: sessions.session_of(key.as_str()),
        });
        true
    });
    evicted
}

/// Aborts the sessions recorded by [`evict`]. A session registered for the
/// same key after the eviction belongs to a fresh entry and keeps running.
pub fn cancel_evicted<R>(store: &EntryStore<R>, evicted: &[Evicted]) {
    for Evicted { key, session } in evicted {
        let Some(id) = *session else { continue };
        if store.sessions().cancel_if(key.as_str(), id) {
            debug!(key = %key, id, "cancelled poll session of evicted entry");
        }
    }
}

/// Runs one sweep at `now`: deletes expired entries and cancels the poll
/// sessions still attached to them. Returns the evicted keys.
pub fn sweep<R>(store: &EntryStore<R>, policy: &ExpiryPolicy, now: Instant) -> Vec<CacheKey> {
    let evicted = evict(store, policy, now);
    cancel_evicted(store, &evicted);
    evicted.into_iter().map(|e| e.key).collect()
}

/// Sweeps `store` every `every` until `shutdown` flips to `true` or its
/// sender is dropped.
pub(crate) async fn run<R>(
    store: EntryStore<R>,
    policy: ExpiryPolicy,
    every: Duration,
    stats: Arc<SpongeStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        sweep_interval_ms = every.as_millis() as u64,
        threshold_ms = policy.threshold().as_millis() as u64,
        "expiry sweeper started"
    );

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let evicted = sweep(&store, &policy, Instant::now());
                if !evicted.is_empty() {
                    SpongeStats::add(&stats.evictions, evicted.len() as u64);
                    debug!(count = evicted.len(), "evicted expired entries");
                }
            }
        }
    }

    info!("expiry sweeper stopped");
}
