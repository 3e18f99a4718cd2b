//! The entry store: the authoritative `CacheKey → CacheEntry` mapping.
//!
//! Backed by a sharded [`DashMap`]: every operation locks a single shard for
//! the duration of the map mutation and nothing else. No guard ever escapes
//! this module, so callers cannot hold a lock across an `.await`.
//!
//! The store also owns the per-key coordination state (in-flight markers and
//! poll sessions), so every handle to one cache coordinates through the same
//! markers and the same registry.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::time::Instant;

use super::flight::{FlightOutcome, SingleFlight};
use super::{CacheKey, PollRegistry};

/// One cached result and the instant it was installed.
#[derive(Debug)]
pub struct CacheEntry<R> {
    result: Arc<R>,
    last_updated: Instant,
}

impl<R> CacheEntry<R> {
    fn new(result: Arc<R>) -> Self {
        Self {
            result,
            last_updated: Instant::now(),
        }
    }

    /// Returns the cached result.
    pub fn result(&self) -> &Arc<R> {
        &self.result
    }

    /// Returns when the result was installed (or last replaced).
    pub fn last_updated(&self) -> Instant {
        self.last_updated
    }

    /// Consumes the entry, returning the cached result.
    pub fn into_result(self) -> Arc<R> {
        self.result
    }
}

// Manual impl: `R` itself need not be `Clone`, only the `Arc` is cloned.
impl<R> Clone for CacheEntry<R> {
    fn clone(&self) -> Self {
        Self {
            result: Arc::clone(&self.result),
            last_updated: self.last_updated,
        }
    }
}

#[derive(Debug)]
struct Shared<R> {
    entries: DashMap<CacheKey, CacheEntry<R>>,
    flights: SingleFlight<FlightOutcome<R>>,
    sessions: PollRegistry,
}

/// Thread-safe map from [`CacheKey`] to [`CacheEntry`].
///
/// Cloning an `EntryStore` is cheap and yields a handle to the *same* cache,
/// which is how several handlers share one. Clones also share the in-flight
/// markers and the poll registry: a cold key is fetched once and polled by
/// one session no matter which handler sees it first.
///
/// # Examples
///
/// ```
/// use sponge::cache::EntryStore;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store: EntryStore<u32> = EntryStore::new();
/// store.put("/a", 7);
///
/// let entry = store.get("/a").unwrap();
/// assert_eq!(**entry.result(), 7);
/// assert!(store.get("/b").is_none());
/// # }
/// ```
#[derive(Debug)]
pub struct EntryStore<R> {
    shared: Arc<Shared<R>>,
}

impl<R> EntryStore<R> {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: DashMap::new(),
                flights: SingleFlight::new(),
                sessions: PollRegistry::new(),
            }),
        }
    }

    /// Creates a store pre-populated with `results`, all stamped with the
    /// current instant. Useful for warm starts.
    pub fn from_results<K, I>(results: I) -> Self
    where
        K: Into<CacheKey>,
        I: IntoIterator<Item = (K, R)>,
    {
        let store = Self::new();
        for (key, result) in results {
            store.put(key, result);
        }
        store
    }

    /// Returns a snapshot of the entry for `key`, or `None` if the key is cold.
    pub fn get(&self, key: &str) -> Option<CacheEntry<R>> {
        self.shared.entries.get(key).map(|entry| entry.clone())
    }

    /// Installs `result` under `key` with `last_updated = now`, replacing any
    /// previous entry.
    pub fn put(&self, key: impl Into<CacheKey>, result: R) {
        self.put_shared(key, Arc::new(result));
    }

    /// Like [`put`](Self::put), for a result that is already shared.
    pub fn put_shared(&self, key: impl Into<CacheKey>, result: Arc<R>) {
        self.shared.entries.insert(key.into(), CacheEntry::new(result));
    }

    /// Replaces the result of an *existing* entry and resets its timestamp.
    ///
    /// Returns `false` without inserting anything if `key` is absent, so a
    /// poller racing the sweeper cannot resurrect an evicted key.
    pub fn replace(&self, key: &str, result: Arc<R>) -> bool {
        match self.shared.entries.get_mut(key) {
            Some(mut entry) => {
                *entry = CacheEntry::new(result);
                true
            }
            None => false,
        }
    }

    /// Removes the entry for `key`, returning it if it was present.
    pub fn delete(&self, key: &str) -> Option<CacheEntry<R>> {
        self.shared.entries.remove(key).map(|(_, entry)| entry)
    }

    /// Removes every entry for which `expired` returns `true` and returns the
    /// removed keys.
    ///
    /// Shards are locked one at a time, so a sweep never stalls requests that
    /// hash to other shards. `expired` runs while the entry's shard is
    /// locked; no entry for that key can be installed until it returns.
    pub fn remove_where(
        &self,
        mut expired: impl FnMut(&CacheKey, &CacheEntry<R>) -> bool,
    ) -> Vec<CacheKey> {
        let mut removed = Vec::new();
        self.shared.entries.retain(|key, entry| {
            if expired(key, entry) {
                removed.push(key.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Returns `true` if `key` has an entry.
    pub fn contains(&self, key: &str) -> bool {
        self.shared.entries.contains_key(key)
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.shared.entries.len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.shared.entries.is_empty()
    }

    /// The poll sessions running against this cache.
    pub fn sessions(&self) -> &PollRegistry {
        &self.shared.sessions
    }

    pub(crate) fn flights(&self) -> &SingleFlight<FlightOutcome<R>> {
        &self.shared.flights
    }

    /// Returns the currently cached keys, in no particular order.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.shared.entries.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl<R> Clone for EntryStore<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R> Default for EntryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}
