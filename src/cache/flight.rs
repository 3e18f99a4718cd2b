//! Per-key single-flight.
//!
//! Concurrent callers for the same cold key share one [`OnceCell`]: whichever
//! caller initializes it performs the backend fetch, everyone else awaits the
//! same cell and clones its value. Callers for different keys touch different
//! map shards and different cells, so they never wait on each other.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::OnceCell;

use super::CacheKey;
use crate::http::Response;

/// What every participant in one cold fetch receives: the installed result,
/// or the single error response built for the failed fetch.
pub type FlightOutcome<R> = Result<Arc<R>, Response>;

/// Result of [`SingleFlight::join`].
#[derive(Debug)]
pub enum Join<T> {
    /// The value was already available; no call is needed.
    Ready(T),
    /// A call for the key is (or is about to be) in flight; initialize or
    /// await this cell.
    Call(Arc<OnceCell<T>>),
}

/// In-flight markers, one per key with an outstanding call.
#[derive(Debug)]
pub struct SingleFlight<T> {
    calls: DashMap<CacheKey, Arc<OnceCell<T>>>,
}

impl<T> SingleFlight<T> {
    /// Creates an empty marker map.
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }

    /// Joins the call in flight for `key`, or opens a new one.
    ///
    /// When no call is in flight, `settled` is consulted while the key's
    /// marker slot is still locked; if it yields a value the caller gets
    /// [`Join::Ready`] and no marker is created. This closes the window
    /// between a caller's cache miss and a concurrent call that finished and
    /// removed its marker after installing its result.
    pub fn join(&self, key: &CacheKey, settled: impl FnOnce() -> Option<T>) -> Join<T> {
        match self.calls.entry(key.clone()) {
            Entry::Occupied(occupied) => Join::Call(Arc::clone(occupied.get())),
            Entry::Vacant(vacant) => match settled() {
                Some(value) => Join::Ready(value),
                None => {
                    let cell = Arc::new(OnceCell::new());
                    vacant.insert(Arc::clone(&cell));
                    Join::Call(cell)
                }
            },
        }
    }

    /// Removes the marker for `key` if it is still `cell`. Every participant
    /// may call this; only the first removal has an effect.
    pub fn finish(&self, key: &str, cell: &Arc<OnceCell<T>>) {
        self.calls
            .remove_if(key, |_, current| Arc::ptr_eq(current, cell));
    }

    /// Returns `true` if a call is in flight for `key`.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.calls.contains_key(key)
    }

    /// Number of keys with a call in flight.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Returns `true` if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}
