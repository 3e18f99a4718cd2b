//! Cache-and-poll engine: entry store, expiry sweep, change polling and
//! per-key single-flight.
//!
//! The pieces compose leaves-first:
//!
//! - [`EntryStore`]: the authoritative `key → entry` map, plus the per-key
//!   coordination state every handle to it shares.
//! - [`ExpiryPolicy`] and the sweep task evict entries that outlived their
//!   poll budget.
//! - [`PollRegistry`] and the change poller keep at most one background poll
//!   session per key.
//! - [`SingleFlight`] collapses concurrent cold fetches for one key.
//! - [`SpongeStats`] holds counters shared by all of the above.
//!
//! [`SpongeHandler`](crate::handler::SpongeHandler) wires them together.

use std::borrow::Borrow;
use std::fmt;

pub mod flight;
pub mod poller;
pub mod session;
pub mod stats;
pub mod store;
pub mod sweeper;

pub use flight::{FlightOutcome, Join, SingleFlight};
pub use poller::{PollOutcome, Poller};
pub use session::{OwnerId, PollRegistry, SessionId};
pub use stats::{SpongeStats, StatsSnapshot};
pub use store::{CacheEntry, EntryStore};
pub use sweeper::{Evicted, ExpiryPolicy};

/// Opaque identifier for one logical resource, derived from a request by
/// [`Backend::cache_key`](crate::proxy::Backend::cache_key).
///
/// # Examples
///
/// ```
/// use sponge::cache::CacheKey;
///
/// let key = CacheKey::from("/status");
/// assert_eq!(key.as_str(), "/status");
/// assert_eq!(key.to_string(), "/status");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Creates a key from anything string-like.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.to_owned())
    }
}

// Lets the maps be queried with a plain `&str`. `String` and `str` hash
// identically, so the derived `Hash` stays consistent with this impl.
impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
