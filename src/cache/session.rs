//! Registry of running poll sessions, at most one per key.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::CacheKey;

/// Identifies one spawned session so a finishing task only deregisters itself.
pub type SessionId = u64;

/// Identifies the handler that spawned a session.
pub type OwnerId = u64;

#[derive(Debug)]
struct PollSession {
    id: SessionId,
    owner: OwnerId,
    handle: AbortHandle,
}

/// Tracks the background poll task for each key.
#[derive(Debug, Default)]
pub struct PollRegistry {
    sessions: DashMap<CacheKey, PollSession>,
    next_id: AtomicU64,
}

impl PollRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves an id for a session about to be spawned, or for a handler
    /// about to start spawning them.
    pub(crate) fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Records `handle` as the session for `key`.
    ///
    /// A still-running session for the same key is aborted first, so the
    /// registry never tracks two live pollers for one key.
    pub(crate) fn register(
        &self,
        key: CacheKey,
        id: SessionId,
        owner: OwnerId,
        handle: AbortHandle,
    ) {
        let session = PollSession { id, owner, handle };
        match self.sessions.entry(key) {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(session);
                if !previous.handle.is_finished() {
                    warn!(key = %occupied.key(), "replacing a running poll session");
                    previous.handle.abort();
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(session);
            }
        }
    }

    /// Deregisters session `id` for `key`. A newer session under the same key
    /// is left alone.
    pub(crate) fn finish(&self, key: &str, id: SessionId) {
        self.sessions.remove_if(key, |_, session| session.id == id);
    }

    /// Returns the id of the session registered for `key`, finished or not.
    pub fn session_of(&self, key: &str) -> Option<SessionId> {
        self.sessions.get(key).map(|session| session.id)
    }

    /// Aborts session `id` for `key` if it is still the registered one.
    /// Returns `true` if a live session was cancelled; a session registered
    /// since is left running.
    pub fn cancel_if(&self, key: &str, id: SessionId) -> bool {
        match self.sessions.remove_if(key, |_, session| session.id == id) {
            Some((_, session)) if !session.handle.is_finished() => {
                session.handle.abort();
                debug!(key, id = session.id, "poll session cancelled");
                true
            }
            _ => false,
        }
    }

    /// Aborts every session spawned by `owner`.
    pub fn cancel_owned_by(&self, owner: OwnerId) {
        self.sessions.retain(|_, session| {
            if session.owner != owner {
                return true;
            }
            session.handle.abort();
            false
        });
    }

    /// Returns `true` if a poll session is live for `key`.
    pub fn is_polling(&self, key: &str) -> bool {
        self.sessions
            .get(key)
            .is_some_and(|session| !session.handle.is_finished())
    }

    /// Returns the number of live poll sessions.
    pub fn active(&self) -> usize {
        self.sessions
            .iter()
            .filter(|session| !session.handle.is_finished())
            .count()
    }
}
