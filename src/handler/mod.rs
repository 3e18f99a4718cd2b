//! The request entry point and fetch coordinator.
//!
//! [`SpongeHandler`] answers each request from the entry store when it can.
//! On a cold miss exactly one caller per key runs the backend fetch while the
//! rest wait on the same single-flight cell; a successful fetch is installed
//! and handed to the change poller, a failed one is turned into an error
//! response once and shared by every waiter.
//!
//! ```rust,no_run
//! use sponge::cache::CacheKey;
//! use sponge::config::SpongeConfig;
//! use sponge::handler::SpongeHandler;
//! use sponge::http::{Request, Response, StatusCode};
//! use sponge::proxy::{Backend, CachedResult, WriteError};
//!
//! struct Greeting(String);
//!
//! impl CachedResult for Greeting {
//!     fn write_to(&self, response: Response) -> Result<Response, WriteError> {
//!         Ok(response.body(self.0.clone()))
//!     }
//!     fn same_as(&self, other: &Self) -> bool {
//!         self.0 == other.0
//!     }
//! }
//!
//! struct Upstream;
//!
//! impl Backend for Upstream {
//!     type Output = Greeting;
//!     type Error = std::io::Error;
//!
//!     fn cache_key(&self, request: &Request) -> CacheKey {
//!         CacheKey::from(request.path())
//!     }
//!
//!     async fn fetch(&self, _request: &Request) -> Result<Greeting, std::io::Error> {
//!         Ok(Greeting("hello".into()))
//!     }
//!
//!     fn handle_error(&self, error: &std::io::Error) -> Response {
//!         Response::new(StatusCode::BadGateway).body(error.to_string())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let handler = SpongeHandler::new(Upstream, SpongeConfig::default())?;
//!     let raw = b"GET /hello HTTP/1.1\r\n\r\n";
//!     let (request, _) = Request::parse(raw)?;
//!     let response = handler.serve(request).await;
//!     assert_eq!(response.status(), StatusCode::Ok);
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cache::{
    CacheKey, EntryStore, FlightOutcome, Join, OwnerId, Poller, SpongeStats, StatsSnapshot,
    sweeper,
};
use crate::config::{ConfigError, SpongeConfig};
use crate::http::{Request, Response, StatusCode};
use crate::proxy::{Backend, CachedResult};

/// Caching, state-aware proxy handler for one [`Backend`].
///
/// Construction spawns the expiry sweeper, so it must happen inside a Tokio
/// runtime. The sweeper and every poll session this handler started stop
/// when the handler is shut down or dropped.
pub struct SpongeHandler<B: Backend> {
    backend: Arc<B>,
    store: EntryStore<B::Output>,
    poller: Poller<B>,
    owner: OwnerId,
    stats: Arc<SpongeStats>,
    config: SpongeConfig,
    shutdown: watch::Sender<bool>,
}

impl<B: Backend> SpongeHandler<B> {
    /// Creates a handler with an empty cache.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails validation.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(backend: B, config: SpongeConfig) -> Result<Self, ConfigError> {
        Self::with_store(backend, config, EntryStore::new())
    }

    /// Creates a handler over an existing store: one pre-populated for a warm
    /// start, or a clone of another handler's store to share one cache.
    ///
    /// Entries already in `store` are served as hits and expire on the normal
    /// schedule; no poll session is started for them. Handlers sharing a
    /// store also share its in-flight fetches and poll sessions: a cold key
    /// is fetched, and then polled, by whichever handler reaches it first.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails validation.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn with_store(
        backend: B,
        config: SpongeConfig,
        store: EntryStore<B::Output>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let backend = Arc::new(backend);
        let owner = store.sessions().next_id();
        let stats = Arc::new(SpongeStats::new());
        let poller = Poller::new(
            Arc::clone(&backend),
            store.clone(),
            Arc::clone(&stats),
            config.poll_interval,
            config.poll_attempts,
            config.poll_error_policy,
            owner,
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(sweeper::run(
            store.clone(),
            config.expiry_policy(),
            config.sweep_interval,
            Arc::clone(&stats),
            shutdown_rx,
        ));

        info!(
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            poll_attempts = config.poll_attempts,
            warm_entries = store.len(),
            "sponge handler ready"
        );

        Ok(Self {
            backend,
            store,
            poller,
            owner,
            stats,
            config,
            shutdown,
        })
    }

    /// Answers `request`: the cached result on a hit, otherwise the outcome
    /// of the single-flight cold fetch.
    ///
    /// A result that fails to write itself yields `500 Internal Server Error`.
    pub async fn serve(&self, request: Request) -> Response {
        match self.resolve(&request).await {
            Ok(result) => match result.write_to(Response::new(StatusCode::Ok)) {
                Ok(response) => response,
                Err(e) => {
                    error!(path = %request.path(), error = %e, "failed to write cached result");
                    Response::new(StatusCode::InternalServerError).body("Internal Server Error")
                }
            },
            Err(response) => response,
        }
    }

    /// Returns the result for `request`, fetching it from the backend if the
    /// key is cold.
    ///
    /// # Errors
    ///
    /// On a failed cold fetch, returns the response built by
    /// [`Backend::handle_error`]. Every caller that waited on the same fetch
    /// receives a clone of that one response.
    pub async fn resolve(&self, request: &Request) -> Result<Arc<B::Output>, Response> {
        let key = self.backend.cache_key(request);

        if let Some(entry) = self.store.get(key.as_str()) {
            SpongeStats::incr(&self.stats.hits);
            debug!(key = %key, "cache hit");
            return Ok(entry.into_result());
        }

        // Re-check the store under the key's marker slot: a fetch may have
        // installed its result and retired its marker since the lookup above.
        let flights = self.store.flights();
        let cell = match flights.join(&key, || {
            self.store
                .get(key.as_str())
                .map(|entry| Ok(entry.into_result()))
        }) {
            Join::Ready(outcome) => {
                SpongeStats::incr(&self.stats.hits);
                return outcome;
            }
            Join::Call(cell) => cell,
        };

        SpongeStats::incr(&self.stats.misses);
        let outcome = cell
            .get_or_init(|| self.cold_fetch(&key, request))
            .await
            .clone();
        flights.finish(key.as_str(), &cell);
        outcome
    }

    // Runs once per single-flight group.
    async fn cold_fetch(&self, key: &CacheKey, request: &Request) -> FlightOutcome<B::Output> {
        SpongeStats::incr(&self.stats.backend_fetches);
        info!(key = %key, "cold miss, fetching from backend");

        match self.backend.fetch(request).await {
            Ok(result) => {
                let result = Arc::new(result);
                self.store.put_shared(key.clone(), Arc::clone(&result));
                self.poller.start(key.clone(), request.clone());
                Ok(result)
            }
            Err(e) => {
                SpongeStats::incr(&self.stats.fetch_errors);
                warn!(key = %key, error = %e, "backend fetch failed");
                Err(self.backend.handle_error(&e))
            }
        }
    }

    /// Installs `result` for `request`'s key with a fresh timestamp.
    ///
    /// Does not start a poll session; a session already running for the key
    /// keeps comparing against whatever is cached when it next wakes.
    pub fn set_cache(&self, request: &Request, result: B::Output) {
        let key = self.backend.cache_key(request);
        debug!(key = %key, "cache set manually");
        self.store.put(key, result);
    }

    /// The handler's entry store. Clone it to share the cache with another
    /// handler.
    pub fn store(&self) -> &EntryStore<B::Output> {
        &self.store
    }

    /// The backend this handler fetches through.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The validated configuration the handler was built with.
    pub fn config(&self) -> &SpongeConfig {
        &self.config
    }

    /// Returns a snapshot of the activity counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns `true` if a poll session is running for `key`, whichever
    /// handler sharing the store started it.
    pub fn is_polling(&self, key: &str) -> bool {
        self.store.sessions().is_polling(key)
    }

    /// Number of poll sessions running against the store.
    pub fn active_polls(&self) -> usize {
        self.store.sessions().active()
    }

    /// Stops the expiry sweeper and aborts the poll sessions this handler
    /// started. Cached entries, and sessions started by other handlers on a
    /// shared store, are left alone. Idempotent.
    pub fn shutdown(&self) {
        // Err only means the sweeper already stopped.
        let _ = self.shutdown.send(true);
        self.store.sessions().cancel_owned_by(self.owner);
    }
}

impl<B: Backend> Drop for SpongeHandler<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
