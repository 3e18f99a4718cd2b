//! # sponge
//!
//! A request-scoped cache-and-poll layer for slow, state-bearing backends.
//!
//! Requests are keyed by the application. The first request for a key runs
//! one backend fetch on behalf of every concurrent caller; the result is
//! cached and served to later requests, while a bounded background poller
//! keeps re-fetching until the backend state changes. Entries that outlive
//! their polling window are swept out, so the next request fetches afresh.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use sponge::{Backend, CacheKey, CachedResult, Request, Response, StatusCode};
//! use sponge::{Server, SpongeConfig, SpongeHandler, WriteError};
//!
//! struct Clock(u64);
//!
//! impl CachedResult for Clock {
//!     fn write_to(&self, response: Response) -> Result<Response, WriteError> {
//!         Ok(response.body(self.0.to_string()))
//!     }
//!     fn same_as(&self, other: &Self) -> bool {
//!         self.0 == other.0
//!     }
//! }
//!
//! struct Upstream;
//!
//! impl Backend for Upstream {
//!     type Output = Clock;
//!     type Error = std::io::Error;
//!
//!     fn cache_key(&self, request: &Request) -> CacheKey {
//!         CacheKey::from(request.target())
//!     }
//!
//!     async fn fetch(&self, _request: &Request) -> Result<Clock, std::io::Error> {
//!         Ok(Clock(42))
//!     }
//!
//!     fn handle_error(&self, error: &std::io::Error) -> Response {
//!         Response::new(StatusCode::BadGateway).body(error.to_string())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let handler = Arc::new(SpongeHandler::new(Upstream, SpongeConfig::from_env()?)?);
//!     let server = Server::bind("127.0.0.1:8081").await?;
//!     server.serve(handler).await?;
//!     Ok(())
//! }
//! ```

// ── Engine ────────────────────────────────────────────────────────────────────
pub mod cache;
pub mod handler;
pub mod proxy;

// ── Settings ──────────────────────────────────────────────────────────────────
pub mod config;

// ── HTTP surface ──────────────────────────────────────────────────────────────
pub mod http;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheKey, EntryStore, StatsSnapshot};
pub use config::{ConfigError, PollErrorPolicy, SpongeConfig};
pub use handler::SpongeHandler;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use proxy::{Backend, CachedResult, WriteError};
pub use server::{Server, ServerError};
