//! Capability contracts supplied by the embedding application.
//!
//! sponge never talks to a backend or encodes a payload itself. The
//! application implements:
//!
//! - [`Backend`] derives cache keys, performs backend fetches, and turns
//!   fetch errors into responses.
//! - [`CachedResult`] is the cached value. It writes itself onto a response and
//!   decides whether two results represent the same backend state.

use std::future::Future;

use thiserror::Error;

use crate::cache::CacheKey;
use crate::http::{Request, Response};

/// Errors raised while writing a cached result onto a response.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("failed to serialize result: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// A value cached on behalf of a backend.
///
/// # Examples
///
/// ```
/// use serde::Serialize;
/// use sponge::http::{Response, StatusCode};
/// use sponge::proxy::{CachedResult, WriteError};
///
/// #[derive(Serialize)]
/// struct Flag {
///     result: bool,
/// }
///
/// impl CachedResult for Flag {
///     fn write_to(&self, response: Response) -> Result<Response, WriteError> {
///         Ok(response.json(serde_json::to_vec(self)?))
///     }
///
///     fn same_as(&self, other: &Self) -> bool {
///         self.result == other.result
///     }
/// }
///
/// let response = Flag { result: true }.write_to(Response::new(StatusCode::Ok)).unwrap();
/// assert_eq!(response.body_ref(), br#"{"result":true}"#);
/// ```
pub trait CachedResult: Send + Sync + 'static {
    /// Writes this result onto `response`, returning the finished response.
    fn write_to(&self, response: Response) -> Result<Response, WriteError>;

    /// Returns `true` if `other` represents the same backend state.
    ///
    /// The change poller stops and updates the cache the first time this
    /// returns `false`, so implementations decide what counts as a change
    /// (ignoring timestamps or request ids, for instance).
    fn same_as(&self, other: &Self) -> bool;
}

/// The backend behind the cache.
pub trait Backend: Send + Sync + 'static {
    /// The value fetched from the backend and cached.
    type Output: CachedResult;

    /// Error produced by a failed fetch.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Derives the cache key for `request`. Must be deterministic: equivalent
    /// requests map to the same key.
    fn cache_key(&self, request: &Request) -> CacheKey;

    /// Performs one backend fetch on behalf of `request`.
    ///
    /// Called for cold misses and for every poll attempt. The request passed
    /// to poll attempts is a copy of the one that triggered the cold fetch.
    fn fetch(
        &self,
        request: &Request,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> + Send;

    /// Turns a failed cold fetch into the response sent to every request that
    /// was waiting on it. Called exactly once per failed fetch.
    fn handle_error(&self, error: &Self::Error) -> Response;
}
