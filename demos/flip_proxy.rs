//! Caches a slow upstream whose single boolean flips every few seconds.
//!
//! ```text
//! RUST_LOG=sponge=debug cargo run --example flip_proxy
//! curl http://127.0.0.1:8081/state
//! ```
//!
//! The first request pays the upstream latency; later ones are served from
//! the cache while the poller watches for the next flip.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sponge::{
    Backend, CacheKey, CachedResult, Request, Response, Server, SpongeConfig, SpongeHandler,
    StatusCode, WriteError,
};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const UPSTREAM_LATENCY: Duration = Duration::from_millis(300);
const FLIP_EVERY: Duration = Duration::from_secs(4);

#[derive(Debug, Serialize, Deserialize)]
struct Flag {
    result: bool,
}

impl CachedResult for Flag {
    fn write_to(&self, response: Response) -> Result<Response, WriteError> {
        Ok(response.json(serde_json::to_vec(self)?))
    }

    fn same_as(&self, other: &Self) -> bool {
        self.result == other.result
    }
}

/// Stand-in for a remote service: answers with JSON after some latency.
struct Upstream {
    state: Arc<AtomicBool>,
}

impl Upstream {
    async fn body(&self) -> Vec<u8> {
        tokio::time::sleep(UPSTREAM_LATENCY).await;
        format!(r#"{{"result":{}}}"#, self.state.load(Ordering::Relaxed)).into_bytes()
    }
}

impl Backend for Upstream {
    type Output = Flag;
    type Error = serde_json::Error;

    fn cache_key(&self, request: &Request) -> CacheKey {
        CacheKey::from(request.path())
    }

    async fn fetch(&self, _request: &Request) -> Result<Flag, serde_json::Error> {
        let body = self.body().await;
        serde_json::from_slice(&body)
    }

    fn handle_error(&self, error: &serde_json::Error) -> Response {
        tracing::error!(error = %error, "upstream sent an unreadable body");
        Response::new(StatusCode::InternalServerError)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sponge=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = Arc::new(AtomicBool::new(false));
    let flipper = Arc::clone(&state);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FLIP_EVERY);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let now = !flipper.fetch_xor(true, Ordering::Relaxed);
            info!(result = now, "upstream flipped");
        }
    });

    let config = SpongeConfig::from_env()?;
    let handler = Arc::new(SpongeHandler::new(Upstream { state }, config)?);

    let server = Server::bind("127.0.0.1:8081").await?;
    info!(address = %server.local_addr(), "flip proxy ready");
    server
        .serve_with_shutdown(Arc::clone(&handler), async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let stats = handler.stats();
    info!(stats = %serde_json::to_string(&stats)?, "shutting down");
    Ok(())
}
