//! End-to-end behaviour of `SpongeHandler` against a scripted backend, on
//! paused Tokio time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sponge::cache::CacheKey;
use sponge::cache::sweeper::{cancel_evicted, evict};
use sponge::http::{Method, Request, Response, StatusCode};
use sponge::proxy::{Backend, CachedResult, WriteError};
use sponge::{EntryStore, PollErrorPolicy, SpongeConfig, SpongeHandler};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, sleep_until, timeout};

#[derive(Debug, PartialEq)]
struct Snapshot(&'static str);

impl CachedResult for Snapshot {
    fn write_to(&self, response: Response) -> Result<Response, WriteError> {
        Ok(response.body(self.0))
    }

    fn same_as(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

#[derive(Debug, Error)]
#[error("upstream unavailable")]
struct Unavailable;

#[derive(Debug, Clone, Copy)]
enum Step {
    Value(&'static str),
    Fail,
}

// Answers fetches from a script shared by all keys; the last step repeats.
// `/slow` takes a minute on top of the configured delay.
struct Scripted {
    steps: Mutex<VecDeque<Step>>,
    delay: Duration,
    fetches: AtomicUsize,
    errors_handled: AtomicUsize,
}

impl Scripted {
    fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            delay: Duration::ZERO,
            fetches: AtomicUsize::new(0),
            errors_handled: AtomicUsize::new(0),
        }
    }

    fn values(values: &[&'static str]) -> Self {
        Self::new(values.iter().map(|&v| Step::Value(v)))
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn next_step(&self) -> Step {
        let mut steps = self.steps.lock().unwrap();
        if steps.len() > 1 {
            steps.pop_front().unwrap()
        } else {
            steps.front().copied().unwrap_or(Step::Fail)
        }
    }
}

impl Backend for Scripted {
    type Output = Snapshot;
    type Error = Unavailable;

    fn cache_key(&self, request: &Request) -> CacheKey {
        CacheKey::from(request.path())
    }

    async fn fetch(&self, request: &Request) -> Result<Snapshot, Unavailable> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let step = self.next_step();
        if request.path() == "/slow" {
            sleep(Duration::from_secs(60)).await;
        }
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        match step {
            Step::Value(value) => Ok(Snapshot(value)),
            Step::Fail => Err(Unavailable),
        }
    }

    fn handle_error(&self, _error: &Unavailable) -> Response {
        self.errors_handled.fetch_add(1, Ordering::SeqCst);
        Response::new(StatusCode::ServiceUnavailable).body("unavailable")
    }
}

fn get(path: &str) -> Request {
    Request::new(Method::Get, path)
}

fn config(attempts: u32) -> SpongeConfig {
    SpongeConfig {
        poll_interval: Duration::from_secs(1),
        poll_attempts: attempts,
        extra_expiration: Duration::ZERO,
        sweep_interval: Duration::from_secs(1),
        poll_error_policy: PollErrorPolicy::Skip,
    }
}

fn cached(handler: &SpongeHandler<Scripted>, key: &str) -> Option<&'static str> {
    handler.store().get(key).map(|entry| entry.result().0)
}

fn secs(start: Instant, secs: f64) -> Instant {
    start + Duration::from_secs_f64(secs)
}

#[tokio::test(start_paused = true)]
async fn concurrent_cold_requests_share_one_fetch() {
    let backend = Scripted::values(&["A"]).delayed(Duration::from_millis(200));
    let handler = Arc::new(SpongeHandler::new(backend, config(3)).unwrap());

    let mut requests = JoinSet::new();
    for _ in 0..16 {
        let handler = Arc::clone(&handler);
        requests.spawn(async move { handler.resolve(&get("/a")).await });
    }

    let mut results = Vec::new();
    while let Some(joined) = requests.join_next().await {
        results.push(joined.unwrap().unwrap());
    }

    assert_eq!(handler.backend().fetches.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    assert_eq!(results[0].0, "A");
    assert_eq!(handler.active_polls(), 1);

    let stats = handler.stats();
    assert_eq!(stats.backend_fetches, 1);
    assert_eq!(stats.misses + stats.hits, 16);
}

#[tokio::test(start_paused = true)]
async fn concurrent_waiters_on_failed_fetch_get_one_error() {
    let backend = Scripted::new([Step::Fail]).delayed(Duration::from_millis(200));
    let handler = Arc::new(SpongeHandler::new(backend, config(3)).unwrap());

    let mut requests = JoinSet::new();
    for _ in 0..8 {
        let handler = Arc::clone(&handler);
        requests.spawn(async move { handler.serve(get("/a")).await });
    }

    let mut responses = Vec::new();
    while let Some(joined) = requests.join_next().await {
        responses.push(joined.unwrap());
    }

    assert_eq!(handler.backend().fetches.load(Ordering::SeqCst), 1);
    assert_eq!(handler.backend().errors_handled.load(Ordering::SeqCst), 1);
    assert!(responses.iter().all(|r| r == &responses[0]));
    assert_eq!(responses[0].status(), StatusCode::ServiceUnavailable);
    assert!(handler.store().is_empty());
    assert_eq!(handler.active_polls(), 0);
}

#[tokio::test(start_paused = true)]
async fn warm_key_serves_without_fetching() {
    let handler = SpongeHandler::new(Scripted::values(&["A"]), config(3)).unwrap();

    handler.serve(get("/a")).await;
    for _ in 0..50 {
        let response = handler.serve(get("/a")).await;
        assert_eq!(response.body_ref(), b"A");
    }

    let stats = handler.stats();
    assert_eq!(stats.backend_fetches, 1);
    assert_eq!(stats.hits, 50);
    assert_eq!(stats.poll_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn poll_stops_at_first_change() {
    let start = Instant::now();
    let backend = Scripted::values(&["A", "A", "A", "B"]);
    let handler = SpongeHandler::new(backend, config(5)).unwrap();

    handler.serve(get("/a")).await;

    sleep_until(secs(start, 2.5)).await;
    assert_eq!(cached(&handler, "/a"), Some("A"));
    assert!(handler.is_polling("/a"));

    sleep_until(secs(start, 3.5)).await;
    let entry = handler.store().get("/a").unwrap();
    assert_eq!(entry.result().0, "B");
    assert_eq!(entry.last_updated(), secs(start, 3.0));
    assert!(!handler.is_polling("/a"));

    // Attempts 4 and 5 never happen.
    sleep_until(secs(start, 7.5)).await;
    let stats = handler.stats();
    assert_eq!(stats.poll_attempts, 3);
    assert_eq!(stats.poll_changes, 1);
    assert_eq!(handler.backend().fetches.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn exhausted_poll_leaves_entry_untouched() {
    let start = Instant::now();
    let handler = SpongeHandler::new(
        Scripted::values(&["A"]),
        SpongeConfig {
            extra_expiration: Duration::from_secs(30),
            ..config(3)
        },
    )
    .unwrap();

    handler.serve(get("/a")).await;
    sleep_until(secs(start, 10.0)).await;

    let entry = handler.store().get("/a").unwrap();
    assert_eq!(entry.result().0, "A");
    assert_eq!(entry.last_updated(), start);
    assert!(!handler.is_polling("/a"));
    assert_eq!(handler.stats().poll_attempts, 3);
    assert_eq!(handler.stats().poll_changes, 0);
}

#[tokio::test(start_paused = true)]
async fn change_then_expiry_then_fresh_fetch() {
    let start = Instant::now();
    let backend = Scripted::values(&["A", "A", "B", "C"]);
    let handler = SpongeHandler::new(backend, config(3)).unwrap();

    assert_eq!(handler.serve(get("/a")).await.body_ref(), b"A");
    assert_eq!(handler.config().expiry_policy().threshold(), Duration::from_secs(3));

    sleep_until(secs(start, 1.5)).await;
    assert_eq!(cached(&handler, "/a"), Some("A"));

    sleep_until(secs(start, 2.5)).await;
    let entry = handler.store().get("/a").unwrap();
    assert_eq!(entry.result().0, "B");
    assert_eq!(entry.last_updated(), secs(start, 2.0));
    assert!(!handler.is_polling("/a"));

    // Age 2s at t=4: still there.
    sleep_until(secs(start, 4.5)).await;
    assert_eq!(cached(&handler, "/a"), Some("B"));

    // Age 3s at the t=5 sweep: gone.
    sleep_until(secs(start, 5.5)).await;
    assert!(handler.store().get("/a").is_none());
    assert_eq!(handler.stats().evictions, 1);

    sleep_until(secs(start, 6.0)).await;
    let response = handler.serve(get("/a")).await;
    assert_eq!(response.body_ref(), b"C");
    assert_eq!(handler.stats().backend_fetches, 2);
    assert!(handler.is_polling("/a"));
}

#[tokio::test(start_paused = true)]
async fn request_after_eviction_is_one_cold_fetch() {
    let start = Instant::now();
    let handler = SpongeHandler::new(Scripted::values(&["A"]), config(1)).unwrap();

    handler.serve(get("/a")).await;
    sleep_until(secs(start, 1.5)).await;
    assert!(!handler.store().contains("/a"));

    let (first, second) = tokio::join!(handler.serve(get("/a")), handler.serve(get("/a")));
    assert_eq!(first.body_ref(), b"A");
    assert_eq!(first, second);

    let stats = handler.stats();
    assert_eq!(stats.backend_fetches, 2);
    assert!(handler.store().contains("/a"));
}

#[tokio::test(start_paused = true)]
async fn slow_key_does_not_block_other_keys() {
    let handler = Arc::new(SpongeHandler::new(Scripted::values(&["A"]), config(3)).unwrap());

    let slow = {
        let handler = Arc::clone(&handler);
        tokio::spawn(async move { handler.serve(get("/slow")).await })
    };
    tokio::task::yield_now().await;

    let fast = timeout(Duration::from_secs(1), handler.serve(get("/fast")))
        .await
        .expect("unrelated key waited on the slow fetch");
    assert_eq!(fast.body_ref(), b"A");
    assert!(!slow.is_finished());

    let slow = slow.await.unwrap();
    assert_eq!(slow.status(), StatusCode::Ok);
}

#[tokio::test(start_paused = true)]
async fn warm_store_is_served_then_expires() {
    let start = Instant::now();
    let store = EntryStore::from_results([("/w", Snapshot("warm"))]);
    let handler =
        SpongeHandler::with_store(Scripted::values(&["fresh"]), config(2), store).unwrap();

    assert_eq!(handler.serve(get("/w")).await.body_ref(), b"warm");
    assert_eq!(handler.stats().backend_fetches, 0);
    assert!(!handler.is_polling("/w"));

    sleep_until(secs(start, 2.5)).await;
    assert!(!handler.store().contains("/w"));
    assert_eq!(handler.serve(get("/w")).await.body_ref(), b"fresh");
}

#[tokio::test(start_paused = true)]
async fn handlers_can_share_one_store() {
    let first = SpongeHandler::new(Scripted::values(&["A"]), config(3)).unwrap();
    let second =
        SpongeHandler::with_store(Scripted::values(&["Z"]), config(3), first.store().clone())
            .unwrap();

    first.serve(get("/a")).await;
    assert_eq!(second.serve(get("/a")).await.body_ref(), b"A");
    assert_eq!(second.stats().backend_fetches, 0);
    assert_eq!(second.stats().hits, 1);
}

#[tokio::test(start_paused = true)]
async fn handlers_on_one_store_share_a_cold_fetch() {
    let delay = Duration::from_millis(200);
    let first = SpongeHandler::new(Scripted::values(&["A"]).delayed(delay), config(3)).unwrap();
    let second = SpongeHandler::with_store(
        Scripted::values(&["Z"]).delayed(delay),
        config(3),
        first.store().clone(),
    )
    .unwrap();

    let request = get("/a");
    let (one, two) = tokio::join!(first.resolve(&request), second.resolve(&request));
    let (one, two) = (one.unwrap(), two.unwrap());

    let fetches = first.backend().fetches.load(Ordering::SeqCst)
        + second.backend().fetches.load(Ordering::SeqCst);
    assert_eq!(fetches, 1);
    assert!(Arc::ptr_eq(&one, &two));
    assert_eq!(one.0, "A");

    // One poll session for the key, visible through either handler.
    assert_eq!(first.active_polls(), 1);
    assert_eq!(second.active_polls(), 1);
    assert!(second.is_polling("/a"));
}

#[tokio::test(start_paused = true)]
async fn dropping_one_sharing_handler_keeps_the_others_sessions() {
    let first = SpongeHandler::new(Scripted::values(&["A"]), config(5)).unwrap();
    let second =
        SpongeHandler::with_store(Scripted::values(&["B"]), config(5), first.store().clone())
            .unwrap();

    first.serve(get("/a")).await;
    second.serve(get("/b")).await;
    assert_eq!(first.active_polls(), 2);

    drop(second);
    tokio::task::yield_now().await;

    assert!(first.is_polling("/a"));
    assert!(!first.is_polling("/b"));
    assert_eq!(first.active_polls(), 1);
}

#[tokio::test(start_paused = true)]
async fn eviction_leaves_the_next_entrys_session_running() {
    let start = Instant::now();
    // Every fetch takes 10s, so the first poll is still in flight when its
    // entry expires.
    let backend = Scripted::values(&["A"]).delayed(Duration::from_secs(10));
    let handler = SpongeHandler::new(
        backend,
        SpongeConfig {
            sweep_interval: Duration::from_secs(3600),
            ..config(1)
        },
    )
    .unwrap();
    let policy = handler.config().expiry_policy();

    handler.serve(get("/a")).await;
    sleep_until(secs(start, 12.0)).await;
    assert!(handler.is_polling("/a"));

    let evicted = evict(handler.store(), &policy, Instant::now());
    assert_eq!(evicted.len(), 1);
    let stale = evicted[0].session.expect("evicted entry had a session");

    // A request lands between eviction and cancellation: a fresh cold fetch
    // installs a new entry and starts a new session.
    handler.serve(get("/a")).await;
    assert_eq!(handler.backend().fetches.load(Ordering::SeqCst), 3);
    assert_ne!(handler.store().sessions().session_of("/a"), Some(stale));

    cancel_evicted(handler.store(), &evicted);
    assert!(handler.is_polling("/a"));
    assert!(handler.store().contains("/a"));
}

#[tokio::test(start_paused = true)]
async fn failed_poll_attempt_is_skipped_by_default() {
    let start = Instant::now();
    let backend = Scripted::new([Step::Value("A"), Step::Fail, Step::Value("B")]);
    let handler = SpongeHandler::new(backend, config(3)).unwrap();

    handler.serve(get("/a")).await;
    sleep_until(secs(start, 2.5)).await;

    assert_eq!(cached(&handler, "/a"), Some("B"));
    let stats = handler.stats();
    assert_eq!(stats.poll_errors, 1);
    assert_eq!(stats.poll_attempts, 2);
    // Poll failures never reach the error handler.
    assert_eq!(handler.backend().errors_handled.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_poll_attempt_aborts_under_abort_policy() {
    let start = Instant::now();
    let backend = Scripted::new([Step::Value("A"), Step::Fail, Step::Value("B")]);
    let handler = SpongeHandler::new(
        backend,
        SpongeConfig {
            poll_error_policy: PollErrorPolicy::Abort,
            extra_expiration: Duration::from_secs(30),
            ..config(3)
        },
    )
    .unwrap();

    handler.serve(get("/a")).await;
    sleep_until(secs(start, 5.0)).await;

    assert_eq!(cached(&handler, "/a"), Some("A"));
    assert!(!handler.is_polling("/a"));
    assert_eq!(handler.stats().poll_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_handler_stops_polling() {
    let start = Instant::now();
    let handler = SpongeHandler::new(Scripted::values(&["A"]), config(5)).unwrap();
    let store = handler.store().clone();

    handler.serve(get("/a")).await;
    drop(handler);

    sleep_until(secs(start, 30.0)).await;
    // Neither a poll change nor the sweeper touched the shared store.
    let entry = store.get("/a").unwrap();
    assert_eq!(entry.last_updated(), start);
}
