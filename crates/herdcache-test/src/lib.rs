//! Helpers for testing the cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Most cache tests depend on timing. Run them with paused tokio time
//!    (`#[tokio::test(start_paused = true)]`), so that the delays of a [`ComputationCounter`]
//!    are deterministic and do not slow down the test suite.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// A boxed computation, as passed to the cache.
pub type Computation<V> = Pin<Box<dyn Future<Output = anyhow::Result<V>> + Send>>;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `herdcache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("herdcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Counts how often the computations it creates actually run.
///
/// A computation is counted when it starts running, not when it is created. Computations that
/// were coalesced with another one are thus never counted.
#[derive(Clone, Debug, Default)]
pub struct ComputationCounter {
    started: Arc<AtomicUsize>,
}

impl ComputationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of computations that started running.
    pub fn count(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// A computation resolving to `value` after `delay`.
    pub fn returning<V>(
        &self,
        value: V,
        delay: Duration,
    ) -> impl FnOnce() -> Computation<V> + Send + 'static
    where
        V: Send + 'static,
    {
        let started = Arc::clone(&self.started);
        move || -> Computation<V> { Box::pin(run(started, delay, Outcome::Value(value))) }
    }

    /// A computation failing with `message` after `delay`.
    pub fn failing<V>(
        &self,
        message: &'static str,
        delay: Duration,
    ) -> impl FnOnce() -> Computation<V> + Send + 'static
    where
        V: Send + 'static,
    {
        let started = Arc::clone(&self.started);
        move || -> Computation<V> { Box::pin(run(started, delay, Outcome::Error(message))) }
    }

    /// A computation panicking with `message` after `delay`.
    pub fn panicking<V>(
        &self,
        message: &'static str,
        delay: Duration,
    ) -> impl FnOnce() -> Computation<V> + Send + 'static
    where
        V: Send + 'static,
    {
        let started = Arc::clone(&self.started);
        move || -> Computation<V> { Box::pin(run(started, delay, Outcome::Panic(message))) }
    }
}

enum Outcome<V> {
    Value(V),
    Error(&'static str),
    Panic(&'static str),
}

async fn run<V>(
    started: Arc<AtomicUsize>,
    delay: Duration,
    outcome: Outcome<V>,
) -> anyhow::Result<V> {
    started.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(delay).await;
    match outcome {
        Outcome::Value(value) => Ok(value),
        Outcome::Error(message) => Err(anyhow::anyhow!(message)),
        Outcome::Panic(message) => panic!("{message}"),
    }
}
