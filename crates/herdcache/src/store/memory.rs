//! An in-process [`RemoteStore`], for tests and local development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use tokio::time::Instant;

use super::{RemoteStore, RemoteStoreFactory, StoreError, StoreResult};
use crate::caching::CacheKey;
use crate::topology::TopologyGeneration;

#[derive(Debug)]
struct StoredValue {
    value: Bytes,
    /// `None` never expires.
    expires: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires.is_none_or(|expires| now < expires)
    }
}

/// A [`RemoteStore`] keeping all values in memory.
///
/// Expiration follows the tokio clock, so tests can control it with [`tokio::time::pause`].
/// Every operation can be slowed down with an artificial latency, and failures can be injected.
/// Writes always wait for the latency, and become visible after it. Writes can be slowed down
/// further with [`set_write_latency`](Self::set_write_latency).
#[derive(Debug)]
pub struct InMemoryStore {
    name: String,
    entries: Mutex<HashMap<CacheKey, StoredValue>>,
    latency: Mutex<Duration>,
    write_latency: Mutex<Duration>,
    failing: AtomicBool,
    closed: AtomicBool,
    gets: AtomicUsize,
    sets: AtomicUsize,
}

impl InMemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
            latency: Mutex::new(Duration::ZERO),
            write_latency: Mutex::new(Duration::ZERO),
            failing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            gets: AtomicUsize::new(0),
            sets: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Latency added on top of the regular one to every `set`.
    pub fn set_write_latency(&self, latency: Duration) {
        *self.write_latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Makes all subsequent operations fail with [`StoreError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Whether a live value is stored under `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        self.entries()
            .get(key)
            .is_some_and(|stored| stored.is_live(now))
    }

    /// The number of live values.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries()
            .values()
            .filter(|stored| stored.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of `get` calls so far.
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::Relaxed)
    }

    /// The number of `set` calls so far.
    pub fn set_count(&self) -> usize {
        self.sets.load(Ordering::Relaxed)
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<CacheKey, StoredValue>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn latency(&self) -> Duration {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn delay(&self) {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    async fn write_delay(&self) {
        let latency = *self.write_latency.lock().unwrap_or_else(PoisonError::into_inner);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.is_closed() {
            return Err(StoreError::Unavailable(format!("{} is closed", self.name)));
        }
        if self.failing.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable(format!(
                "{} is not reachable",
                self.name
            )));
        }
        Ok(())
    }
}

impl RemoteStore for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get<'a>(
        &'a self,
        key: &'a CacheKey,
        timeout: Duration,
    ) -> BoxFuture<'a, StoreResult<Option<Bytes>>> {
        async move {
            self.gets.fetch_add(1, Ordering::Relaxed);
            tokio::time::timeout(timeout, self.delay())
                .await
                .map_err(|_elapsed| StoreError::Timeout(timeout))?;
            self.check_available()?;

            let now = Instant::now();
            let mut entries = self.entries();
            let value = entries
                .get(key)
                .filter(|stored| stored.is_live(now))
                .map(|stored| stored.value.clone());
            if value.is_none() {
                entries.remove(key);
            }
            Ok(value)
        }
        .boxed()
    }

    fn set<'a>(
        &'a self,
        key: &'a CacheKey,
        value: Bytes,
        ttl: Duration,
        _wait_for_ack: bool,
    ) -> BoxFuture<'a, StoreResult<()>> {
        async move {
            self.sets.fetch_add(1, Ordering::Relaxed);
            self.delay().await;
            self.write_delay().await;
            self.check_available()?;

            let expires = match ttl.is_zero() {
                true => None,
                false => Instant::now().checked_add(ttl),
            };
            self.entries()
                .insert(key.clone(), StoredValue { value, expires });
            Ok(())
        }
        .boxed()
    }

    fn remove<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, StoreResult<()>> {
        async move {
            self.delay().await;
            self.check_available()?;
            self.entries().remove(key);
            Ok(())
        }
        .boxed()
    }

    fn flush_all(&self) -> BoxFuture<'_, StoreResult<()>> {
        async move {
            self.delay().await;
            self.check_available()?;
            self.entries().clear();
            Ok(())
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async move {
            if !self.closed.swap(true, Ordering::Relaxed) {
                tracing::debug!(store = %self.name, "closed in-memory store");
            }
        }
        .boxed()
    }
}

/// Creates a new, empty [`InMemoryStore`] for every topology generation.
///
/// All created stores are kept, so that they can be inspected after a topology change.
#[derive(Debug, Default)]
pub struct InMemoryStoreFactory {
    latency: Duration,
    failing: AtomicBool,
    created: Mutex<Vec<Arc<InMemoryStore>>>,
}

impl InMemoryStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `latency` to every created store.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes subsequent calls to `create` fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// All the stores created so far, oldest first.
    pub fn stores(&self) -> Vec<Arc<InMemoryStore>> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The most recently created store.
    pub fn latest(&self) -> Option<Arc<InMemoryStore>> {
        self.stores().pop()
    }
}

impl RemoteStoreFactory for InMemoryStoreFactory {
    fn create(&self, generation: &TopologyGeneration) -> anyhow::Result<Arc<dyn RemoteStore>> {
        if self.failing.load(Ordering::Relaxed) {
            bail!("failed to connect to {}", generation);
        }
        let store = Arc::new(
            InMemoryStore::new(format!("memory-v{}", generation.version()))
                .with_latency(self.latency),
        );
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&store));
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use crate::caching::{KeyConfig, KeyHasher};

    use super::*;

    fn key(name: &str) -> CacheKey {
        KeyHasher::new(&KeyConfig::default()).canonicalize(name)
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let store = InMemoryStore::new("test");
        let k = key("k");

        store
            .set(&k, Bytes::from_static(b"v"), Duration::from_secs(5), true)
            .await
            .unwrap();
        let hit = store.get(&k, Duration::from_secs(1)).await.unwrap();
        assert_eq!(hit.as_deref(), Some(&b"v"[..]));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(store.get(&k, Duration::from_secs(1)).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_timeout() {
        let store = InMemoryStore::new("slow").with_latency(Duration::from_millis(200));
        let err = store
            .get(&key("k"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_latency() {
        let store = InMemoryStore::new("test");
        store.set_write_latency(Duration::from_millis(300));
        let k = key("k");

        let start = Instant::now();
        store
            .set(&k, Bytes::from_static(b"v"), Duration::ZERO, true)
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(300));

        let start = Instant::now();
        assert!(store.get(&k, Duration::from_secs(1)).await.unwrap().is_some());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_failures() {
        let store = InMemoryStore::new("test");
        store.set_failing(true);
        let err = store.get(&key("k"), Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.to_string(), "store unavailable: test is not reachable");

        store.set_failing(false);
        store.close().await;
        let err = store.remove(&key("k")).await.unwrap_err();
        assert_eq!(err.to_string(), "store unavailable: test is closed");
    }
}
