use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;

use crate::store::{BackendHandle, RemoteStore, RemoteStoreFactory, StoreError};
use crate::topology::{
    ClusterConfigWatcher, ClusterTopologySource, TopologyGeneration, WatcherHandle, parse_hosts,
};
use crate::utils::measure::MeasureComputationGuard;

use super::cache_entry::CacheEntry;
use super::cache_error::{CacheError, CacheResult};
use super::cache_key::{CacheKey, KeyHasher};
use super::codec::Codec;
use super::config::CacheConfig;
use super::handle::CacheHandle;
use super::in_flight::{Completer, InFlightRegistry};

type Predicate<V> = Arc<dyn Fn(&V) -> bool + Send + Sync>;

/// Per-call options of [`CacheEngine::apply_with`].
pub struct ApplyOptions<V> {
    ttl: Option<Duration>,
    is_cached_value_valid: Predicate<V>,
    is_supplier_value_cachable: Predicate<V>,
}

impl<V> Default for ApplyOptions<V> {
    fn default() -> Self {
        Self {
            ttl: None,
            is_cached_value_valid: Arc::new(|_| true),
            is_supplier_value_cachable: Arc::new(|_| true),
        }
    }
}

impl<V> Clone for ApplyOptions<V> {
    fn clone(&self) -> Self {
        Self {
            ttl: self.ttl,
            is_cached_value_valid: Arc::clone(&self.is_cached_value_valid),
            is_supplier_value_cachable: Arc::clone(&self.is_supplier_value_cachable),
        }
    }
}

impl<V> fmt::Debug for ApplyOptions<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplyOptions")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl<V> ApplyOptions<V> {
    /// Overrides the configured time-to-live of the computed value.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Cached values (primary or stale) failing this predicate are treated as misses.
    pub fn cached_value_valid<F>(mut self, f: F) -> Self
    where
        F: Fn(&V) -> bool + Send + Sync + 'static,
    {
        self.is_cached_value_valid = Arc::new(f);
        self
    }

    /// Computed values failing this predicate are returned to callers, but not written to the
    /// store.
    pub fn supplier_value_cachable<F>(mut self, f: F) -> Self
    where
        F: Fn(&V) -> bool + Send + Sync + 'static,
    {
        self.is_supplier_value_cachable = Arc::new(f);
        self
    }
}

/// Drops pending computations and optionally the contents of the remote store.
pub trait ClearableCache {
    /// Forgets all in-flight computations.
    ///
    /// If `also_flush_remote` is set and flushing is allowed by the configuration, this also
    /// removes every value from the remote store.
    fn clear(&self, also_flush_remote: bool) -> BoxFuture<'_, ()>;
}

/// Releases background tasks and connections.
pub trait RequiresShutdown {
    fn shutdown(&self) -> BoxFuture<'_, ()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Namespace {
    Primary,
    Stale,
}

impl Namespace {
    fn as_str(self) -> &'static str {
        match self {
            Namespace::Primary => "primary",
            Namespace::Stale => "stale",
        }
    }
}

struct EngineInner<V> {
    config: CacheConfig,
    hasher: KeyHasher,
    codec: Arc<dyn Codec<V>>,
    backend: BackendHandle,
    in_flight: InFlightRegistry<V>,
    runtime: Handle,
    watcher: Mutex<Option<WatcherHandle>>,
    shut_down: AtomicBool,
}

/// A memoizing cache in front of a [`RemoteStore`].
///
/// See the [module docs](super) for how lookups work. The engine is cheap to clone, all clones
/// share the same in-flight computations.
pub struct CacheEngine<V> {
    inner: Arc<EngineInner<V>>,
}

impl<V> Clone for CacheEngine<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> fmt::Debug for CacheEngine<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEngine")
            .field("config", &self.inner.config)
            .field("backend", &self.inner.backend)
            .field("in_flight", &self.inner.in_flight)
            .finish()
    }
}

impl<V> CacheEngine<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates an engine working on an existing backend.
    ///
    /// Computations and background writes are spawned on `runtime`.
    pub fn new(
        config: CacheConfig,
        backend: BackendHandle,
        codec: Arc<dyn Codec<V>>,
        runtime: Handle,
    ) -> Self {
        let hasher = KeyHasher::new(&config.keys);
        Self {
            inner: Arc::new(EngineInner {
                config,
                hasher,
                codec,
                backend,
                in_flight: InFlightRegistry::new(),
                runtime,
                watcher: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Creates an engine connected to the configured hosts.
    pub fn connect(
        config: CacheConfig,
        factory: &dyn RemoteStoreFactory,
        codec: Arc<dyn Codec<V>>,
        runtime: Handle,
    ) -> anyhow::Result<Self> {
        let hosts = parse_hosts(&config.hosts).context("invalid cache hosts")?;
        let generation = TopologyGeneration::new(0, hosts);
        let store = factory
            .create(&generation)
            .with_context(|| format!("failed to connect to {generation}"))?;
        tracing::info!(store = store.name(), %generation, "connected to remote store");

        let backend = BackendHandle::new(store, generation, config.topology.retirement_delay);
        Ok(Self::new(config, backend, codec, runtime))
    }

    /// A watcher that keeps the backend of this engine in sync with the cluster topology.
    ///
    /// Observers can be registered on the watcher before passing it to
    /// [`start_watcher`](Self::start_watcher).
    pub fn topology_watcher(
        &self,
        source: Arc<dyn ClusterTopologySource>,
        factory: Arc<dyn RemoteStoreFactory>,
    ) -> ClusterConfigWatcher {
        ClusterConfigWatcher::new(
            source,
            factory,
            self.inner.backend.clone(),
            self.inner.config.topology,
            self.inner.runtime.clone(),
        )
    }

    /// Runs `watcher` in the background until the engine is shut down.
    ///
    /// Replaces a previously started watcher.
    pub fn start_watcher(&self, watcher: ClusterConfigWatcher) {
        let handle = watcher.spawn();
        let previous = self
            .inner
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if previous.is_some() {
            tracing::debug!("replaced running topology watcher");
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &BackendHandle {
        &self.inner.backend
    }

    /// The canonical store key of `key`.
    pub fn canonical_key(&self, key: &str) -> CacheKey {
        self.inner.hasher.canonicalize(key)
    }

    /// The number of computations currently running.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Relaxed)
    }

    /// Returns the value cached for `key`, or computes it with `computation`.
    ///
    /// Uses the default [`ApplyOptions`].
    pub async fn apply<F, Fut>(&self, key: &str, computation: F) -> CacheHandle<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.apply_with(key, computation, ApplyOptions::default())
            .await
    }

    /// Returns the value cached for `key`, or computes it with `computation`.
    ///
    /// The computation runs on the runtime of the engine, and at most once for concurrent calls
    /// with the same key. It runs to completion even if all callers dropped their handles.
    pub async fn apply_with<F, Fut>(
        &self,
        key: &str,
        computation: F,
        options: ApplyOptions<V>,
    ) -> CacheHandle<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        if self.is_shut_down() {
            return CacheHandle::failed(CacheError::Shutdown);
        }

        let key = self.canonical_key(key);
        metric!(counter("caches.access") += 1);

        if let Some(value) = self.lookup(&key, Namespace::Primary, &options).await {
            return CacheHandle::ready(value);
        }

        if self.inner.config.stale.enabled {
            let stale_key = key.stale(&self.inner.config.stale.prefix);
            if let Some(stale) = self.lookup(&stale_key, Namespace::Stale, &options).await {
                let registration = self.inner.in_flight.register_if_absent(key.clone());
                return match registration.winner {
                    Some(completer) => {
                        tracing::trace!(key = %completer.key(), "refreshing stale value");
                        self.spawn_computation(completer, computation, options);
                        registration.handle
                    }
                    // The refresh finished, but its value is not in the store yet.
                    None => match self.inner.in_flight.completed(&key) {
                        Some(fresh) => CacheHandle::ready(fresh),
                        None => {
                            tracing::trace!(%stale_key, "serving stale value during refresh");
                            CacheHandle::ready(stale)
                        }
                    },
                };
            }
        }

        let registration = self.inner.in_flight.register_if_absent(key);
        if let Some(completer) = registration.winner {
            self.spawn_computation(completer, computation, options);
        }
        registration.handle
    }

    /// Returns the value cached for `key`, without computing it.
    ///
    /// Joins a computation pending for the key. Resolves to `None` on a miss, or when the
    /// store could not be reached.
    pub async fn get(&self, key: &str) -> CacheHandle<Option<V>> {
        if self.is_shut_down() {
            return CacheHandle::failed(CacheError::Shutdown);
        }

        let key = self.canonical_key(key);
        metric!(counter("caches.access") += 1);

        if let Some(handle) = self.inner.in_flight.get(&key) {
            return handle.map(Some);
        }
        let value = self
            .lookup(&key, Namespace::Primary, &ApplyOptions::default())
            .await;
        CacheHandle::ready(value)
    }

    /// Writes `value` for `key`, expiring after `ttl` or the configured TTL.
    ///
    /// Waits for the store only if `wait_for_set` is configured.
    pub async fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        self.set_entry(key, CacheEntry::new(value), ttl).await
    }

    /// Writes a prepared [`CacheEntry`] for `key`, for example a fallback value.
    pub async fn set_entry(&self, key: &str, entry: CacheEntry<V>, ttl: Option<Duration>) {
        if self.is_shut_down() {
            return;
        }
        let key = self.canonical_key(key);
        let ttl = ttl.unwrap_or(self.inner.config.ttl);
        self.store_entry(key, &entry, ttl).await
    }

    /// Removes `key` from the primary and stale namespaces.
    ///
    /// Waits for the store only if `wait_for_remove` is configured.
    pub async fn remove(&self, key: &str) {
        if self.is_shut_down() {
            return;
        }
        let config = &self.inner.config;
        let key = self.canonical_key(key);
        let stale_key = config
            .stale
            .enabled
            .then(|| key.stale(&config.stale.prefix));

        let store = self.inner.backend.store();
        let timeout = config.remove_timeout;
        let remove = async move {
            remove_with_timeout(&*store, &key, timeout).await;
            if let Some(stale_key) = stale_key {
                remove_with_timeout(&*store, &stale_key, timeout).await;
            }
        };

        if config.wait_for_remove {
            remove.await
        } else {
            self.inner
                .runtime
                .spawn(remove.bind_hub(Hub::new_from_top(Hub::current())));
        }
    }

    /// Looks up a usable value for `key` in `namespace`.
    ///
    /// Every failure is logged and treated as a miss.
    async fn lookup(
        &self,
        key: &CacheKey,
        namespace: Namespace,
        options: &ApplyOptions<V>,
    ) -> Option<V> {
        let timeout = match namespace {
            Namespace::Primary => self.inner.config.get_timeout,
            Namespace::Stale => self.inner.config.stale.get_timeout,
        };
        let store = self.inner.backend.store();

        let result = tokio::time::timeout(timeout, store.get(key, timeout))
            .await
            .unwrap_or_else(|_elapsed| Err(StoreError::Timeout(timeout)))
            .map_err(CacheError::from)
            .and_then(|bytes| {
                bytes
                    .map(|bytes| self.inner.codec.decode(&bytes))
                    .transpose()
            });

        let entry = match result {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                record_lookup(namespace, false);
                return None;
            }
            Err(err) => {
                metric!(
                    counter("caches.store.error") += 1,
                    "op" => "get",
                    "namespace" => namespace.as_str(),
                    "error" => err.metrics_tag(),
                );
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    %key,
                    store = store.name(),
                    namespace = namespace.as_str(),
                    "cache lookup failed, treating as a miss"
                );
                record_lookup(namespace, false);
                return None;
            }
        };

        if !entry.is_usable() {
            tracing::trace!(%key, "found fallback entry, treating as a miss");
            record_lookup(namespace, false);
            return None;
        }
        if !(options.is_cached_value_valid)(entry.value()) {
            tracing::trace!(%key, "cached value is not valid anymore");
            record_lookup(namespace, false);
            return None;
        }

        record_lookup(namespace, true);
        Some(entry.into_value())
    }

    fn spawn_computation<F, Fut>(
        &self,
        completer: Completer<V>,
        computation: F,
        options: ApplyOptions<V>,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let engine = self.clone();
        let task = async move {
            metric!(counter("caches.computation") += 1);
            let measure = MeasureComputationGuard::new("caches.computation.duration");

            let result = match AssertUnwindSafe(async move { computation().await })
                .catch_unwind()
                .await
            {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(CacheError::computation(err)),
                Err(panic) => {
                    let err = CacheError::computation(anyhow::anyhow!(
                        "computation panicked: {}",
                        panic_message(&*panic)
                    ));
                    sentry::capture_error(&err);
                    Err(err)
                }
            };
            measure.done(&result);

            engine.finish(completer, result, &options).await;
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        self.inner.runtime.spawn(task);
    }

    /// Writes a computed value and resolves the waiting callers.
    async fn finish(
        &self,
        mut completer: Completer<V>,
        result: CacheResult<V>,
        options: &ApplyOptions<V>,
    ) {
        let value = match result {
            Ok(value) => value,
            Err(err) => {
                metric!(counter("caches.computation.failed") += 1);
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    key = %completer.key(),
                    "computation failed"
                );
                completer.complete(Err(err));
                return;
            }
        };

        if self.inner.config.remove_in_flight_before_set {
            completer.release();
        }

        if !(options.is_supplier_value_cachable)(&value) {
            tracing::trace!(key = %completer.key(), "computed value is not cachable");
            completer.complete(Ok(value));
            return;
        }

        let ttl = options.ttl.unwrap_or(self.inner.config.ttl);
        let entry = CacheEntry::new(value);
        let write = self.write_request(completer.key().clone(), &entry, ttl);
        let value = entry.into_value();

        match write {
            Some(write) if self.inner.config.wait_for_set => {
                write.send().await;
                completer.complete(Ok(value));
            }
            Some(write) => {
                // Late callers keep joining the resolved entry until the value is in the store.
                completer.resolve(Ok(value));
                let write = async move {
                    write.send().await;
                    completer.release();
                };
                self.inner
                    .runtime
                    .spawn(write.bind_hub(Hub::new_from_top(Hub::current())));
            }
            None => completer.complete(Ok(value)),
        }
    }

    /// Writes `entry` to the primary, and if enabled the stale namespace.
    async fn store_entry(&self, key: CacheKey, entry: &CacheEntry<V>, ttl: Duration) {
        let Some(write) = self.write_request(key, entry, ttl) else {
            return;
        };
        if self.inner.config.wait_for_set {
            write.send().await
        } else {
            self.inner
                .runtime
                .spawn(write.send().bind_hub(Hub::new_from_top(Hub::current())));
        }
    }

    /// Encodes `entry` into a write to the active store.
    ///
    /// Returns `None` if the entry cannot be encoded.
    fn write_request(
        &self,
        key: CacheKey,
        entry: &CacheEntry<V>,
        ttl: Duration,
    ) -> Option<WriteRequest> {
        let config = &self.inner.config;
        let bytes = match self.inner.codec.encode(entry) {
            Ok(bytes) => bytes,
            Err(err) => {
                metric!(
                    counter("caches.store.error") += 1,
                    "op" => "set",
                    "error" => err.metrics_tag(),
                );
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    %key,
                    "failed to encode cache entry"
                );
                return None;
            }
        };

        let stale = config
            .stale
            .enabled
            .then(|| (key.stale(&config.stale.prefix), config.stale_ttl(ttl)));
        Some(WriteRequest {
            store: self.inner.backend.store(),
            key,
            bytes,
            ttl,
            stale,
            wait_for_ack: config.wait_for_set,
            timeout: config.set_timeout,
        })
    }
}

fn record_lookup(namespace: Namespace, hit: bool) {
    match (namespace, hit) {
        (Namespace::Primary, true) => metric!(counter("caches.primary.hit") += 1),
        (Namespace::Primary, false) => metric!(counter("caches.primary.miss") += 1),
        (Namespace::Stale, true) => metric!(counter("caches.stale.hit") += 1),
        (Namespace::Stale, false) => metric!(counter("caches.stale.miss") += 1),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// A write of one value to the primary and optionally the stale namespace.
struct WriteRequest {
    store: Arc<dyn RemoteStore>,
    key: CacheKey,
    bytes: Bytes,
    ttl: Duration,
    stale: Option<(CacheKey, Duration)>,
    wait_for_ack: bool,
    timeout: Duration,
}

impl WriteRequest {
    async fn send(self) {
        let primary = self.set(&self.key, self.ttl, Namespace::Primary);
        match self.stale {
            Some((ref stale_key, stale_ttl)) => {
                let stale = self.set(stale_key, stale_ttl, Namespace::Stale);
                futures::join!(primary, stale);
            }
            None => primary.await,
        }
    }

    async fn set(&self, key: &CacheKey, ttl: Duration, namespace: Namespace) {
        let set = self
            .store
            .set(key, self.bytes.clone(), ttl, self.wait_for_ack);
        let result = match tokio::time::timeout(self.timeout, set).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(CacheError::StoreTimeout(self.timeout)),
        };

        match result {
            Ok(()) => {
                metric!(counter("caches.store.set") += 1, "namespace" => namespace.as_str());
            }
            Err(err) => {
                metric!(
                    counter("caches.store.error") += 1,
                    "op" => "set",
                    "namespace" => namespace.as_str(),
                    "error" => err.metrics_tag(),
                );
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    %key,
                    store = self.store.name(),
                    "failed to write cache entry"
                );
            }
        }
    }
}

async fn remove_with_timeout(store: &dyn RemoteStore, key: &CacheKey, timeout: Duration) {
    let result = match tokio::time::timeout(timeout, store.remove(key)).await {
        Ok(result) => result.map_err(CacheError::from),
        Err(_) => Err(CacheError::StoreTimeout(timeout)),
    };
    if let Err(err) = result {
        metric!(
            counter("caches.store.error") += 1,
            "op" => "remove",
            "error" => err.metrics_tag(),
        );
        tracing::warn!(
            error = &err as &dyn std::error::Error,
            %key,
            store = store.name(),
            "failed to remove cache entry"
        );
    }
}

impl<V> ClearableCache for CacheEngine<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn clear(&self, also_flush_remote: bool) -> BoxFuture<'_, ()> {
        async move {
            self.inner.in_flight.clear();
            if !also_flush_remote {
                return;
            }
            if !self.inner.config.allow_flush {
                tracing::warn!("not flushing the remote store, `allow_flush` is disabled");
                return;
            }

            let store = self.inner.backend.store();
            match store.flush_all().await {
                Ok(()) => tracing::info!(store = store.name(), "flushed remote store"),
                Err(err) => {
                    let err = CacheError::from(err);
                    metric!(
                        counter("caches.store.error") += 1,
                        "op" => "flush",
                        "error" => err.metrics_tag(),
                    );
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        store = store.name(),
                        "failed to flush remote store"
                    );
                }
            }
        }
        .boxed()
    }
}

impl<V> RequiresShutdown for CacheEngine<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn shutdown(&self) -> BoxFuture<'_, ()> {
        async move {
            if self.inner.shut_down.swap(true, Ordering::Relaxed) {
                return;
            }
            let watcher = self
                .inner
                .watcher
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(watcher) = watcher {
                watcher.shutdown();
            }
            self.inner.backend.shutdown().await;
            tracing::info!("cache engine shut down");
        }
        .boxed()
    }
}
