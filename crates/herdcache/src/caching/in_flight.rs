use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use tokio::time::Instant;

use super::cache_error::{CacheError, CacheResult};
use super::cache_key::CacheKey;
use super::handle::CacheHandle;

// `Shared` needs a clonable output, which is why errors are shared behind an `Arc` inside
// `CacheError::ComputationFailed`.
type ComputationChannel<V> = Shared<oneshot::Receiver<CacheResult<V>>>;

struct PendingComputation<V> {
    id: u64,
    started: Instant,
    channel: ComputationChannel<V>,
}

struct RegistryInner<V> {
    entries: Mutex<HashMap<CacheKey, PendingComputation<V>>>,
    next_id: AtomicU64,
}

impl<V> RegistryInner<V> {
    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, PendingComputation<V>>> {
        // The map is consistent after every critical section, so a poisoned lock is still usable.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes the entry for `key`, but only if it still belongs to computation `id`.
    fn remove(&self, key: &CacheKey, id: u64) -> Option<Duration> {
        let mut entries = self.lock();
        let started = match entries.get(key) {
            Some(pending) if pending.id == id => pending.started,
            _ => return None,
        };
        entries.remove(key);
        metric!(gauge("caches.in_flight") = entries.len() as u64);
        Some(started.elapsed())
    }
}

/// Keeps track of the computations currently running, at most one per [`CacheKey`].
///
/// Callers asking for the same key while a computation is pending join it, and observe the
/// exact same result.
pub struct InFlightRegistry<V> {
    inner: Arc<RegistryInner<V>>,
}

impl<V> Clone for InFlightRegistry<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> fmt::Debug for InFlightRegistry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightRegistry")
            .field("len", &self.inner.lock().len())
            .finish()
    }
}

impl<V> Default for InFlightRegistry<V> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }
}

/// The outcome of [`InFlightRegistry::register_if_absent`].
pub struct Registration<V> {
    /// Resolves to the result of the pending computation.
    pub handle: CacheHandle<V>,
    /// Set only for the caller that registered the computation, and is thus responsible for
    /// running it.
    pub winner: Option<Completer<V>>,
}

impl<V> Registration<V> {
    pub fn is_winner(&self) -> bool {
        self.winner.is_some()
    }
}

impl<V> InFlightRegistry<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the computation pending for `key`, or registers a new one.
    ///
    /// Exactly one of any number of concurrent callers for the same key receives the
    /// [`Completer`] of a new computation.
    pub fn register_if_absent(&self, key: CacheKey) -> Registration<V> {
        let mut entries = self.inner.lock();
        if let Some(pending) = entries.get(&key) {
            metric!(counter("caches.coalesced") += 1);
            return Registration {
                handle: handle_for(pending.channel.clone()),
                winner: None,
            };
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        entries.insert(
            key.clone(),
            PendingComputation {
                id,
                started: Instant::now(),
                channel: channel.clone(),
            },
        );
        metric!(gauge("caches.in_flight") = entries.len() as u64);
        drop(entries);

        tracing::trace!(%key, id, "registered computation");
        Registration {
            handle: handle_for(channel),
            winner: Some(Completer {
                key,
                id,
                registry: Arc::clone(&self.inner),
                sender: Some(sender),
                released: false,
            }),
        }
    }

    /// Joins the computation pending for `key`, if any.
    pub fn get(&self, key: &CacheKey) -> Option<CacheHandle<V>> {
        let entries = self.inner.lock();
        entries
            .get(key)
            .map(|pending| handle_for(pending.channel.clone()))
    }

    /// The value of the computation registered for `key`, if it already succeeded.
    ///
    /// An entry can outlive its computation while the value is still being written to the store.
    pub fn completed(&self, key: &CacheKey) -> Option<V> {
        let channel = self.inner.lock().get(key)?.channel.clone();
        match channel.now_or_never()? {
            Ok(Ok(value)) => Some(value),
            _ => None,
        }
    }

    /// Resolves the computation of `completer` and removes its entry.
    pub fn complete(&self, completer: Completer<V>, result: CacheResult<V>) {
        completer.complete(result)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets all pending computations.
    ///
    /// The computations themselves keep running and still resolve the callers that joined them,
    /// but new callers will start fresh computations.
    pub fn clear(&self) {
        let mut entries = self.inner.lock();
        entries.clear();
        metric!(gauge("caches.in_flight") = 0u64);
    }
}

fn handle_for<V>(channel: ComputationChannel<V>) -> CacheHandle<V>
where
    V: Clone + Send + Sync + 'static,
{
    CacheHandle::from_future(
        channel.map(|result| result.unwrap_or_else(|_canceled| Err(CacheError::abandoned()))),
    )
}

/// The token held by the caller responsible for running a computation.
///
/// Dropping it without calling [`complete`](Self::complete) removes the registry entry and
/// fails all joined callers with [`CacheError::ComputationFailed`].
pub struct Completer<V> {
    key: CacheKey,
    id: u64,
    registry: Arc<RegistryInner<V>>,
    sender: Option<oneshot::Sender<CacheResult<V>>>,
    released: bool,
}

impl<V> Completer<V> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Removes the registry entry without resolving the joined callers yet.
    ///
    /// Callers arriving after this start a new computation. Calling this more than once is a no-op.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(elapsed) = self.registry.remove(&self.key, self.id) {
            tracing::trace!(key = %self.key, id = self.id, ?elapsed, "released computation");
        }
    }

    /// Resolves all joined callers with `result`, keeping the registry entry.
    ///
    /// Callers joining afterwards observe the same result right away, until the entry is
    /// [released](Self::release).
    pub fn resolve(&mut self, result: CacheResult<V>) {
        if let Some(sender) = self.sender.take() {
            // Nobody may be waiting anymore, which is fine.
            sender.send(result).ok();
        }
    }

    /// Resolves all joined callers with `result`, then removes the registry entry.
    pub fn complete(mut self, result: CacheResult<V>) {
        self.resolve(result);
        self.release();
    }
}

impl<V> Drop for Completer<V> {
    fn drop(&mut self) {
        if self.sender.is_some() {
            tracing::debug!(key = %self.key, "computation abandoned without a result");
        }
        self.release();
    }
}

impl<V> fmt::Debug for Completer<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("released", &self.released)
            .finish()
    }
}
