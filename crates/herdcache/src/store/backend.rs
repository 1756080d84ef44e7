use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::RemoteStore;
use crate::topology::TopologyGeneration;

/// A [`RemoteStore`] along with the topology it is connected to.
#[derive(Debug)]
pub struct ActiveBackend {
    pub store: Arc<dyn RemoteStore>,
    pub generation: TopologyGeneration,
}

/// Points to the currently active [`RemoteStore`].
///
/// Reads are lock-free and never block on a concurrent [`swap`](Self::swap). The replaced store
/// is closed only after the retirement delay, so that operations already issued against it can
/// finish.
#[derive(Clone)]
pub struct BackendHandle {
    active: Arc<ArcSwap<ActiveBackend>>,
    retirement_delay: Duration,
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active = self.active.load();
        f.debug_struct("BackendHandle")
            .field("store", &active.store.name())
            .field("generation", &active.generation)
            .field("retirement_delay", &self.retirement_delay)
            .finish()
    }
}

impl BackendHandle {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        generation: TopologyGeneration,
        retirement_delay: Duration,
    ) -> Self {
        Self {
            active: Arc::new(ArcSwap::from_pointee(ActiveBackend { store, generation })),
            retirement_delay,
        }
    }

    /// A snapshot of the active backend.
    ///
    /// The snapshot stays usable across a concurrent swap, until the retirement delay elapsed.
    pub fn current(&self) -> Arc<ActiveBackend> {
        self.active.load_full()
    }

    pub fn store(&self) -> Arc<dyn RemoteStore> {
        Arc::clone(&self.active.load().store)
    }

    pub fn generation(&self) -> TopologyGeneration {
        self.active.load().generation.clone()
    }

    /// Publishes `store` as the active backend, and schedules the previous one to be closed.
    ///
    /// Every operation started after this returns uses the new store. The returned task closes the
    /// previous store after the retirement delay.
    pub fn swap(
        &self,
        store: Arc<dyn RemoteStore>,
        generation: TopologyGeneration,
        runtime: &Handle,
    ) -> JoinHandle<()> {
        let previous = self.active.swap(Arc::new(ActiveBackend { store, generation }));
        tracing::info!(
            previous = previous.store.name(),
            version = previous.generation.version(),
            "scheduled retirement of previous store"
        );

        let delay = self.retirement_delay;
        let retire = async move {
            tokio::time::sleep(delay).await;
            previous.store.close().await;
            metric!(counter("topology.retire") += 1);
            tracing::debug!(store = previous.store.name(), "retired store");
        }
        .bind_hub(Hub::new_from_top(Hub::current()));
        runtime.spawn(retire)
    }

    /// Closes the active store right away.
    pub async fn shutdown(&self) {
        let active = self.current();
        active.store.close().await;
        tracing::debug!(store = active.store.name(), "closed active store");
    }
}
