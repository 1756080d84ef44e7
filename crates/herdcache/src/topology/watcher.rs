use std::sync::Arc;
use std::time::Duration;

use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{ClientClusterUpdateObserver, ClusterTopologySource, TopologyGeneration};
use crate::caching::{CacheError, TopologyConfig};
use crate::store::{BackendHandle, RemoteStoreFactory};

/// Lower bound for the poll interval, a zero interval would spin.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The outcome of a single topology poll.
#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// The cluster still has the same hosts.
    Unchanged,
    /// A new store was published for the contained generation.
    Swapped(TopologyGeneration),
    /// Polling or connecting failed, the active store was kept.
    Failed(CacheError),
}

/// Periodically polls the cluster topology, and swaps the active store when it changed.
pub struct ClusterConfigWatcher {
    source: Arc<dyn ClusterTopologySource>,
    factory: Arc<dyn RemoteStoreFactory>,
    backend: BackendHandle,
    config: TopologyConfig,
    observers: Vec<Arc<dyn ClientClusterUpdateObserver>>,
    runtime: Handle,
}

impl std::fmt::Debug for ClusterConfigWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConfigWatcher")
            .field("backend", &self.backend)
            .field("config", &self.config)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl ClusterConfigWatcher {
    pub fn new(
        source: Arc<dyn ClusterTopologySource>,
        factory: Arc<dyn RemoteStoreFactory>,
        backend: BackendHandle,
        config: TopologyConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            source,
            factory,
            backend,
            config,
            observers: Vec::new(),
            runtime,
        }
    }

    /// Registers an observer notified after every swap.
    pub fn with_observer(mut self, observer: Arc<dyn ClientClusterUpdateObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Polls the topology once, swapping the active store if the hosts changed.
    ///
    /// Failures never touch the active store, they are retried on the next tick.
    pub async fn tick(&self) -> TickOutcome {
        metric!(counter("topology.poll") += 1);

        let hosts = match self.source.poll().await {
            Ok(hosts) if hosts.is_empty() => {
                return self.poll_failed(anyhow::anyhow!("topology source returned no hosts"));
            }
            Ok(hosts) => hosts,
            Err(err) => return self.poll_failed(err),
        };

        let current = self.backend.current();
        if current.generation.same_hosts(&hosts) {
            tracing::trace!(generation = %current.generation, "cluster topology unchanged");
            return TickOutcome::Unchanged;
        }

        let generation = current.generation.next(hosts);
        tracing::info!(
            previous = %current.generation,
            next = %generation,
            "cluster topology changed"
        );

        let store = match self.factory.create(&generation) {
            Ok(store) => store,
            Err(err) => {
                metric!(counter("topology.swap.failed") += 1);
                tracing::error!(
                    error = &*err as &dyn std::error::Error,
                    %generation,
                    "failed to create store for new cluster topology"
                );
                sentry::capture_error(&*err);
                return TickOutcome::Failed(CacheError::StoreUnavailable(format!("{err:#}")));
            }
        };

        // The retirement task runs detached, `BackendHandle::shutdown` closes whatever is active.
        let _retirement = self
            .backend
            .swap(store, generation.clone(), &self.runtime);
        metric!(counter("topology.swap") += 1);

        for observer in &self.observers {
            observer.topology_updated(&generation);
        }

        TickOutcome::Swapped(generation)
    }

    fn poll_failed(&self, err: anyhow::Error) -> TickOutcome {
        metric!(counter("topology.poll.failed") += 1);
        tracing::warn!(
            error = &*err as &dyn std::error::Error,
            "failed to poll cluster topology, keeping the active store"
        );
        TickOutcome::Failed(CacheError::TopologyFetch(format!("{err:#}")))
    }

    /// Runs the watcher in the background until the returned handle is dropped.
    ///
    /// Ticks never overlap, a slow tick delays the following ones.
    pub fn spawn(self) -> WatcherHandle {
        let runtime = self.runtime.clone();
        let task = async move {
            let start = Instant::now() + self.config.initial_delay;
            let period = self.config.poll_interval.max(MIN_POLL_INTERVAL);
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::debug!(?period, "started cluster topology watcher");
            loop {
                interval.tick().await;
                self.tick().await;
            }
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        WatcherHandle {
            task: runtime.spawn(task),
        }
    }
}

/// Keeps the background task of a [`ClusterConfigWatcher`] alive.
///
/// The task is stopped on [`shutdown`](Self::shutdown) or when the handle is dropped.
#[derive(Debug)]
pub struct WatcherHandle {
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn shutdown(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
