//! The remote key-value store the cache is fronting.
//!
//! The wire protocol of the store is not part of this crate. A store is accessed through the
//! [`RemoteStore`] trait, and built for a specific cluster topology by a [`RemoteStoreFactory`].
//! Which store instance is currently active is tracked by the [`BackendHandle`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::caching::CacheKey;
use crate::topology::TopologyGeneration;

mod backend;
pub mod memory;

pub use backend::{ActiveBackend, BackendHandle};
pub use memory::{InMemoryStore, InMemoryStoreFactory};

/// Errors talking to the remote store.
///
/// None of these are fatal for callers of the cache, which fall back to computing values.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A client for a remote key-value store, connected to one specific set of hosts.
pub trait RemoteStore: fmt::Debug + Send + Sync + 'static {
    /// A short name of the store, used in logs and metrics.
    fn name(&self) -> &str;

    /// Looks up `key`, giving up after `timeout`.
    ///
    /// Returns `Ok(None)` on a miss.
    fn get<'a>(
        &'a self,
        key: &'a CacheKey,
        timeout: Duration,
    ) -> BoxFuture<'a, StoreResult<Option<Bytes>>>;

    /// Writes `value` under `key`, expiring after `ttl`.
    ///
    /// If `wait_for_ack` is `false`, the store may return as soon as the write was issued.
    fn set<'a>(
        &'a self,
        key: &'a CacheKey,
        value: Bytes,
        ttl: Duration,
        wait_for_ack: bool,
    ) -> BoxFuture<'a, StoreResult<()>>;

    fn remove<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, StoreResult<()>>;

    /// Removes every key from the store, including the ones not written by this process.
    fn flush_all(&self) -> BoxFuture<'_, StoreResult<()>>;

    /// Closes all connections of this store.
    ///
    /// Operations issued after this fail with [`StoreError::Unavailable`].
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Creates a [`RemoteStore`] connected to the hosts of a [`TopologyGeneration`].
pub trait RemoteStoreFactory: Send + Sync + 'static {
    fn create(&self, generation: &TopologyGeneration) -> anyhow::Result<Arc<dyn RemoteStore>>;
}

impl<F> RemoteStoreFactory for F
where
    F: Fn(&TopologyGeneration) -> anyhow::Result<Arc<dyn RemoteStore>> + Send + Sync + 'static,
{
    fn create(&self, generation: &TopologyGeneration) -> anyhow::Result<Arc<dyn RemoteStore>> {
        self(generation)
    }
}
