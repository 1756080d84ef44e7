use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// An error surfaced by the caching layer.
///
/// Only [`ComputationFailed`](Self::ComputationFailed) and [`Shutdown`](Self::Shutdown) ever
/// reach callers of [`CacheEngine::apply`](super::CacheEngine::apply). All the store related
/// variants are absorbed by the engine, which falls back to running the computation.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// A store operation did not finish within its deadline.
    #[error("store operation timed out after {0:?}")]
    StoreTimeout(Duration),
    /// The store could not be reached, or rejected the operation.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    /// The caller supplied computation failed.
    ///
    /// This is shared between all the callers waiting on the same computation, and never cached.
    #[error("computation failed: {0:#}")]
    ComputationFailed(Arc<anyhow::Error>),
    /// A value could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(String),
    /// The cluster topology could not be fetched.
    #[error("failed to fetch cluster topology: {0}")]
    TopologyFetch(String),
    /// The cache was shut down.
    #[error("cache has been shut down")]
    Shutdown,
}

impl CacheError {
    /// Wraps an error of a caller supplied computation.
    pub fn computation(err: impl Into<anyhow::Error>) -> Self {
        Self::ComputationFailed(Arc::new(err.into()))
    }

    /// The computation went away without producing a result.
    pub(crate) fn abandoned() -> Self {
        Self::computation(anyhow::anyhow!("computation was abandoned"))
    }

    /// Whether this error originates from the remote store.
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            Self::StoreTimeout(_) | Self::StoreUnavailable(_) | Self::Serialization(_)
        )
    }

    /// The tag used for this error in metrics.
    pub(crate) fn metrics_tag(&self) -> &'static str {
        match self {
            Self::StoreTimeout(_) => "timeout",
            Self::StoreUnavailable(_) => "unavailable",
            Self::ComputationFailed(_) => "computation",
            Self::Serialization(_) => "serialization",
            Self::TopologyFetch(_) => "topology",
            Self::Shutdown => "shutdown",
        }
    }
}

impl From<StoreError> for CacheError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Timeout(duration) => Self::StoreTimeout(duration),
            StoreError::Unavailable(details) => Self::StoreUnavailable(details),
            StoreError::Other(err) => Self::StoreUnavailable(format!("{err:#}")),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// The result of a cache operation.
pub type CacheResult<T> = Result<T, CacheError>;
