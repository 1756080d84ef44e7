//! # Memoizing in front of a remote store
//!
//! The [`CacheEngine`] computes values at most once per key and process, and shares them through
//! a remote key-value store with other processes.
//!
//! A lookup goes through these steps:
//!
//! - The value is looked up in the *primary* namespace of the store. A usable value is returned
//!   right away.
//! - If stale caching is enabled, the value is looked up in the *stale* namespace, where values
//!   live longer than in the primary one. If found, only the first caller recomputes the value,
//!   all others get the stale copy without waiting.
//! - Otherwise, all callers join a single computation through the [`InFlightRegistry`], and
//!   observe its result or its failure.
//!
//! Failures of the store, like timeouts or unreachable hosts, are never surfaced to callers. They
//! are treated as cache misses, and the value is computed instead.
//!
//! Values are wrapped in a [`CacheEntry`], which records its creation date and whether the value
//! is a fallback for a failed computation.

mod cache_entry;
mod cache_error;
mod cache_key;
mod codec;
mod config;
mod engine;
mod handle;
mod in_flight;


pub use cache_entry::CacheEntry;
pub use cache_error::{CacheError, CacheResult};
pub use cache_key::{CacheKey, KeyHasher, KeyHashing};
pub use codec::{Codec, JsonCodec};
pub use config::{CacheConfig, KeyConfig, StaleCacheConfig, TopologyConfig};
pub use engine::{ApplyOptions, CacheEngine, ClearableCache, RequiresShutdown};
pub use handle::CacheHandle;
pub use in_flight::{Completer, InFlightRegistry, Registration};
