//! A thundering-herd-safe memoization layer in front of a shared remote key-value store.
//!
//! See the [`caching`] module for an overview of how requests are coalesced, how stale values
//! are served, and how the remote backend can be swapped while the cache is in use.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod store;
pub mod topology;
pub mod utils;

#[cfg(test)]
use herdcache_test as test;
