use std::time::Duration;

use serde::Deserialize;

use super::cache_key::KeyHashing;

/// How logical keys are turned into store keys.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KeyConfig {
    /// The hashing algorithm applied to logical keys.
    pub hashing: KeyHashing,
    /// An optional prefix prepended to every store key.
    pub prefix: Option<String>,
    /// Escape everything that is not printable ASCII in store keys.
    ///
    /// This only matters for [`KeyHashing::None`], as all digests are ASCII already.
    pub ascii_only: bool,
}

/// The stale namespace, used to serve expired values while a refresh is in flight.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StaleCacheConfig {
    /// Write and consult the stale namespace.
    pub enabled: bool,
    /// How much longer than the primary TTL a stale value is kept.
    #[serde(with = "humantime_serde")]
    pub additional_ttl: Duration,
    /// Prefix of the stale store keys, prepended to the canonical key.
    pub prefix: String,
    /// Timeout for lookups in the stale namespace.
    #[serde(with = "humantime_serde")]
    pub get_timeout: Duration,
}

impl Default for StaleCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            additional_ttl: Duration::from_secs(600),
            prefix: "stale".into(),
            get_timeout: Duration::from_secs(1),
        }
    }
}

/// Fine-tuning of the cluster topology watcher.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TopologyConfig {
    /// Time between two topology polls.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Time before the first topology poll.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// How long a replaced backend is kept alive so that in-flight operations can drain.
    #[serde(with = "humantime_serde")]
    pub retirement_delay: Duration,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            initial_delay: Duration::ZERO,
            retirement_delay: Duration::from_secs(10),
        }
    }
}

/// Configuration of the [`CacheEngine`](super::CacheEngine).
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// The initial backend hosts, as a `host:port,host:port` list.
    ///
    /// Hosts without a port use `11211`.
    pub hosts: String,

    /// Default time-to-live of primary values.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Timeout for primary lookups. A timeout is treated as a miss.
    #[serde(with = "humantime_serde")]
    pub get_timeout: Duration,

    /// Wait for the store to acknowledge writes before resolving waiters.
    ///
    /// Otherwise writes are fire-and-forget.
    pub wait_for_set: bool,

    /// Upper bound for writes to the store.
    #[serde(with = "humantime_serde")]
    pub set_timeout: Duration,

    /// Wait for the store to acknowledge removals.
    pub wait_for_remove: bool,

    /// Upper bound for removals from the store.
    #[serde(with = "humantime_serde")]
    pub remove_timeout: Duration,

    /// Allow [`clear`](super::ClearableCache::clear) to flush the whole remote store.
    pub allow_flush: bool,

    /// Remove a finished computation from the in-flight registry before writing its value.
    ///
    /// When `true`, a miss arriving while the write is still in progress starts a new
    /// computation right away. When `false`, that miss joins the finishing computation instead.
    pub remove_in_flight_before_set: bool,

    /// Key canonicalization.
    pub keys: KeyConfig,

    /// The stale namespace.
    pub stale: StaleCacheConfig,

    /// The cluster topology watcher.
    pub topology: TopologyConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hosts: "localhost:11211".into(),
            ttl: Duration::from_secs(60),
            get_timeout: Duration::from_millis(2500),
            wait_for_set: false,
            set_timeout: Duration::from_secs(2),
            wait_for_remove: false,
            remove_timeout: Duration::from_secs(2),
            allow_flush: false,
            remove_in_flight_before_set: false,
            keys: KeyConfig::default(),
            stale: StaleCacheConfig::default(),
            topology: TopologyConfig::default(),
        }
    }
}

impl CacheConfig {
    /// The TTL of stale values for a primary `ttl`.
    pub fn stale_ttl(&self, ttl: Duration) -> Duration {
        ttl.saturating_add(self.stale.additional_ttl)
    }
}
