use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A value as it is stored in the remote store, along with its creation date.
///
/// A cache entry is never mutated. When `is_fallback` is set, the value was substituted for a
/// failed computation, and [`is_usable`](Self::is_usable) decides whether it may be served from
/// the cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    value: T,
    created: DateTime<Utc>,
    #[serde(default)]
    is_fallback: bool,
    #[serde(default = "default_check")]
    check_for_cached_item_when_fallback: bool,
}

fn default_check() -> bool {
    true
}

impl<T> CacheEntry<T> {
    /// Creates a regular entry created right now.
    pub fn new(value: T) -> Self {
        Self::with_created(value, Utc::now())
    }

    /// Creates a regular entry with an explicit creation date.
    pub fn with_created(value: T, created: DateTime<Utc>) -> Self {
        Self {
            value,
            created,
            is_fallback: false,
            check_for_cached_item_when_fallback: true,
        }
    }

    /// Creates a fallback entry which defers to a real cached value.
    pub fn fallback(value: T) -> Self {
        Self::fallback_with_check(value, true)
    }

    /// Creates a fallback entry.
    ///
    /// If `check_for_cached_item` is `false`, the fallback is served like a regular value.
    pub fn fallback_with_check(value: T, check_for_cached_item: bool) -> Self {
        Self {
            value,
            created: Utc::now(),
            is_fallback: true,
            check_for_cached_item_when_fallback: check_for_cached_item,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn is_fallback(&self) -> bool {
        self.is_fallback
    }

    pub fn check_for_cached_item_when_fallback(&self) -> bool {
        self.check_for_cached_item_when_fallback
    }

    /// Whether this entry may be served as a cached value.
    ///
    /// Fallback entries that ask to check for a real cached value are treated as misses.
    pub fn is_usable(&self) -> bool {
        !(self.is_fallback && self.check_for_cached_item_when_fallback)
    }

    /// Whether the entry is younger than `ttl`.
    pub fn is_live(&self, ttl: Duration) -> bool {
        self.is_live_at(ttl, Utc::now())
    }

    /// Whether the entry is at least `ttl` old.
    pub fn has_expired(&self, ttl: Duration) -> bool {
        !self.is_live(ttl)
    }

    fn is_live_at(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            // Out of range for chrono, which is effectively forever.
            return true;
        };
        match self.created.checked_add_signed(ttl) {
            Some(expires) => now < expires,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regular_entries_always_check() {
        let entry = CacheEntry::new(42);
        assert!(!entry.is_fallback());
        assert!(entry.check_for_cached_item_when_fallback());
        assert!(entry.is_usable());
    }

    #[test]
    fn test_fallback_entries() {
        let entry = CacheEntry::fallback("placeholder");
        assert!(entry.is_fallback());
        assert!(!entry.is_usable());

        let entry = CacheEntry::fallback_with_check("placeholder", false);
        assert!(entry.is_usable());
    }

    #[test]
    fn test_liveness() {
        let created = Utc::now() - chrono::Duration::seconds(10);
        let entry = CacheEntry::with_created((), created);

        assert!(entry.is_live(Duration::from_secs(60)));
        assert!(entry.has_expired(Duration::from_secs(5)));

        let now = created + chrono::Duration::seconds(5);
        assert!(!entry.is_live_at(Duration::from_secs(5), now));
        assert!(entry.is_live_at(Duration::MAX, now));
    }

    #[test]
    fn test_missing_flags_default() {
        let json = r#"{"value":"v","created":"2024-01-01T00:00:00Z"}"#;
        let entry: CacheEntry<String> = serde_json::from_str(json).unwrap();
        assert!(!entry.is_fallback());
        assert!(entry.check_for_cached_item_when_fallback());
        assert!(entry.is_usable());
    }
}
