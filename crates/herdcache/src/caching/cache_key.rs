use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use super::config::KeyConfig;

/// The algorithm used to turn logical keys into fixed-length store keys.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KeyHashing {
    /// Use the logical key as-is.
    None,
    /// Lowercase hex SHA-1 digest.
    Sha1Lower,
    /// Uppercase hex SHA-1 digest.
    Sha1Upper,
    /// Lowercase hex SHA-256 digest.
    #[default]
    Sha256Lower,
    /// Uppercase hex SHA-256 digest.
    Sha256Upper,
    /// Lowercase hex XXH3 (64 bit) digest.
    Xxh3,
}

impl KeyHashing {
    fn hash(self, key: &str) -> Option<String> {
        match self {
            KeyHashing::None => None,
            KeyHashing::Sha1Lower => Some(hex::encode(Sha1::digest(key))),
            KeyHashing::Sha1Upper => Some(hex::encode_upper(Sha1::digest(key))),
            KeyHashing::Sha256Lower => Some(hex::encode(Sha256::digest(key))),
            KeyHashing::Sha256Upper => Some(hex::encode_upper(Sha256::digest(key))),
            KeyHashing::Xxh3 => {
                let digest = xxhash_rust::xxh3::xxh3_64(key.as_bytes());
                Some(format!("{digest:016x}"))
            }
        }
    }
}

/// A canonical key as it is sent to the remote store.
///
/// Produced by a [`KeyHasher`], two equal logical keys always map to equal [`CacheKey`]s.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The key of the stale copy of this entry.
    pub fn stale(&self, prefix: &str) -> CacheKey {
        CacheKey(format!("{prefix}{}", self.0).into())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Canonicalizes logical keys according to a [`KeyConfig`].
///
/// The logical key is first hashed, then the configured prefix is prepended. A prefix thus
/// namespaces keys without being part of the digest. With `ascii_only`, the prefix is escaped
/// just like unhashed keys.
#[derive(Clone, Debug)]
pub struct KeyHasher {
    hashing: KeyHashing,
    prefix: Option<Arc<str>>,
    ascii_only: bool,
}

impl KeyHasher {
    pub fn new(config: &KeyConfig) -> Self {
        Self {
            hashing: config.hashing,
            prefix: config
                .prefix
                .as_deref()
                .filter(|prefix| !prefix.is_empty())
                .map(|prefix| match config.ascii_only {
                    true => Arc::from(escape_non_ascii(prefix)),
                    false => Arc::from(prefix),
                }),
            ascii_only: config.ascii_only,
        }
    }

    pub fn canonicalize(&self, key: &str) -> CacheKey {
        let body = match self.hashing.hash(key) {
            Some(digest) => digest,
            None if self.ascii_only => escape_non_ascii(key),
            None => key.to_owned(),
        };
        let key = match self.prefix {
            Some(ref prefix) => format!("{prefix}{body}"),
            None => body,
        };
        CacheKey(key.into())
    }
}

/// Percent-escapes every byte that is not a printable ASCII character, and `%` itself.
fn escape_non_ascii(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        if c.is_ascii_graphic() && c != '%' {
            out.push(c);
            continue;
        }
        let mut buf = [0; 4];
        for b in c.encode_utf8(&mut buf).bytes() {
            out.push('%');
            out.push_str(&hex::encode_upper([b]));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher(hashing: KeyHashing, prefix: Option<&str>, ascii_only: bool) -> KeyHasher {
        KeyHasher::new(&KeyConfig {
            hashing,
            prefix: prefix.map(Into::into),
            ascii_only,
        })
    }

    #[test]
    fn test_digests() {
        let key = "user:1234";

        let sha256 = hasher(KeyHashing::Sha256Lower, None, false).canonicalize(key);
        assert_eq!(sha256.as_str().len(), 64);
        assert_eq!(sha256.as_str(), sha256.as_str().to_ascii_lowercase());

        let upper = hasher(KeyHashing::Sha256Upper, None, false).canonicalize(key);
        assert_eq!(upper.as_str(), sha256.as_str().to_ascii_uppercase());

        let sha1 = hasher(KeyHashing::Sha1Lower, None, false).canonicalize("abc");
        assert_eq!(sha1.as_str(), "a9993e364706816aba3e25717850c26c9cd0d89d");
        let sha1 = hasher(KeyHashing::Sha1Upper, None, false).canonicalize("abc");
        assert_eq!(sha1.as_str(), "A9993E364706816ABA3E25717850C26C9CD0D89D");

        let xxh3 = hasher(KeyHashing::Xxh3, None, false).canonicalize(key);
        assert_eq!(xxh3.as_str().len(), 16);
    }

    #[test]
    fn test_equal_keys_collide() {
        let hasher = hasher(KeyHashing::Sha256Lower, Some("app:"), false);
        assert_eq!(hasher.canonicalize("a"), hasher.canonicalize("a"));
        assert_ne!(hasher.canonicalize("a"), hasher.canonicalize("b"));
    }

    #[test]
    fn test_prefix_is_not_hashed() {
        let key = hasher(KeyHashing::Sha256Lower, Some("app:"), false).canonicalize("a");
        let unprefixed = hasher(KeyHashing::Sha256Lower, None, false).canonicalize("a");
        assert_eq!(key.as_str(), format!("app:{unprefixed}"));
    }

    #[test]
    fn test_ascii_only() {
        let key = hasher(KeyHashing::None, None, true).canonicalize("grüße 100%");
        assert_eq!(key.as_str(), "gr%C3%BC%C3%9Fe%20100%25");

        let key = hasher(KeyHashing::None, None, false).canonicalize("grüße");
        assert_eq!(key.as_str(), "grüße");
    }

    #[test]
    fn test_ascii_only_prefix() {
        let key = hasher(KeyHashing::Sha1Lower, Some("café:"), true).canonicalize("abc");
        assert_eq!(
            key.as_str(),
            "caf%C3%A9:a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert!(key.as_str().bytes().all(|b| b.is_ascii_graphic()));

        let key = hasher(KeyHashing::None, Some("café:"), false).canonicalize("abc");
        assert_eq!(key.as_str(), "café:abc");
    }

    #[test]
    fn test_stale_key() {
        let key = hasher(KeyHashing::None, Some("app:"), false).canonicalize("a");
        assert_eq!(key.stale("stale").as_str(), "staleapp:a");
    }
}
