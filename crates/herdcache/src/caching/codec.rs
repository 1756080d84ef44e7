use std::marker::PhantomData;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::cache_entry::CacheEntry;
use super::cache_error::CacheResult;

/// Turns cache entries into bytes for the remote store, and back.
pub trait Codec<V>: Send + Sync + 'static {
    fn encode(&self, entry: &CacheEntry<V>) -> CacheResult<Bytes>;

    fn decode(&self, bytes: &[u8]) -> CacheResult<CacheEntry<V>>;
}

/// A [`Codec`] storing entries as JSON.
pub struct JsonCodec<V> {
    _value: PhantomData<fn() -> V>,
}

impl<V> JsonCodec<V> {
    pub fn new() -> Self {
        Self {
            _value: PhantomData,
        }
    }
}

impl<V> Default for JsonCodec<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> std::fmt::Debug for JsonCodec<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonCodec").finish()
    }
}

impl<V> Codec<V> for JsonCodec<V>
where
    V: Serialize + DeserializeOwned + 'static,
{
    fn encode(&self, entry: &CacheEntry<V>) -> CacheResult<Bytes> {
        Ok(serde_json::to_vec(entry)?.into())
    }

    fn decode(&self, bytes: &[u8]) -> CacheResult<CacheEntry<V>> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
