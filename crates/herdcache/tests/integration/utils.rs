use std::sync::{Arc, Mutex};
use std::time::Duration;

use herdcache::caching::{CacheConfig, CacheEngine, JsonCodec};
use herdcache::store::InMemoryStoreFactory;
use herdcache::topology::{ClientClusterUpdateObserver, TopologyGeneration};
use tokio::runtime::Handle;

pub use herdcache_test as test;

/// Setup tests and create a cache engine connected to in-memory stores.
///
/// Returns the engine along with the factory creating its stores. The factory keeps every store
/// it created, so tests can inspect the stores of earlier topology generations.
///
/// The `update_config` closure can modify any default configuration if needed before the engine
/// connects.
pub fn setup_cache(
    update_config: impl FnOnce(&mut CacheConfig),
) -> (CacheEngine<String>, Arc<InMemoryStoreFactory>) {
    test::setup();

    let mut config = CacheConfig::default();
    update_config(&mut config);

    let factory = Arc::new(InMemoryStoreFactory::new());
    let engine = CacheEngine::connect(
        config,
        &*factory,
        Arc::new(JsonCodec::new()),
        Handle::current(),
    )
    .unwrap();

    (engine, factory)
}

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Records the versions of all topology generations it is notified about.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    versions: Mutex<Vec<u64>>,
}

impl RecordingObserver {
    pub fn versions(&self) -> Vec<u64> {
        self.versions.lock().unwrap().clone()
    }
}

impl ClientClusterUpdateObserver for RecordingObserver {
    fn topology_updated(&self, generation: &TopologyGeneration) {
        self.versions.lock().unwrap().push(generation.version());
    }
}
