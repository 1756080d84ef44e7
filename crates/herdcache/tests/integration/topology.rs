use std::sync::Arc;
use std::time::Duration;

use herdcache::caching::{CacheError, RequiresShutdown};
use herdcache::topology::{StaticTopologySource, TickOutcome, parse_hosts};

use crate::{RecordingObserver, ms, setup_cache, test::ComputationCounter};

/// Requests issued before a topology change complete against the previous store, while
/// everything started afterwards uses the new one.
#[tokio::test(start_paused = true)]
async fn test_swap_while_requests_in_flight() {
    let (engine, factory) = setup_cache(|config| {
        config.hosts = "cache-1".to_owned();
        config.wait_for_set = true;
        config.topology.retirement_delay = Duration::from_secs(10);
    });
    let counter = ComputationCounter::new();
    let observer = Arc::new(RecordingObserver::default());

    let old = factory.latest().unwrap();
    old.set_latency(ms(500));

    let source = Arc::new(StaticTopologySource::parse("cache-1").unwrap());
    let watcher = engine
        .topology_watcher(source.clone(), factory.clone())
        .with_observer(observer.clone());

    // the lookup of this request is still running on the old store during the swap
    let request = tokio::spawn({
        let engine = engine.clone();
        let computation = counter.returning("v".to_owned(), ms(100));
        async move { engine.apply("k", computation).await.await }
    });

    tokio::time::sleep(ms(100)).await;
    source.set_hosts(parse_hosts("cache-2").unwrap());
    let generation = match watcher.tick().await {
        TickOutcome::Swapped(generation) => generation,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert_eq!(generation.version(), 1);
    assert_eq!(engine.backend().generation().version(), 1);
    assert_eq!(observer.versions(), [1]);

    let new = factory.latest().unwrap();
    assert!(!Arc::ptr_eq(&old, &new));

    assert_eq!(request.await.unwrap().unwrap(), "v");
    assert_eq!(old.get_count(), 1);
    assert!(!old.is_closed());

    // the value was written after the swap, and thus ended up in the new store
    let key = engine.canonical_key("k");
    assert!(new.contains(&key));
    assert!(!old.contains(&key));
    assert_eq!(engine.get("k").await.await.unwrap().as_deref(), Some("v"));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(old.is_closed());
    assert!(!new.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_background_watcher() {
    let (engine, factory) = setup_cache(|config| {
        config.wait_for_set = true;
        config.topology.poll_interval = Duration::from_secs(1);
        config.topology.retirement_delay = Duration::from_secs(1);
    });
    let observer = Arc::new(RecordingObserver::default());

    let source = Arc::new(StaticTopologySource::parse(&engine.config().hosts).unwrap());
    let watcher = engine
        .topology_watcher(source.clone(), factory.clone())
        .with_observer(observer.clone());
    engine.start_watcher(watcher);

    engine.set("k", "v".to_owned(), None).await;

    // polls at 0s and 1s, both unchanged
    tokio::time::sleep(ms(1500)).await;
    assert_eq!(source.poll_count(), 2);
    assert!(observer.versions().is_empty());

    // the poll at 2s picks up the change
    source.set_hosts(parse_hosts("cache-1,cache-2").unwrap());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(observer.versions(), [1]);
    assert_eq!(factory.stores().len(), 2);
    assert_eq!(engine.backend().generation().hosts().len(), 2);

    // the new cluster starts out empty
    assert_eq!(engine.get("k").await.await.unwrap(), None);

    // failing polls keep the active store
    source.set_failing(true);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(engine.backend().generation().version(), 1);
    assert!(factory.stores()[0].is_closed());

    engine.shutdown().await;
    assert!(factory.latest().unwrap().is_closed());

    let polls = source.poll_count();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(source.poll_count(), polls);

    let result = engine.get("k").await.await;
    assert!(matches!(result, Err(CacheError::Shutdown)));
}

#[tokio::test(start_paused = true)]
async fn test_failed_connect_keeps_store() {
    let (engine, factory) = setup_cache(|config| {
        config.wait_for_set = true;
    });
    let source = Arc::new(StaticTopologySource::parse("cache-3").unwrap());
    let watcher = engine.topology_watcher(source, factory.clone());

    factory.set_failing(true);
    match watcher.tick().await {
        TickOutcome::Failed(CacheError::StoreUnavailable(_)) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(engine.backend().generation().version(), 0);
    assert_eq!(factory.stores().len(), 1);

    engine.set("k", "v".to_owned(), None).await;
    assert_eq!(engine.get("k").await.await.unwrap().as_deref(), Some("v"));

    // the next successful poll swaps
    factory.set_failing(false);
    assert!(matches!(watcher.tick().await, TickOutcome::Swapped(_)));
    assert!(matches!(watcher.tick().await, TickOutcome::Unchanged));
    assert_eq!(engine.backend().generation().version(), 1);
}
