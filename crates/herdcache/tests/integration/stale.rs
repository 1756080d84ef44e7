use std::time::Duration;

use futures::future::join_all;
use herdcache::config::Config;
use herdcache::topology::HostDescriptor;

use crate::{ms, setup_cache, test::ComputationCounter};

#[tokio::test(start_paused = true)]
async fn test_stale_values_absorb_the_herd() {
    let (engine, _factory) = setup_cache(|config| {
        config.ttl = Duration::from_secs(5);
        config.stale.enabled = true;
        config.stale.additional_ttl = Duration::from_secs(30);
    });
    let counter = ComputationCounter::new();

    let value = engine
        .apply("popular", counter.returning("V1".to_owned(), ms(100)))
        .await
        .await
        .unwrap();
    assert_eq!(value, "V1");

    tokio::time::sleep(Duration::from_secs(6)).await;

    let handles = join_all(
        (0..50).map(|_| engine.apply("popular", counter.returning("V2".to_owned(), ms(1000)))),
    )
    .await;

    // a single caller waits for the refresh, everybody else is served the stale value
    let (pending, ready): (Vec<_>, Vec<_>) =
        handles.into_iter().partition(|handle| !handle.is_ready());
    assert_eq!(pending.len(), 1);
    assert_eq!(ready.len(), 49);
    for result in join_all(ready).await {
        assert_eq!(result.unwrap(), "V1");
    }
    for result in join_all(pending).await {
        assert_eq!(result.unwrap(), "V2");
    }

    tokio::time::sleep(ms(10)).await;
    let handle = engine
        .apply("popular", counter.returning("V3".to_owned(), ms(1000)))
        .await;
    assert!(handle.is_ready());
    assert_eq!(handle.await.unwrap(), "V2");
    assert_eq!(counter.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_configured_keys() {
    let yaml = r#"
        cache:
          hosts: "cache-1:11212"
          wait_for_set: true
          keys:
            hashing: xxh3
            prefix: "app:"
          stale:
            enabled: true
            prefix: "old:"
    "#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    let (engine, factory) = setup_cache(|cache| *cache = config.cache);

    assert_eq!(
        engine.backend().generation().hosts(),
        [HostDescriptor::new("cache-1", 11212)]
    );

    engine.set("user:1", "Jane".to_owned(), None).await;

    let key = engine.canonical_key("user:1");
    assert!(key.as_str().starts_with("app:"));
    assert_eq!(key.as_str().len(), "app:".len() + 16);

    let store = factory.latest().unwrap();
    assert!(store.contains(&key));
    assert!(store.contains(&key.stale("old:")));

    let cached = engine.get("user:1").await.await.unwrap();
    assert_eq!(cached.as_deref(), Some("Jane"));
}
