use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dog_cache::{
    Cache, CacheResult, CacheValue, HybridCache, HybridCacheOptions, InMemoryCache, InvalidationMessage,
};
use dog_core::{publish_message, InMemoryMessageBus, JsonSerializer, MessageBus};

/// Shared backend whose reads take `delay` to come back
struct SlowReads {
    inner: InMemoryCache,
    delay: Duration,
}

#[async_trait]
impl Cache for SlowReads {
    async fn get(&self, key: &str) -> CacheResult<Option<CacheValue>> {
        let found = self.inner.get(key).await?;
        tokio::time::sleep(self.delay).await;
        Ok(found)
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<bool> {
        self.inner.add(key, value, ttl).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        self.inner.set(key, value, ttl).await
    }

    async fn replace_if_equal(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        self.inner.replace_if_equal(key, expected, value, ttl).await
    }

    async fn remove_if_equal(&self, key: &str, expected: &[u8]) -> CacheResult<bool> {
        self.inner.remove_if_equal(key, expected).await
    }

    async fn increment(&self, key: &str, by: i64, ttl: Option<Duration>) -> CacheResult<i64> {
        self.inner.increment(key, by, ttl).await
    }

    async fn remove(&self, key: &str) -> CacheResult<bool> {
        self.inner.remove(key).await
    }

    async fn get_expiration(&self, key: &str) -> CacheResult<Option<Duration>> {
        self.inner.get_expiration(key).await
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.inner.set_expiration(key, ttl).await
    }

    async fn remove_all(&self, keys: &[String]) -> CacheResult<usize> {
        self.inner.remove_all(keys).await
    }

    async fn remove_by_prefix(&self, prefix: &str) -> CacheResult<usize> {
        self.inner.remove_by_prefix(prefix).await
    }

    async fn flush(&self) -> CacheResult<usize> {
        self.inner.flush().await
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Two processes sharing one bus and one shared backend
async fn two_processes() -> (HybridCache, HybridCache, InMemoryCache) {
    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryMessageBus::new());
    let shared = InMemoryCache::new();
    let a = HybridCache::connect(bus.clone(), Some(Arc::new(shared.clone())), HybridCacheOptions::default())
        .await
        .unwrap();
    let b = HybridCache::connect(bus, Some(Arc::new(shared.clone())), HybridCacheOptions::default())
        .await
        .unwrap();
    (a, b, shared)
}

/// H1. A Write Invalidates Peer Copies
#[tokio::test]
async fn test_write_invalidates_peer_copies() {
    let (a, b, _shared) = two_processes().await;

    // Arrange: both processes hold v1 locally
    a.set_as("k", "v1", None).await.unwrap();
    wait_until(|| b.stats().invalidations_received == 1).await;
    let seen: Option<String> = b.get_as("k").await.unwrap();
    assert_eq!(seen.as_deref(), Some("v1"));
    assert!(b.local().exists("k").await.unwrap());

    // Act: A overwrites
    a.set_as("k", "v2", None).await.unwrap();

    // Assert: B drops its copy and refetches the new value
    wait_until(|| b.stats().invalidations_received == 2).await;
    assert!(!b.local().exists("k").await.unwrap());
    let seen: Option<String> = b.get_as("k").await.unwrap();
    assert_eq!(seen.as_deref(), Some("v2"));
}

/// H2. Readers Never Regress After Invalidation
#[tokio::test]
async fn test_reader_never_returns_older_value_after_invalidation() {
    let (a, b, _shared) = two_processes().await;

    for round in 0..10u32 {
        a.set_as("counter", &round, None).await.unwrap();
        wait_until(|| b.stats().invalidations_received > u64::from(round)).await;
        let seen: Option<u32> = b.get_as("counter").await.unwrap();
        assert_eq!(seen, Some(round));
    }
}

/// H3. Removes Propagate
#[tokio::test]
async fn test_remove_propagates() {
    let (a, b, shared) = two_processes().await;

    a.set_as("k", "v1", None).await.unwrap();
    assert!(b.get("k").await.unwrap().is_some());

    assert!(a.remove("k").await.unwrap());

    wait_until(|| b.local().metadata("k").is_none()).await;
    assert!(b.get("k").await.unwrap().is_none());
    assert!(!shared.exists("k").await.unwrap());
}

/// H4. Flush Clears Every Local Cache
#[tokio::test]
async fn test_flush_clears_peer_local_caches() {
    let (a, b, _shared) = two_processes().await;

    for key in ["x", "y", "z"] {
        b.set_as(key, key, None).await.unwrap();
    }
    a.flush().await.unwrap();

    wait_until(|| b.local().stats().items == 0).await;
    assert!(b.get("x").await.unwrap().is_none());
}

/// H5. Foreign Messages With Our Origin Are Ignored
#[tokio::test]
async fn test_messages_with_own_origin_are_ignored() {
    let bus = InMemoryMessageBus::new();
    let cache = HybridCache::connect(Arc::new(bus.clone()), None, HybridCacheOptions::default())
        .await
        .unwrap();
    cache.set_as("k", "v", None).await.unwrap();

    let echo = InvalidationMessage {
        keys: vec!["k".to_string()],
        flush_all: false,
        origin_id: cache.origin_id().to_string(),
    };
    publish_message(&bus, &JsonSerializer, dog_cache::INVALIDATION_TOPIC, &echo)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(cache.local().exists("k").await.unwrap());
    assert_eq!(cache.stats().invalidations_received, 0);
}

/// H6. Closed Caches Stop Listening
#[tokio::test]
async fn test_close_stops_invalidation_delivery() {
    let bus = InMemoryMessageBus::new();
    let cache = HybridCache::connect(Arc::new(bus.clone()), None, HybridCacheOptions::default())
        .await
        .unwrap();
    assert_eq!(bus.subscriber_count(dog_cache::INVALIDATION_TOPIC), 1);

    cache.close();

    assert_eq!(bus.subscriber_count(dog_cache::INVALIDATION_TOPIC), 0);
}

/// H7. A Read In Flight During An Invalidation Leaves No Stale Copy
#[tokio::test]
async fn test_slow_shared_read_does_not_cache_invalidated_value() {
    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryMessageBus::new());
    let shared = InMemoryCache::new();
    shared.set("k", b"v0".to_vec(), None).await.unwrap();
    let a = HybridCache::connect(bus.clone(), Some(Arc::new(shared.clone())), HybridCacheOptions::default())
        .await
        .unwrap();
    let slow = SlowReads {
        inner: shared.clone(),
        delay: Duration::from_millis(100),
    };
    let b = Arc::new(
        HybridCache::connect(bus, Some(Arc::new(slow)), HybridCacheOptions::default())
            .await
            .unwrap(),
    );

    // Arrange: B starts reading v0 from the shared backend
    let reader = {
        let b = b.clone();
        tokio::spawn(async move { b.get("k").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Act: A writes while the read is still in flight
    a.set("k", b"v1".to_vec(), None).await.unwrap();
    wait_until(|| b.stats().invalidations_received == 1).await;
    let in_flight = reader.await.unwrap().unwrap();

    // Assert: the old value was returned once but never kept
    assert_eq!(in_flight, Some(b"v0".to_vec()));
    assert!(!b.local().exists("k").await.unwrap());
    assert_eq!(b.get("k").await.unwrap(), Some(b"v1".to_vec()));
}
