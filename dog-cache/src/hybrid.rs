//! Local cache kept coherent across processes by invalidation broadcasts.
//!
//! Every process holds its own [`InMemoryCache`]. Writes go to the local
//! copy, to the shared backend when one is configured, and then an
//! [`InvalidationMessage`] tells every other process to drop its local copy.
//! Reads never cross processes: a stale local value can be observed until
//! the broadcast arrives, bounded by the bus latency.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use chrono::Utc;
use dog_core::{
    publish_message, subscribe_message, DogConfigSnapshot, JsonSerializer, MessageBus, Serializer,
    Subscription,
};
use futures::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use crate::{Cache, CacheResult, CacheValue, InMemoryCache, InMemoryCacheOptions};

pub const INVALIDATION_TOPIC: &str = "dog.cache.invalidate";

/// Broadcast whenever a hybrid-cache key is written or removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub keys: Vec<String>,
    pub flush_all: bool,
    pub origin_id: String,
}

/// Configuration for [`HybridCache`]
#[derive(Debug, Clone)]
pub struct HybridCacheOptions {
    /// Topic invalidations travel on
    pub topic: String,
    /// Upper bound on local entries
    pub local_max_items: Option<usize>,
    /// TTL for values copied from the shared backend that have none
    pub local_ttl: Option<Duration>,
}

impl Default for HybridCacheOptions {
    fn default() -> Self {
        Self {
            topic: INVALIDATION_TOPIC.to_string(),
            local_max_items: None,
            local_ttl: None,
        }
    }
}

impl HybridCacheOptions {
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_local_max_items(mut self, max_items: usize) -> Self {
        self.local_max_items = Some(max_items);
        self
    }

    pub fn with_local_ttl(mut self, ttl: Duration) -> Self {
        self.local_ttl = Some(ttl);
        self
    }

    /// Read `{prefix}.topic`, `{prefix}.local_max_items`, `{prefix}.local_ttl_ms`
    pub fn from_config(config: &DogConfigSnapshot, prefix: &str) -> Self {
        let defaults = Self::default();
        Self {
            topic: config
                .get_string(&format!("{prefix}.topic"))
                .unwrap_or(defaults.topic),
            local_max_items: config.get_usize(&format!("{prefix}.local_max_items")),
            local_ttl: config.get_duration_ms(&format!("{prefix}.local_ttl_ms")),
        }
    }
}

#[derive(Default)]
struct HybridCounters {
    local_hits: AtomicU64,
    shared_hits: AtomicU64,
    misses: AtomicU64,
    invalidations_received: AtomicU64,
    /// Bumped before every received invalidation is applied
    generation: AtomicU64,
}

/// Snapshot of [`HybridCache`] counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HybridCacheStats {
    pub local_hits: u64,
    pub shared_hits: u64,
    pub misses: u64,
    pub invalidations_received: u64,
}

/// Per-process cache with cross-process invalidation
pub struct HybridCache<S: Serializer = JsonSerializer> {
    origin_id: String,
    local: InMemoryCache,
    shared: Option<Arc<dyn Cache>>,
    bus: Arc<dyn MessageBus>,
    serializer: S,
    options: HybridCacheOptions,
    counters: Arc<HybridCounters>,
    subscription: Mutex<Option<Subscription>>,
}

impl HybridCache<JsonSerializer> {
    /// Connect with the JSON serializer
    pub async fn connect(
        bus: Arc<dyn MessageBus>,
        shared: Option<Arc<dyn Cache>>,
        options: HybridCacheOptions,
    ) -> CacheResult<Self> {
        Self::connect_with_serializer(bus, shared, options, JsonSerializer).await
    }
}

impl<S: Serializer> HybridCache<S> {
    /// Create the local cache and start listening for invalidations
    pub async fn connect_with_serializer(
        bus: Arc<dyn MessageBus>,
        shared: Option<Arc<dyn Cache>>,
        options: HybridCacheOptions,
        serializer: S,
    ) -> CacheResult<Self> {
        let origin_id = Uuid::new_v4().to_string();
        let local = InMemoryCache::with_options(InMemoryCacheOptions {
            max_items: options.local_max_items,
        });
        let counters = Arc::new(HybridCounters::default());

        let subscription = {
            let local = local.clone();
            let counters = counters.clone();
            let own_origin = origin_id.clone();
            subscribe_message(
                bus.as_ref(),
                serializer.clone(),
                &options.topic,
                move |message: InvalidationMessage| -> BoxFuture<'static, anyhow::Result<()>> {
                    let local = local.clone();
                    let counters = counters.clone();
                    let own_origin = own_origin.clone();
                    async move {
                        if message.origin_id == own_origin {
                            trace!("ignoring own invalidation");
                            return Ok(());
                        }
                        counters.generation.fetch_add(1, Ordering::SeqCst);
                        if message.flush_all {
                            let removed = local.flush().await?;
                            debug!(origin = %message.origin_id, removed, "flushed local cache");
                        } else {
                            let removed = local.remove_all(&message.keys).await?;
                            debug!(origin = %message.origin_id, keys = ?message.keys, removed, "invalidated local keys");
                        }
                        counters.invalidations_received.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    .boxed()
                },
            )
            .await?
        };

        Ok(Self {
            origin_id,
            local,
            shared,
            bus,
            serializer,
            options,
            counters,
            subscription: Mutex::new(Some(subscription)),
        })
    }

    /// Identifier stamped on invalidations sent by this instance
    pub fn origin_id(&self) -> &str {
        &self.origin_id
    }

    /// The process-local layer
    pub fn local(&self) -> &InMemoryCache {
        &self.local
    }

    pub fn stats(&self) -> HybridCacheStats {
        HybridCacheStats {
            local_hits: self.counters.local_hits.load(Ordering::Relaxed),
            shared_hits: self.counters.shared_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            invalidations_received: self.counters.invalidations_received.load(Ordering::Relaxed),
        }
    }

    /// Read `key` locally, falling through to the shared backend on a miss
    pub async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        if let Some(found) = self.local.get(key).await? {
            self.counters.local_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(found.value));
        }

        let Some(shared) = &self.shared else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let generation = self.counters.generation.load(Ordering::SeqCst);
        match shared.get(key).await? {
            Some(found) => {
                self.counters.shared_hits.fetch_add(1, Ordering::Relaxed);
                self.populate_local(key, &found, generation).await?;
                Ok(Some(found.value))
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(self.serializer.from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write `key` everywhere and tell other processes to drop their copy
    #[instrument(skip(self, value), fields(origin = %self.origin_id))]
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        self.local.set(key, value.clone(), ttl).await?;
        if let Some(shared) = &self.shared {
            shared.set(key, value, ttl).await?;
        }
        self.broadcast(vec![key.to_string()], false).await
    }

    pub async fn set_as<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let bytes = self.serializer.to_bytes(value)?;
        self.set(key, bytes, ttl).await
    }

    #[instrument(skip(self), fields(origin = %self.origin_id))]
    pub async fn remove(&self, key: &str) -> CacheResult<bool> {
        let mut removed = self.local.remove(key).await?;
        if let Some(shared) = &self.shared {
            removed |= shared.remove(key).await?;
        }
        self.broadcast(vec![key.to_string()], false).await?;
        Ok(removed)
    }

    pub async fn remove_all(&self, keys: &[String]) -> CacheResult<usize> {
        let mut removed = self.local.remove_all(keys).await?;
        if let Some(shared) = &self.shared {
            removed = removed.max(shared.remove_all(keys).await?);
        }
        self.broadcast(keys.to_vec(), false).await?;
        Ok(removed)
    }

    /// Clear every layer and every other process' local cache
    #[instrument(skip(self), fields(origin = %self.origin_id))]
    pub async fn flush(&self) -> CacheResult<()> {
        self.local.flush().await?;
        if let Some(shared) = &self.shared {
            shared.flush().await?;
        }
        self.broadcast(Vec::new(), true).await
    }

    /// Copy a shared read into the local layer unless an invalidation
    /// arrived while it was in flight.
    ///
    /// The generation is checked again after the write: an invalidation
    /// applied between the two checks would have missed the new local copy.
    async fn populate_local(&self, key: &str, found: &CacheValue, generation: u64) -> CacheResult<()> {
        if self.counters.generation.load(Ordering::SeqCst) != generation {
            trace!(key, "invalidated during shared read, local copy skipped");
            return Ok(());
        }
        let ttl = found.remaining(Utc::now()).or(self.options.local_ttl);
        self.local.set(key, found.value.clone(), ttl).await?;
        if self.counters.generation.load(Ordering::SeqCst) != generation {
            self.local.remove(key).await?;
        }
        Ok(())
    }

    /// Stop listening for invalidations
    pub fn close(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
        }
    }

    async fn broadcast(&self, keys: Vec<String>, flush_all: bool) -> CacheResult<()> {
        let message = InvalidationMessage {
            keys,
            flush_all,
            origin_id: self.origin_id.clone(),
        };
        publish_message(self.bus.as_ref(), &self.serializer, &self.options.topic, &message).await?;
        Ok(())
    }
}
