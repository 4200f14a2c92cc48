//! dog-cache: the cache boundary used by DogRS coordination primitives.
//!
//! [`Cache`] exposes the atomic conditional operations (`add`,
//! `replace_if_equal`, `remove_if_equal`, `increment`) that locks and
//! throttles are built on. [`InMemoryCache`] is the process-local backend;
//! [`HybridCache`] layers a local cache over a shared one and keeps peers
//! coherent with invalidation messages.
//!
//! ```
//! use dog_cache::{Cache, InMemoryCache};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let cache = InMemoryCache::new();
//! assert!(cache.add("lock:report", b"token-a".to_vec(), Some(Duration::from_secs(30))).await?);
//! assert!(!cache.add("lock:report", b"token-b".to_vec(), None).await?);
//! assert!(cache.remove_if_equal("lock:report", b"token-a").await?);
//! # Ok::<(), dog_cache::CacheError>(())
//! # }).unwrap();
//! ```

mod error;
mod hybrid;
mod memory;
mod traits;

pub use error::{CacheError, CacheResult};
pub use hybrid::{
    HybridCache, HybridCacheOptions, HybridCacheStats, InvalidationMessage, INVALIDATION_TOPIC,
};
pub use memory::{CacheStats, EntryMetadata, InMemoryCache, InMemoryCacheOptions};
pub use traits::{get_as, set_as, Cache, CacheValue};
