use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dog_core::Serializer;
use serde::{de::DeserializeOwned, Serialize};

use crate::CacheResult;

/// A value read from a cache together with its absolute expiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheValue {
    pub value: Vec<u8>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheValue {
    /// Time left before the value expires, `None` when it never expires
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Cache boundary shared by every backend.
///
/// Every conditional operation is atomic against every other operation on
/// the same key: lock and throttling providers rely on that, never on
/// read-then-write sequences. A `ttl` of `None` stores the value without
/// expiration.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Read a live value
    async fn get(&self, key: &str) -> CacheResult<Option<CacheValue>>;

    /// Create `key` only if it is absent (conditional create)
    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<bool>;

    /// Create or overwrite `key`
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()>;

    /// Overwrite `key` only if it currently holds `expected` (compare-and-swap)
    async fn replace_if_equal(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> CacheResult<bool>;

    /// Delete `key` only if it currently holds `expected` (conditional delete)
    async fn remove_if_equal(&self, key: &str, expected: &[u8]) -> CacheResult<bool>;

    /// Atomically add `by` to the integer at `key`, creating it at `by`.
    ///
    /// A `ttl` given here (re)sets the expiry of the counter.
    async fn increment(&self, key: &str, by: i64, ttl: Option<Duration>) -> CacheResult<i64>;

    /// Delete `key`, returning whether it existed
    async fn remove(&self, key: &str) -> CacheResult<bool>;

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Remaining time to live of `key`
    async fn get_expiration(&self, key: &str) -> CacheResult<Option<Duration>>;

    /// Change the expiry of an existing key
    async fn set_expiration(&self, key: &str, ttl: Duration) -> CacheResult<bool>;

    /// Delete many keys, returning how many existed
    async fn remove_all(&self, keys: &[String]) -> CacheResult<usize>;

    async fn remove_by_prefix(&self, prefix: &str) -> CacheResult<usize>;

    /// Delete everything
    async fn flush(&self) -> CacheResult<usize>;
}

/// Read and decode a typed value.
pub async fn get_as<T, S>(cache: &dyn Cache, serializer: &S, key: &str) -> CacheResult<Option<T>>
where
    T: DeserializeOwned,
    S: Serializer,
{
    match cache.get(key).await? {
        Some(found) => Ok(Some(serializer.from_bytes(&found.value)?)),
        None => Ok(None),
    }
}

/// Encode and store a typed value.
pub async fn set_as<T, S>(
    cache: &dyn Cache,
    serializer: &S,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> CacheResult<()>
where
    T: Serialize + ?Sized,
    S: Serializer,
{
    let bytes = serializer.to_bytes(value)?;
    cache.set(key, bytes, ttl).await
}
