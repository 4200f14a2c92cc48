use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dog_core::DogConfigSnapshot;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::{Cache, CacheError, CacheResult, CacheValue};

/// Options for [`InMemoryCache`]
#[derive(Debug, Clone, Default)]
pub struct InMemoryCacheOptions {
    /// Evict least recently accessed entries beyond this many items
    pub max_items: Option<usize>,
}

impl InMemoryCacheOptions {
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = Some(max_items);
        self
    }

    /// Read `{prefix}.max_items`
    pub fn from_config(config: &DogConfigSnapshot, prefix: &str) -> Self {
        Self {
            max_items: config.get_usize(&format!("{prefix}.max_items")),
        }
    }
}

/// Bookkeeping kept for each stored entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMetadata {
    pub created_at: DateTime<Utc>,
    pub last_write_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Counters describing cache effectiveness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub items: usize,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    last_write_at: DateTime<Utc>,
    last_access_at: DateTime<Utc>,
}

impl CacheEntry {
    fn new(value: Vec<u8>, expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        Self {
            value,
            expires_at,
            created_at: now,
            last_write_at: now,
            last_access_at: now,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    fn write(&mut self, value: Vec<u8>, expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        self.value = value;
        self.expires_at = expires_at;
        self.last_write_at = now;
        self.last_access_at = now;
    }

    fn to_value(&self) -> CacheValue {
        CacheValue {
            value: self.value.clone(),
            expires_at: self.expires_at,
        }
    }
}

fn expiry(now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    let ttl = ttl?;
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
}

#[derive(Default)]
struct CacheInner {
    entries: Mutex<HashMap<String, CacheEntry>>,
    max_items: Option<usize>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
}

impl CacheInner {
    /// Returns the live entry for `key`, dropping it if it expired.
    fn live<'a>(
        entries: &'a mut HashMap<String, CacheEntry>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<&'a mut CacheEntry> {
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
            return None;
        }
        entries.get_mut(key)
    }

    fn insert(&self, entries: &mut HashMap<String, CacheEntry>, key: &str, entry: CacheEntry, now: DateTime<Utc>) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if let Some(existing) = entries.get_mut(key) {
            *existing = entry;
            return;
        }
        if let Some(max) = self.max_items {
            if entries.len() >= max {
                entries.retain(|_, e| !e.is_expired(now));
            }
            while entries.len() >= max.max(1) {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_access_at)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(victim) => {
                        trace!(key = %victim, "evicting least recently used entry");
                        entries.remove(&victim);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                    None => break,
                }
            }
        }
        entries.insert(key.to_string(), entry);
    }

    fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }
}

/// Process-local cache backend.
///
/// Clones share the same storage, so one instance can stand in for a
/// shared network cache across several simulated processes.
#[derive(Clone, Default)]
pub struct InMemoryCache {
    inner: Arc<CacheInner>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: InMemoryCacheOptions) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                max_items: options.max_items,
                ..CacheInner::default()
            }),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            items: self.inner.entries.lock().len(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            writes: self.inner.writes.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
        }
    }

    /// Bookkeeping for a live entry, without counting as an access
    pub fn metadata(&self, key: &str) -> Option<EntryMetadata> {
        let now = Utc::now();
        let mut entries = self.inner.entries.lock();
        CacheInner::live(&mut entries, key, now).map(|e| EntryMetadata {
            created_at: e.created_at,
            last_write_at: e.last_write_at,
            last_access_at: e.last_access_at,
            expires_at: e.expires_at,
        })
    }

    /// Drop expired entries now, returning how many were removed
    pub fn remove_expired(&self) -> usize {
        self.inner.sweep(Utc::now())
    }

    /// Sweep expired entries every `interval` until the cache is dropped.
    pub fn start_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let removed = inner.sweep(Utc::now());
                if removed > 0 {
                    debug!("Removed {} expired cache entries", removed);
                }
            }
        })
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<CacheValue>> {
        let now = Utc::now();
        let mut entries = self.inner.entries.lock();
        match CacheInner::live(&mut entries, key, now) {
            Some(entry) => {
                entry.last_access_at = now;
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.to_value()))
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<bool> {
        let now = Utc::now();
        let mut entries = self.inner.entries.lock();
        if CacheInner::live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        let entry = CacheEntry::new(value, expiry(now, ttl), now);
        self.inner.insert(&mut entries, key, entry, now);
        Ok(true)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        let now = Utc::now();
        let mut entries = self.inner.entries.lock();
        let expires_at = expiry(now, ttl);
        match CacheInner::live(&mut entries, key, now) {
            Some(entry) => {
                entry.write(value, expires_at, now);
                self.inner.writes.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                let entry = CacheEntry::new(value, expires_at, now);
                self.inner.insert(&mut entries, key, entry, now);
            }
        }
        Ok(())
    }

    async fn replace_if_equal(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let now = Utc::now();
        let mut entries = self.inner.entries.lock();
        match CacheInner::live(&mut entries, key, now) {
            Some(entry) if entry.value == expected => {
                entry.write(value, expiry(now, ttl), now);
                self.inner.writes.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove_if_equal(&self, key: &str, expected: &[u8]) -> CacheResult<bool> {
        let now = Utc::now();
        let mut entries = self.inner.entries.lock();
        match CacheInner::live(&mut entries, key, now) {
            Some(entry) if entry.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment(&self, key: &str, by: i64, ttl: Option<Duration>) -> CacheResult<i64> {
        let now = Utc::now();
        let mut entries = self.inner.entries.lock();
        let expires_at = expiry(now, ttl);
        match CacheInner::live(&mut entries, key, now) {
            Some(entry) => {
                let current = std::str::from_utf8(&entry.value)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| CacheError::NotANumber { key: key.to_string() })?;
                let next = current
                    .checked_add(by)
                    .ok_or_else(|| CacheError::Overflow { key: key.to_string() })?;
                let keep = if ttl.is_some() { expires_at } else { entry.expires_at };
                entry.write(next.to_string().into_bytes(), keep, now);
                self.inner.writes.fetch_add(1, Ordering::Relaxed);
                Ok(next)
            }
            None => {
                let entry = CacheEntry::new(by.to_string().into_bytes(), expires_at, now);
                self.inner.insert(&mut entries, key, entry, now);
                Ok(by)
            }
        }
    }

    async fn remove(&self, key: &str) -> CacheResult<bool> {
        let now = Utc::now();
        let mut entries = self.inner.entries.lock();
        Ok(matches!(entries.remove(key), Some(e) if !e.is_expired(now)))
    }

    async fn get_expiration(&self, key: &str) -> CacheResult<Option<Duration>> {
        let now = Utc::now();
        let mut entries = self.inner.entries.lock();
        Ok(CacheInner::live(&mut entries, key, now).and_then(|e| e.to_value().remaining(now)))
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let now = Utc::now();
        let mut entries = self.inner.entries.lock();
        match CacheInner::live(&mut entries, key, now) {
            Some(entry) => {
                entry.expires_at = expiry(now, Some(ttl));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_all(&self, keys: &[String]) -> CacheResult<usize> {
        let now = Utc::now();
        let mut entries = self.inner.entries.lock();
        let removed = keys
            .iter()
            .filter(|key| matches!(entries.remove(key.as_str()), Some(e) if !e.is_expired(now)))
            .count();
        Ok(removed)
    }

    async fn remove_by_prefix(&self, prefix: &str) -> CacheResult<usize> {
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - entries.len())
    }

    async fn flush(&self) -> CacheResult<usize> {
        let mut entries = self.inner.entries.lock();
        let removed = entries.len();
        entries.clear();
        Ok(removed)
    }
}
