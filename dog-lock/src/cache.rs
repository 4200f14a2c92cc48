//! Mutual-exclusion locks stored in a [`Cache`].
//!
//! A lock is the cache key `lock:{resource}` holding the owner's token, with
//! the lease as its TTL. Acquire is a conditional create, renew a
//! compare-and-swap of the token onto itself with a new TTL, release a
//! conditional delete. Nothing is ever read and then written.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dog_cache::Cache;
use dog_core::{
    publish_message, subscribe_message, DogConfigSnapshot, JsonSerializer, MessageBus,
    Subscription,
};
use futures::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use crate::lock::deadline_after;
use crate::{AcquireOptions, Lock, LockError, LockProvider, LockResult, LockToken};

pub const LOCK_RELEASED_TOPIC: &str = "dog.locks.released";

/// Published after a successful release so waiters retry right away
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockReleased {
    pub resource: String,
    pub token: String,
}

/// Retry pacing for contended acquires
#[derive(Debug, Clone)]
pub struct CacheLockOptions {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub topic: String,
}

impl Default for CacheLockOptions {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_secs(1),
            topic: LOCK_RELEASED_TOPIC.to_string(),
        }
    }
}

impl CacheLockOptions {
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Read `{prefix}.initial_backoff_ms`, `{prefix}.max_backoff_ms`, `{prefix}.topic`
    pub fn from_config(config: &DogConfigSnapshot, prefix: &str) -> Self {
        let defaults = Self::default();
        Self {
            initial_backoff: config
                .get_duration_ms(&format!("{prefix}.initial_backoff_ms"))
                .unwrap_or(defaults.initial_backoff),
            max_backoff: config
                .get_duration_ms(&format!("{prefix}.max_backoff_ms"))
                .unwrap_or(defaults.max_backoff),
            topic: config
                .get_string(&format!("{prefix}.topic"))
                .unwrap_or(defaults.topic),
        }
    }

    fn validate(&self) -> LockResult<()> {
        if self.initial_backoff.is_zero() || self.max_backoff < self.initial_backoff {
            return Err(LockError::InvalidOptions(format!(
                "backoff must satisfy 0 < initial ({:?}) <= max ({:?})",
                self.initial_backoff, self.max_backoff
            )));
        }
        Ok(())
    }
}

fn lock_key(resource: &str) -> String {
    format!("lock:{resource}")
}

pub struct CacheLockProvider {
    cache: Arc<dyn Cache>,
    bus: Option<Arc<dyn MessageBus>>,
    options: CacheLockOptions,
    released: Arc<Notify>,
    subscription: Mutex<Option<Subscription>>,
}

impl CacheLockProvider {
    /// Provider that polls with backoff only
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            cache,
            bus: None,
            options: CacheLockOptions::default(),
            released: Arc::new(Notify::new()),
            subscription: Mutex::new(None),
        }
    }

    pub fn with_options(cache: Arc<dyn Cache>, options: CacheLockOptions) -> LockResult<Self> {
        options.validate()?;
        Ok(Self {
            options,
            ..Self::new(cache)
        })
    }

    /// Provider that also announces releases on `bus` and wakes its own
    /// waiters when any process releases a lock.
    pub async fn with_bus(
        cache: Arc<dyn Cache>,
        bus: Arc<dyn MessageBus>,
        options: CacheLockOptions,
    ) -> LockResult<Self> {
        options.validate()?;
        let released = Arc::new(Notify::new());

        let waiters = released.clone();
        let subscription = subscribe_message(
            bus.as_ref(),
            JsonSerializer,
            &options.topic,
            move |message: LockReleased| -> BoxFuture<'static, anyhow::Result<()>> {
                let waiters = waiters.clone();
                async move {
                    trace!(resource = %message.resource, "lock released elsewhere");
                    waiters.notify_waiters();
                    Ok(())
                }
                .boxed()
            },
        )
        .await?;

        Ok(Self {
            cache,
            bus: Some(bus),
            options,
            released,
            subscription: Mutex::new(Some(subscription)),
        })
    }

    /// Stop listening for release announcements
    pub fn close(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .options
            .initial_backoff
            .saturating_mul(2_u32.saturating_pow(attempt.min(16)))
            .min(self.options.max_backoff);
        // up to 20% jitter so contending processes spread out
        let jitter_ms = (base.as_millis() as u64) / 5;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }

    async fn announce_release(&self, lock: &Lock) {
        let Some(bus) = &self.bus else {
            return;
        };
        let message = LockReleased {
            resource: lock.resource.clone(),
            token: lock.token.to_string(),
        };
        if let Err(err) = publish_message(bus.as_ref(), &JsonSerializer, &self.options.topic, &message).await {
            warn!(resource = %lock.resource, error = %err, "failed to announce lock release");
        }
    }
}

#[async_trait]
impl LockProvider for CacheLockProvider {
    #[instrument(skip(self), fields(timeout_ms = options.acquire_timeout.as_millis() as u64, lease_ms = options.lease.as_millis() as u64))]
    async fn acquire(&self, resource: &str, options: AcquireOptions) -> LockResult<Option<Lock>> {
        let key = lock_key(resource);
        let started = Instant::now();
        let deadline = started.checked_add(options.acquire_timeout);
        let token = LockToken::new();
        let mut attempt = 0u32;

        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self
                .cache
                .add(&key, token.as_bytes().to_vec(), Some(options.lease))
                .await?
            {
                let waited = started.elapsed();
                debug!(resource, attempts = attempt + 1, waited_ms = waited.as_millis() as u64, "lock acquired");
                let expires = deadline_after(Utc::now(), options.lease);
                return Ok(Some(Lock::granted(resource, token, expires, waited)));
            }

            let now = Instant::now();
            let remaining_timeout = match deadline {
                Some(deadline) if now >= deadline => {
                    debug!(resource, attempts = attempt + 1, "lock acquire timed out");
                    return Ok(None);
                }
                Some(deadline) => deadline - now,
                // timeout too long to represent, keep trying
                None => options.acquire_timeout,
            };

            let mut delay = self.backoff(attempt).min(remaining_timeout);
            // no point sleeping past the holder's lease
            if let Some(remaining) = self.cache.get_expiration(&key).await? {
                delay = delay.min(remaining.saturating_add(Duration::from_millis(1)));
            }
            attempt += 1;
            trace!(resource, attempt, delay_ms = delay.as_millis() as u64, "lock busy, waiting");

            tokio::select! {
                _ = &mut released => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn renew(&self, lock: &mut Lock, extension: Duration) -> LockResult<bool> {
        let token = lock.token.as_bytes().to_vec();
        let renewed = self
            .cache
            .replace_if_equal(&lock_key(&lock.resource), &token, token.clone(), Some(extension))
            .await?;

        if renewed {
            lock.lease_expires_at = deadline_after(Utc::now(), extension);
            lock.renewal_count += 1;
            trace!(resource = %lock.resource, renewals = lock.renewal_count, "lock renewed");
        } else {
            warn!(resource = %lock.resource, "lock renewal failed, ownership lost");
        }
        Ok(renewed)
    }

    async fn release(&self, lock: &Lock) -> LockResult<bool> {
        let released = self
            .cache
            .remove_if_equal(&lock_key(&lock.resource), lock.token.as_bytes())
            .await?;

        if released {
            debug!(resource = %lock.resource, held_ms = (Utc::now() - lock.acquired_at).num_milliseconds(), "lock released");
            self.released.notify_waiters();
            self.announce_release(lock).await;
        } else {
            debug!(resource = %lock.resource, "lock no longer held, release skipped");
        }
        Ok(released)
    }

    async fn is_locked(&self, resource: &str) -> LockResult<bool> {
        Ok(self.cache.exists(&lock_key(resource)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LockProviderExt;
    use dog_cache::InMemoryCache;
    use tracing_test::traced_test;

    fn provider() -> (CacheLockProvider, InMemoryCache) {
        let cache = InMemoryCache::new();
        (CacheLockProvider::new(Arc::new(cache.clone())), cache)
    }

    #[tokio::test]
    async fn second_acquire_times_out_while_lease_is_held() {
        let (locks, _) = provider();
        let first = locks
            .acquire("R", AcquireOptions::new(Duration::ZERO, Duration::from_secs(2)))
            .await
            .unwrap();
        assert!(first.is_some());

        let started = std::time::Instant::now();
        let second = locks
            .acquire("R", AcquireOptions::new(Duration::from_millis(100), Duration::from_secs(2)))
            .await
            .unwrap();

        assert!(second.is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn release_lets_the_next_caller_in() {
        let (locks, cache) = provider();
        let lock = locks
            .acquire("R", AcquireOptions::immediate(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cache.get("lock:R").await.unwrap().unwrap().value, lock.token.as_bytes());
        assert!(locks.is_locked("R").await.unwrap());

        assert!(locks.release(&lock).await.unwrap());
        assert!(!locks.is_locked("R").await.unwrap());
        assert!(locks
            .acquire("R", AcquireOptions::immediate(Duration::from_secs(5)))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    #[traced_test]
    async fn stale_token_cannot_renew_or_release() {
        let (locks, _) = provider();
        let mut stale = locks
            .acquire("R", AcquireOptions::immediate(Duration::from_millis(30)))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let current = locks
            .acquire("R", AcquireOptions::immediate(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();

        assert!(!locks.renew(&mut stale, Duration::from_secs(5)).await.unwrap());
        assert_eq!(stale.renewal_count, 0);
        assert!(logs_contain("lock renewal failed, ownership lost"));
        assert!(!locks.release(&stale).await.unwrap());
        assert!(locks.is_locked("R").await.unwrap());
        assert!(locks.release(&current).await.unwrap());
    }

    #[tokio::test]
    async fn renew_extends_the_lease() {
        let (locks, cache) = provider();
        let mut lock = locks
            .acquire("R", AcquireOptions::immediate(Duration::from_millis(100)))
            .await
            .unwrap()
            .unwrap();

        assert!(locks.renew(&mut lock, Duration::from_secs(10)).await.unwrap());
        assert_eq!(lock.renewal_count, 1);
        let ttl = cache.get_expiration("lock:R").await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(9));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(locks.is_locked("R").await.unwrap());
    }

    #[tokio::test]
    async fn waiter_gets_lock_once_lease_expires() {
        let (locks, _) = provider();
        locks
            .acquire("R", AcquireOptions::immediate(Duration::from_millis(80)))
            .await
            .unwrap()
            .unwrap();

        let lock = locks
            .acquire("R", AcquireOptions::new(Duration::from_secs(2), Duration::from_secs(1)))
            .await
            .unwrap()
            .unwrap();

        assert!(lock.time_waited >= Duration::from_millis(60));
        assert!(lock.time_waited < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn unbounded_acquire_timeout_waits_for_the_holder() {
        let (locks, _) = provider();
        locks
            .acquire("R", AcquireOptions::immediate(Duration::from_millis(80)))
            .await
            .unwrap()
            .unwrap();

        let lock = tokio::time::timeout(
            Duration::from_secs(5),
            locks.acquire("R", AcquireOptions::new(Duration::MAX, Duration::from_secs(1))),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(lock.is_some());
    }

    #[tokio::test]
    async fn try_using_runs_work_and_releases() {
        let (locks, _) = provider();
        let value = locks
            .try_using("R", AcquireOptions::immediate(Duration::from_secs(5)), || async { 42 })
            .await
            .unwrap();

        assert_eq!(value, Some(42));
        assert!(!locks.is_locked("R").await.unwrap());
    }

    #[test]
    fn zero_backoff_is_rejected() {
        let options = CacheLockOptions::default().with_backoff(Duration::ZERO, Duration::from_secs(1));
        let err = CacheLockProvider::with_options(Arc::new(InMemoryCache::new()), options).err();
        assert!(matches!(err, Some(LockError::InvalidOptions(_))));
    }
}
