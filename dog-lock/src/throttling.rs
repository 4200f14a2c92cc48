//! Rate limiting expressed as lock acquisition.
//!
//! Time is cut into fixed periods aligned to the Unix epoch. Each period has
//! a counter at `throttle:{resource}:{period_start_ms}`; an acquire
//! increments it atomically and is granted while the count stays within
//! `max_per_period`. Grants are counted, not held.
//!
//! An exhausted period is only waited out when the next one starts before
//! the acquire timeout. Otherwise acquire returns `None` at once instead of
//! sleeping until the timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dog_cache::Cache;
use dog_core::DogConfigSnapshot;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};

use crate::{AcquireOptions, Lock, LockError, LockProvider, LockResult, LockToken};

/// Extra lifetime given to a bucket past its period end
const BUCKET_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleOptions {
    pub max_per_period: u32,
    pub period: Duration,
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            max_per_period: 100,
            period: Duration::from_secs(15 * 60),
        }
    }
}

impl ThrottleOptions {
    pub fn new(max_per_period: u32, period: Duration) -> Self {
        Self {
            max_per_period,
            period,
        }
    }

    /// Read `{prefix}.max_per_period` and `{prefix}.period_ms`
    pub fn from_config(config: &DogConfigSnapshot, prefix: &str) -> Self {
        let defaults = Self::default();
        Self {
            max_per_period: config
                .get_u32(&format!("{prefix}.max_per_period"))
                .unwrap_or(defaults.max_per_period),
            period: config
                .get_duration_ms(&format!("{prefix}.period_ms"))
                .unwrap_or(defaults.period),
        }
    }

    fn period_ms(&self) -> LockResult<i64> {
        match i64::try_from(self.period.as_millis()) {
            Ok(ms) if ms > 0 => Ok(ms),
            _ => Err(LockError::InvalidOptions(format!(
                "throttle period must be at least 1ms, got {:?}",
                self.period
            ))),
        }
    }
}

/// The fixed window containing one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Bucket {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl Bucket {
    pub fn at(now_ms: i64, period_ms: i64) -> Self {
        let start_ms = now_ms - now_ms.rem_euclid(period_ms);
        Self {
            start_ms,
            end_ms: start_ms + period_ms,
        }
    }

    pub fn key(&self, resource: &str) -> String {
        format!("throttle:{resource}:{}", self.start_ms)
    }

    /// Time until the next period starts
    pub fn remaining(&self, now_ms: i64) -> Duration {
        Duration::from_millis(u64::try_from(self.end_ms - now_ms).unwrap_or(0))
    }

    fn end(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.end_ms)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

pub struct ThrottlingLockProvider {
    cache: Arc<dyn Cache>,
    options: ThrottleOptions,
}

impl ThrottlingLockProvider {
    pub fn new(cache: Arc<dyn Cache>, options: ThrottleOptions) -> LockResult<Self> {
        options.period_ms()?;
        Ok(Self { cache, options })
    }

    pub fn options(&self) -> ThrottleOptions {
        self.options
    }

    /// Acquire with explicit limits instead of the configured ones.
    ///
    /// When the current period is exhausted the caller sleeps until the next
    /// period boundary, then retries against the new period's counter.
    /// `Ok(None)` when no grant fits before `acquire_timeout`, returned as
    /// soon as the next period boundary is known to fall after it.
    #[instrument(skip(self), fields(period_ms = period.as_millis() as u64))]
    pub async fn acquire_with(
        &self,
        resource: &str,
        acquire_timeout: Duration,
        max_per_period: u32,
        period: Duration,
    ) -> LockResult<Option<Lock>> {
        let period_ms = ThrottleOptions::new(max_per_period, period).period_ms()?;
        let started = Instant::now();
        let deadline = started.checked_add(acquire_timeout);

        loop {
            let now_ms = Utc::now().timestamp_millis();
            let bucket = Bucket::at(now_ms, period_ms);
            let key = bucket.key(resource);
            let ttl = bucket.remaining(now_ms) + BUCKET_SLACK;

            let count = self.cache.increment(&key, 1, Some(ttl)).await?;
            if count <= i64::from(max_per_period) {
                let waited = started.elapsed();
                debug!(resource, count, bucket = bucket.start_ms, waited_ms = waited.as_millis() as u64, "throttle granted");
                return Ok(Some(Lock::granted(resource, LockToken::new(), bucket.end(), waited)));
            }

            // sleep to the boundary, plus a hair so the clock is past it
            let wait = bucket.remaining(Utc::now().timestamp_millis()) + Duration::from_millis(1);
            let past_deadline = match deadline {
                Some(deadline) => Instant::now().checked_add(wait).map_or(true, |at| at > deadline),
                None => false,
            };
            if past_deadline {
                debug!(resource, count, "throttle exhausted until after the acquire timeout");
                return Ok(None);
            }
            trace!(resource, count, wait_ms = wait.as_millis() as u64, "throttled, waiting for next period");
            tokio::time::sleep(wait).await;
        }
    }
}

#[async_trait]
impl LockProvider for ThrottlingLockProvider {
    async fn acquire(&self, resource: &str, options: AcquireOptions) -> LockResult<Option<Lock>> {
        self.acquire_with(
            resource,
            options.acquire_timeout,
            self.options.max_per_period,
            self.options.period,
        )
        .await
    }

    /// Grants are not held, there is nothing to extend.
    async fn renew(&self, _lock: &mut Lock, _extension: Duration) -> LockResult<bool> {
        Ok(true)
    }

    /// Grants expire with their period.
    async fn release(&self, _lock: &Lock) -> LockResult<bool> {
        Ok(true)
    }

    /// Whether the current period has no grants left
    async fn is_locked(&self, resource: &str) -> LockResult<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let bucket = Bucket::at(now_ms, self.options.period_ms()?);
        let Some(found) = self.cache.get(&bucket.key(resource)).await? else {
            return Ok(false);
        };
        let count = std::str::from_utf8(&found.value)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        Ok(count >= i64::from(self.options.max_per_period))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn bucket_contains_the_instant(now_ms in 0i64..4_000_000_000_000, period_ms in 1i64..86_400_000) {
            let bucket = Bucket::at(now_ms, period_ms);
            prop_assert!(bucket.start_ms <= now_ms);
            prop_assert!(now_ms < bucket.end_ms);
            prop_assert_eq!(bucket.start_ms % period_ms, 0);
            prop_assert!(bucket.remaining(now_ms) <= Duration::from_millis(period_ms as u64));
        }

        #[test]
        fn crossing_a_boundary_changes_the_key(now_ms in 0i64..4_000_000_000_000, period_ms in 1i64..86_400_000) {
            let bucket = Bucket::at(now_ms, period_ms);
            let next = Bucket::at(bucket.end_ms, period_ms);
            prop_assert_ne!(bucket.key("r"), next.key("r"));
            prop_assert_eq!(next.start_ms, bucket.end_ms);
        }
    }

    #[test]
    fn bucket_key_format() {
        let bucket = Bucket::at(10_500, 3_000);
        assert_eq!(bucket.start_ms, 9_000);
        assert_eq!(bucket.key("api"), "throttle:api:9000");
        assert_eq!(bucket.remaining(10_500), Duration::from_millis(1_500));
    }

    #[tokio::test]
    async fn unbounded_acquire_timeout_waits_for_next_period() {
        let period = Duration::from_millis(200);
        let throttle =
            ThrottlingLockProvider::new(Arc::new(dog_cache::InMemoryCache::new()), ThrottleOptions::new(1, period)).unwrap();

        let first = throttle.acquire_with("api", Duration::MAX, 1, period).await.unwrap();
        assert!(first.is_some());

        let second = tokio::time::timeout(
            Duration::from_secs(5),
            throttle.acquire_with("api", Duration::MAX, 1, period),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(second.is_some());
    }

    #[test]
    fn zero_period_is_rejected() {
        let cache = Arc::new(dog_cache::InMemoryCache::new());
        let result = ThrottlingLockProvider::new(cache, ThrottleOptions::new(5, Duration::ZERO));
        assert!(matches!(result, Err(LockError::InvalidOptions(_))));
    }
}
