use std::time::Duration;

use chrono::{DateTime, Utc};
use dog_core::DogConfigSnapshot;

use crate::{QueueError, QueueResult};

/// Configuration for one queue
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Name used in logs and spans
    pub name: String,
    /// How long a dequeued entry stays owned without renewal
    pub visibility_timeout: Duration,
    /// Deliveries before an entry is dead-lettered
    pub max_attempts: u32,
    /// Delay before an abandoned entry is visible again, doubled per attempt.
    /// Zero re-enqueues immediately at the back of the line.
    pub retry_delay: Duration,
    /// Upper bound for the doubled retry delay
    pub max_retry_delay: Duration,
    /// How often the lease reaper sweeps for expired deadlines
    pub sweep_interval: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            visibility_timeout: Duration::from_secs(300), // 5 minutes
            max_attempts: 3,
            retry_delay: Duration::ZERO,
            max_retry_delay: Duration::from_secs(3600), // 1 hour
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl QueueOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration, max: Duration) -> Self {
        self.retry_delay = delay;
        self.max_retry_delay = max;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Load options for queue `name` from `{prefix}.{name}.*`.
    ///
    /// Keys: `visibility_timeout_ms`, `max_attempts`, `retry_delay_ms`,
    /// `max_retry_delay_ms`, `sweep_interval_ms`. Missing keys keep defaults.
    pub fn from_config(config: &DogConfigSnapshot, prefix: &str, name: &str) -> Self {
        let key = |field: &str| format!("{prefix}.{name}.{field}");
        let defaults = Self::named(name);
        Self {
            visibility_timeout: config
                .get_duration_ms(&key("visibility_timeout_ms"))
                .unwrap_or(defaults.visibility_timeout),
            max_attempts: config
                .get_u32(&key("max_attempts"))
                .unwrap_or(defaults.max_attempts),
            retry_delay: config
                .get_duration_ms(&key("retry_delay_ms"))
                .unwrap_or(defaults.retry_delay),
            max_retry_delay: config
                .get_duration_ms(&key("max_retry_delay_ms"))
                .unwrap_or(defaults.max_retry_delay),
            sweep_interval: config
                .get_duration_ms(&key("sweep_interval_ms"))
                .unwrap_or(defaults.sweep_interval),
            name: defaults.name,
        }
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.max_attempts == 0 {
            return Err(QueueError::InvalidOptions("max_attempts must be at least 1".to_string()));
        }
        if self.visibility_timeout.is_zero() {
            return Err(QueueError::InvalidOptions("visibility_timeout must be positive".to_string()));
        }
        if self.sweep_interval.is_zero() {
            return Err(QueueError::InvalidOptions("sweep_interval must be positive".to_string()));
        }
        Ok(())
    }

    /// Delay before delivery number `attempts + 1`, with exponential backoff
    pub fn retry_delay_for(&self, attempts: u32) -> Duration {
        if self.retry_delay.is_zero() {
            return Duration::ZERO;
        }
        let factor = 2_u32.saturating_pow(attempts.saturating_sub(1).min(31));
        self.retry_delay
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }

    /// When an entry abandoned after `attempts` deliveries becomes visible
    pub(crate) fn retry_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        add_duration(now, self.retry_delay_for(attempts))
    }

    pub(crate) fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        add_duration(now, self.visibility_timeout)
    }
}

pub(crate) fn add_duration(at: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_retry_delay_requeues_immediately() {
        let options = QueueOptions::default();
        assert_eq!(options.retry_delay_for(1), Duration::ZERO);
        assert_eq!(options.retry_delay_for(7), Duration::ZERO);
    }

    #[test]
    fn retry_delay_doubles_per_attempt() {
        let options = QueueOptions::default()
            .with_retry_delay(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(options.retry_delay_for(1), Duration::from_secs(1));
        assert_eq!(options.retry_delay_for(2), Duration::from_secs(2));
        assert_eq!(options.retry_delay_for(3), Duration::from_secs(4));
        assert_eq!(options.retry_delay_for(5), Duration::from_secs(10));
    }

    #[test]
    fn options_from_config() {
        let mut config = dog_core::DogConfig::new();
        config.set("queue.orders.max_attempts", "5");
        config.set("queue.orders.visibility_timeout_ms", "1500");

        let options = QueueOptions::from_config(&config.snapshot(), "queue", "orders");
        assert_eq!(options.name, "orders");
        assert_eq!(options.max_attempts, 5);
        assert_eq!(options.visibility_timeout, Duration::from_millis(1500));
        assert_eq!(options.retry_delay, Duration::ZERO);
    }

    #[test]
    fn zero_attempts_is_invalid() {
        let options = QueueOptions::default().with_max_attempts(0);
        assert!(matches!(options.validate(), Err(QueueError::InvalidOptions(_))));
    }

    proptest! {
        #[test]
        fn retry_delay_is_bounded_and_monotonic(base_ms in 1u64..10_000, max_ms in 1u64..100_000, attempts in 1u32..64) {
            let options = QueueOptions::default()
                .with_retry_delay(Duration::from_millis(base_ms), Duration::from_millis(max_ms));
            let delay = options.retry_delay_for(attempts);
            prop_assert!(delay <= Duration::from_millis(max_ms));
            prop_assert!(options.retry_delay_for(attempts + 1) >= delay);
        }
    }
}
