use std::time::Duration;

use dog_core::DogConfigSnapshot;
use dog_lock::AcquireOptions;

use crate::{JobError, JobsResult};

/// Configuration for [`QueueJobRunner`](crate::QueueJobRunner)
#[derive(Debug, Clone)]
pub struct JobRunnerOptions {
    /// How long one dequeue waits for an entry
    pub dequeue_wait: Duration,
    /// Acquire timeout and lease for the per-entry resource lock
    pub lock: AcquireOptions,
    /// Time between lease renewals while a job runs; `None` renews at half
    /// of the shorter of the queue lease and the lock lease
    pub renewal_interval: Option<Duration>,
}

impl Default for JobRunnerOptions {
    fn default() -> Self {
        Self {
            dequeue_wait: Duration::from_secs(1),
            lock: AcquireOptions::default(),
            renewal_interval: None,
        }
    }
}

impl JobRunnerOptions {
    pub fn with_dequeue_wait(mut self, wait: Duration) -> Self {
        self.dequeue_wait = wait;
        self
    }

    pub fn with_lock(mut self, lock: AcquireOptions) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_renewal_interval(mut self, interval: Duration) -> Self {
        self.renewal_interval = Some(interval);
        self
    }

    /// Read `{prefix}.dequeue_wait_ms`, `{prefix}.renewal_interval_ms` and
    /// the lock settings under `{prefix}.lock`
    pub fn from_config(config: &DogConfigSnapshot, prefix: &str) -> Self {
        let defaults = Self::default();
        Self {
            dequeue_wait: config
                .get_duration_ms(&format!("{prefix}.dequeue_wait_ms"))
                .unwrap_or(defaults.dequeue_wait),
            lock: AcquireOptions::from_config(config, &format!("{prefix}.lock")),
            renewal_interval: config
                .get_duration_ms(&format!("{prefix}.renewal_interval_ms"))
                .or(defaults.renewal_interval),
        }
    }

    pub fn validate(&self) -> JobsResult<()> {
        if self.renewal_interval.is_some_and(|i| i.is_zero()) {
            return Err(JobError::InvalidOptions("renewal_interval must be positive".to_string()));
        }
        if self.lock.lease.is_zero() {
            return Err(JobError::InvalidOptions("lock lease must be positive".to_string()));
        }
        Ok(())
    }

    /// Renewal cadence for a run whose queue lease is `queue_lease`
    pub(crate) fn renewal_interval_for(&self, queue_lease: Duration, locked: bool) -> Duration {
        if let Some(interval) = self.renewal_interval {
            return interval;
        }
        let shorter = if locked {
            queue_lease.min(self.lock.lease)
        } else {
            queue_lease
        };
        (shorter / 2).max(MIN_RENEWAL_INTERVAL)
    }
}

const MIN_RENEWAL_INTERVAL: Duration = Duration::from_millis(10);

/// Limits for [`QueueJobRunner::run_continuous`](crate::QueueJobRunner::run_continuous)
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stop after this many runs, idle polls included
    pub iteration_limit: Option<usize>,
    /// Pause between runs
    pub interval: Duration,
    /// Stop at the first poll that finds nothing to do
    pub until_empty: bool,
}

impl RunOptions {
    pub fn forever() -> Self {
        Self::default()
    }

    pub fn until_empty() -> Self {
        Self {
            until_empty: true,
            ..Self::default()
        }
    }

    pub fn with_iteration_limit(mut self, limit: usize) -> Self {
        self.iteration_limit = Some(limit);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}
