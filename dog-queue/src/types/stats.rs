use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Point-in-time view of a queue.
///
/// `queued`, `working` and `dead_lettered` are current sizes; the rest are
/// totals since the queue was created or last deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub working: u64,
    pub dead_lettered: u64,
    pub enqueued: u64,
    pub dequeued: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub timeouts: u64,
    /// Abandons that carried a failure reason
    pub errors: u64,
}

impl QueueStats {
    /// Entries currently held anywhere in the queue
    pub fn total_held(&self) -> u64 {
        self.queued + self.working + self.dead_lettered
    }
}

/// Running totals kept by a backend
#[derive(Debug, Default)]
pub struct QueueCounters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    completed: AtomicU64,
    abandoned: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
}

impl QueueCounters {
    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dequeued(&self) {
        self.dequeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self, with_error: bool) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
        if with_error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in [
            &self.enqueued,
            &self.dequeued,
            &self.completed,
            &self.abandoned,
            &self.timeouts,
            &self.errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Combine the totals with current sizes
    pub fn snapshot(&self, queued: u64, working: u64, dead_lettered: u64) -> QueueStats {
        QueueStats {
            queued,
            working,
            dead_lettered,
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
