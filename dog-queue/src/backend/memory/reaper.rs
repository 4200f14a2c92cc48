use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::storage::MemoryBackend;
use crate::{EntryId, EntryState, QueueResult};

/// Periodic sweep that returns entries with passed visibility deadlines to
/// the queue.
///
/// Dequeue also reclaims inline, so the reaper only matters for queues that
/// sit idle while a consumer has died holding a lease.
pub struct LeaseReaper {
    backend: MemoryBackend,
    interval: Duration,
}

impl LeaseReaper {
    /// Reaper using the queue's `sweep_interval`
    pub fn new(backend: MemoryBackend) -> Self {
        let interval = backend.options().sweep_interval;
        Self { backend, interval }
    }

    pub fn with_interval(backend: MemoryBackend, interval: Duration) -> Self {
        Self { backend, interval }
    }

    /// Run until the task is aborted
    pub async fn start(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(queue = %self.backend.options().name, interval = ?self.interval, "starting lease reaper");

        loop {
            ticker.tick().await;

            let reclaimed = self.reap_expired_leases().await;
            if reclaimed > 0 {
                info!(queue = %self.backend.options().name, reclaimed, "reclaimed expired leases");
            } else {
                debug!(queue = %self.backend.options().name, "no expired leases");
            }
        }
    }

    /// Run the reaper on the current runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.start())
    }

    /// One sweep; returns how many leases were reclaimed
    pub async fn reap_expired_leases(&self) -> usize {
        self.backend.reap(Utc::now()).await
    }
}

/// Test helpers for deterministic lease expiry
impl MemoryBackend {
    /// Move a dequeued entry's visibility deadline into the past.
    ///
    /// Returns `false` when the entry is not currently dequeued.
    pub fn force_lease_expiry(&self, id: &EntryId) -> QueueResult<bool> {
        let mut state = self.state.lock();
        let Some(record) = state.entries.get_mut(id) else {
            return Ok(false);
        };
        if !matches!(record.state, EntryState::Dequeued { .. }) {
            return Ok(false);
        }
        record.extend_lease(Utc::now() - chrono::Duration::seconds(1));
        Ok(true)
    }

    /// Run one reaper tick
    pub async fn run_reaper_tick(&self) -> usize {
        LeaseReaper::new(self.clone()).reap_expired_leases().await
    }

    /// Spawn a reaper sweeping at the queue's `sweep_interval`
    pub fn start_reaper(&self) -> JoinHandle<()> {
        LeaseReaper::new(self.clone()).spawn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::QueueBackend, QueueOptions};
    use tracing_test::traced_test;

    fn backend(max_attempts: u32) -> MemoryBackend {
        MemoryBackend::new(QueueOptions::named("reaper").with_max_attempts(max_attempts)).unwrap()
    }

    #[tokio::test]
    #[traced_test]
    async fn test_lease_expiry_reaper() {
        let backend = backend(3);

        // Enqueue and lease an entry
        let id = backend.enqueue(b"payload".to_vec()).await.unwrap();
        let leased = backend.dequeue(Duration::ZERO).await.unwrap().unwrap();

        assert!(backend.force_lease_expiry(&id).unwrap());

        let reaper = LeaseReaper::new(backend.clone());
        assert_eq!(reaper.reap_expired_leases().await, 1);
        assert!(logs_contain("reclaiming expired lease"));

        // old token is dead, the entry is deliverable again
        assert!(!backend.complete(&id, &leased.lease_token).await.unwrap());
        let retry = backend.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(retry.id, id);
        assert_eq!(retry.attempts, 2);
        assert_eq!(backend.stats().await.unwrap().timeouts, 1);
    }

    #[tokio::test]
    async fn test_expiry_on_last_attempt_dead_letters() {
        let backend = backend(1);

        let id = backend.enqueue(b"payload".to_vec()).await.unwrap();
        backend.dequeue(Duration::ZERO).await.unwrap().unwrap();
        backend.force_lease_expiry(&id).unwrap();

        assert_eq!(backend.run_reaper_tick().await, 1);

        let letters = backend.dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].id, id);
        assert_eq!(letters[0].reason.as_deref(), Some("visibility timeout expired"));
    }

    #[tokio::test]
    async fn test_force_expiry_ignores_enqueued_entries() {
        let backend = backend(3);
        let id = backend.enqueue(b"payload".to_vec()).await.unwrap();

        assert!(!backend.force_lease_expiry(&id).unwrap());
        assert_eq!(backend.run_reaper_tick().await, 0);
    }

    #[tokio::test]
    async fn test_spawned_reaper_sweeps_on_interval() {
        let backend = MemoryBackend::new(
            QueueOptions::named("sweep")
                .with_visibility_timeout(Duration::from_millis(20))
                .with_sweep_interval(Duration::from_millis(10)),
        )
        .unwrap();
        backend.enqueue(b"payload".to_vec()).await.unwrap();
        backend.dequeue(Duration::ZERO).await.unwrap().unwrap();

        let reaper = backend.start_reaper();
        tokio::time::sleep(Duration::from_millis(150)).await;
        reaper.abort();

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.working, 0);
    }
}
