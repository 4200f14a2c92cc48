use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dog_core::EventHub;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::{
    backend::QueueBackend,
    options::add_duration,
    DeadLetter, EntryId, EntryRecord, EntryState, LeaseToken, LeasedEntry, QueueCounters,
    QueueEvent, QueueOptions, QueueResult, QueueStats,
};

const LEASE_EXPIRED: &str = "visibility timeout expired";

/// Entry table plus the orderings over it
#[derive(Default)]
pub(crate) struct QueueState {
    pub(crate) entries: HashMap<EntryId, EntryRecord>,
    /// Enqueued entries in delivery order
    pub(crate) ready: VecDeque<EntryId>,
    /// Dead letters in the order they were parked
    pub(crate) dead: VecDeque<EntryId>,
}

impl QueueState {
    /// Lease the first available entry
    fn take_available(&mut self, options: &QueueOptions, now: DateTime<Utc>) -> Option<LeasedEntry> {
        let entries = &self.entries;
        let index = self
            .ready
            .iter()
            .position(|id| entries.get(id).is_some_and(|r| r.is_available(now)))?;
        let id = self.ready.remove(index)?;
        let record = self.entries.get_mut(&id)?;

        let token = LeaseToken::new();
        let lease_until = options.lease_until(now);
        record.start_lease(token.clone(), lease_until, now);
        Some(LeasedEntry::from_record(record, token, lease_until, now))
    }

    /// Earliest instant something could become available: a delayed retry
    /// turning visible or a lease running out
    fn next_change(&self) -> Option<DateTime<Utc>> {
        self.entries
            .values()
            .filter_map(|r| match r.state {
                EntryState::Enqueued => Some(r.available_at),
                EntryState::Dequeued { lease_until } => Some(lease_until),
                EntryState::DeadLettered { .. } => None,
            })
            .min()
    }

    /// Requeue or dead-letter an entry whose delivery ended without completion
    fn release(
        &mut self,
        id: &EntryId,
        options: &QueueOptions,
        reason: Option<String>,
        timed_out: bool,
        now: DateTime<Utc>,
    ) -> Vec<QueueEvent> {
        let Some(record) = self.entries.get_mut(id) else {
            return Vec::new();
        };
        let mut events = Vec::with_capacity(2);
        if timed_out {
            events.push(QueueEvent::LeaseExpired {
                id: id.clone(),
                attempts: record.attempts,
                at: now,
            });
        }

        if record.attempts >= options.max_attempts {
            record.dead_letter(now, reason.clone());
            self.dead.push_back(id.clone());
            events.push(QueueEvent::DeadLettered {
                id: id.clone(),
                attempts: record.attempts,
                reason,
                at: now,
            });
        } else {
            let retry_at = options.retry_at(now, record.attempts);
            record.requeue(retry_at, reason.clone());
            self.ready.push_back(id.clone());
            if !timed_out {
                events.push(QueueEvent::Abandoned {
                    id: id.clone(),
                    attempts: record.attempts,
                    reason,
                    retry_at,
                    at: now,
                });
            }
        }
        events
    }

    /// Reclaim every entry whose visibility deadline passed
    pub(crate) fn reclaim_expired(&mut self, options: &QueueOptions, now: DateTime<Utc>) -> Vec<QueueEvent> {
        let expired: Vec<EntryId> = self
            .entries
            .values()
            .filter(|r| r.lease_expired(now))
            .map(|r| r.id.clone())
            .collect();

        let mut events = Vec::new();
        for id in expired {
            debug!(entry_id = %id, "reclaiming expired lease");
            events.extend(self.release(&id, options, Some(LEASE_EXPIRED.to_string()), true, now));
        }
        events
    }

    fn counts(&self) -> (u64, u64, u64) {
        let mut queued = 0;
        let mut working = 0;
        let mut dead = 0;
        for record in self.entries.values() {
            match record.state {
                EntryState::Enqueued => queued += 1,
                EntryState::Dequeued { .. } => working += 1,
                EntryState::DeadLettered { .. } => dead += 1,
            }
        }
        (queued, working, dead)
    }
}

/// In-memory backend for tests, development and single-process deployments.
///
/// Clones share the same queue.
#[derive(Clone)]
pub struct MemoryBackend {
    pub(crate) options: Arc<QueueOptions>,

    pub(crate) state: Arc<Mutex<QueueState>>,

    pub(crate) counters: Arc<QueueCounters>,

    /// Wakes blocked dequeuers when entries become available
    pub(crate) available: Arc<Notify>,

    pub(crate) events: Arc<EventHub<QueueEvent>>,
}

impl MemoryBackend {
    /// Create an empty queue after validating `options`
    pub fn new(options: QueueOptions) -> QueueResult<Self> {
        options.validate()?;
        Ok(Self {
            options: Arc::new(options),
            state: Arc::new(Mutex::new(QueueState::default())),
            counters: Arc::new(QueueCounters::default()),
            available: Arc::new(Notify::new()),
            events: Arc::new(EventHub::new()),
        })
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Snapshot of one entry's record
    pub fn record(&self, id: &EntryId) -> Option<EntryRecord> {
        self.state.lock().entries.get(id).cloned()
    }

    /// Reclaim expired leases as of `now`; returns how many were reclaimed
    pub async fn reap(&self, now: DateTime<Utc>) -> usize {
        let events = {
            let mut state = self.state.lock();
            state.reclaim_expired(&self.options, now)
        };
        let reclaimed = events
            .iter()
            .filter(|e| matches!(e, QueueEvent::LeaseExpired { .. }))
            .count();
        for _ in 0..reclaimed {
            self.counters.record_timeout();
        }
        if reclaimed > 0 {
            self.available.notify_waiters();
        }
        self.emit_all(events).await;
        reclaimed
    }

    async fn emit_all(&self, events: Vec<QueueEvent>) {
        for event in events {
            let failures = self.events.emit(&event).await;
            if failures > 0 {
                warn!(queue = %self.options.name, event = event.event_name(), failures, "queue event listeners failed");
            }
        }
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.options.name
    }

    async fn enqueue(&self, payload: Vec<u8>) -> QueueResult<EntryId> {
        let id = EntryId::new();
        let record = EntryRecord::new(id.clone(), payload);
        let at = record.created_at;

        {
            let mut state = self.state.lock();
            state.entries.insert(id.clone(), record);
            state.ready.push_back(id.clone());
        }
        self.counters.record_enqueued();
        self.available.notify_waiters();

        trace!(queue = %self.options.name, entry_id = %id, "entry enqueued");
        self.emit_all(vec![QueueEvent::Enqueued { id: id.clone(), at }]).await;
        Ok(id)
    }

    async fn dequeue(&self, wait: Duration) -> QueueResult<Option<LeasedEntry>> {
        // `None` when the wait is too long to represent: no deadline
        let deadline = Instant::now().checked_add(wait);

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Utc::now();
            let (leased, reclaimed, next_change) = {
                let mut state = self.state.lock();
                let reclaimed = state.reclaim_expired(&self.options, now);
                let leased = state.take_available(&self.options, now);
                let next_change = if leased.is_none() { state.next_change() } else { None };
                (leased, reclaimed, next_change)
            };

            let timeouts = reclaimed
                .iter()
                .filter(|e| matches!(e, QueueEvent::LeaseExpired { .. }))
                .count();
            for _ in 0..timeouts {
                self.counters.record_timeout();
            }
            self.emit_all(reclaimed).await;

            if let Some(entry) = leased {
                self.counters.record_dequeued();
                debug!(queue = %self.options.name, entry_id = %entry.id, attempts = entry.attempts, "entry dequeued");
                self.emit_all(vec![QueueEvent::Dequeued {
                    id: entry.id.clone(),
                    attempts: entry.attempts,
                    lease_until: entry.lease_until,
                    at: now,
                }])
                .await;
                return Ok(Some(entry));
            }

            let mut sleep_for = match deadline {
                Some(deadline) => {
                    let current = Instant::now();
                    if current >= deadline {
                        return Ok(None);
                    }
                    deadline - current
                }
                None => wait,
            };
            if let Some(at) = next_change {
                let until = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                sleep_for = sleep_for.min(until.saturating_add(Duration::from_millis(1)));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    async fn renew_lock(&self, id: &EntryId, token: &LeaseToken, extension: Duration) -> QueueResult<bool> {
        let now = Utc::now();
        let lease_until = add_duration(now, extension);
        let renewed = {
            let mut state = self.state.lock();
            match state.entries.get_mut(id) {
                Some(record) if record.is_owned_by(token, now) => {
                    record.extend_lease(lease_until);
                    true
                }
                _ => false,
            }
        };

        if renewed {
            trace!(queue = %self.options.name, entry_id = %id, "lease renewed");
            self.emit_all(vec![QueueEvent::LockRenewed { id: id.clone(), lease_until, at: now }]).await;
        } else {
            debug!(queue = %self.options.name, entry_id = %id, "renew rejected, lease no longer owned");
        }
        Ok(renewed)
    }

    async fn complete(&self, id: &EntryId, token: &LeaseToken) -> QueueResult<bool> {
        let now = Utc::now();
        let completed = {
            let mut state = self.state.lock();
            let owned = state.entries.get(id).is_some_and(|r| r.is_owned_by(token, now));
            if owned {
                state.entries.remove(id);
            }
            owned
        };

        if completed {
            self.counters.record_completed();
            debug!(queue = %self.options.name, entry_id = %id, "entry completed");
            self.emit_all(vec![QueueEvent::Completed { id: id.clone(), at: now }]).await;
        } else {
            debug!(queue = %self.options.name, entry_id = %id, "complete rejected, lease no longer owned");
        }
        Ok(completed)
    }

    async fn abandon(&self, id: &EntryId, token: &LeaseToken, reason: Option<String>) -> QueueResult<bool> {
        let now = Utc::now();
        let with_error = reason.is_some();
        let events = {
            let mut state = self.state.lock();
            let owned = state.entries.get(id).is_some_and(|r| r.is_owned_by(token, now));
            if !owned {
                None
            } else {
                Some(state.release(id, &self.options, reason, false, now))
            }
        };

        let Some(events) = events else {
            debug!(queue = %self.options.name, entry_id = %id, "abandon rejected, lease no longer owned");
            return Ok(false);
        };

        self.counters.record_abandoned(with_error);
        if events.iter().any(|e| matches!(e, QueueEvent::DeadLettered { .. })) {
            warn!(queue = %self.options.name, entry_id = %id, "entry dead-lettered after exhausting attempts");
        } else {
            debug!(queue = %self.options.name, entry_id = %id, "entry abandoned");
            self.available.notify_waiters();
        }
        self.emit_all(events).await;
        Ok(true)
    }

    async fn dead_letters(&self) -> QueueResult<Vec<DeadLetter>> {
        let state = self.state.lock();
        let letters = state
            .dead
            .iter()
            .filter_map(|id| state.entries.get(id))
            .filter_map(|record| match record.state {
                EntryState::DeadLettered { at } => Some(DeadLetter {
                    id: record.id.clone(),
                    payload: record.payload.clone(),
                    attempts: record.attempts,
                    reason: record.last_error.clone(),
                    created_at: record.created_at,
                    dead_lettered_at: at,
                }),
                _ => None,
            })
            .collect();
        Ok(letters)
    }

    async fn retry_dead_letter(&self, id: &EntryId) -> QueueResult<bool> {
        let now = Utc::now();
        let revived = {
            let mut state = self.state.lock();
            let parked = matches!(
                state.entries.get(id).map(|r| &r.state),
                Some(EntryState::DeadLettered { .. })
            );
            if parked {
                state.dead.retain(|dead| dead != id);
                if let Some(record) = state.entries.get_mut(id) {
                    record.revive(now);
                }
                state.ready.push_back(id.clone());
            }
            parked
        };

        if revived {
            debug!(queue = %self.options.name, entry_id = %id, "dead letter re-enqueued");
            self.counters.record_enqueued();
            self.available.notify_waiters();
            self.emit_all(vec![QueueEvent::Enqueued { id: id.clone(), at: now }]).await;
        }
        Ok(revived)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let (queued, working, dead) = self.state.lock().counts();
        Ok(self.counters.snapshot(queued, working, dead))
    }

    async fn delete_queue(&self) -> QueueResult<()> {
        *self.state.lock() = QueueState::default();
        self.counters.reset();
        debug!(queue = %self.options.name, "queue deleted");
        Ok(())
    }

    fn events(&self) -> &EventHub<QueueEvent> {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(max_attempts: u32) -> MemoryBackend {
        MemoryBackend::new(
            QueueOptions::named("test")
                .with_max_attempts(max_attempts)
                .with_visibility_timeout(Duration::from_secs(30)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_dequeue() {
        let backend = backend(3);
        let id = backend.enqueue(b"payload".to_vec()).await.unwrap();

        let leased = backend.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(leased.id, id);
        assert_eq!(leased.attempts, 1);
        assert_eq!(leased.payload, b"payload");
        assert!(leased.lease_until > Utc::now());
    }

    #[tokio::test]
    async fn test_dequeue_with_unbounded_wait() {
        let backend = backend(3);
        let ready = backend.enqueue(b"ready".to_vec()).await.unwrap();
        let leased = backend.dequeue(Duration::MAX).await.unwrap().unwrap();
        assert_eq!(leased.id, ready);

        // empty queue: blocks until the next enqueue
        let waiter = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.dequeue(Duration::MAX).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let later = backend.enqueue(b"later".to_vec()).await.unwrap();

        let leased = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(leased.id, later);
    }

    #[tokio::test]
    async fn test_dequeue_is_fifo() {
        let backend = backend(3);
        let first = backend.enqueue(b"1".to_vec()).await.unwrap();
        let second = backend.enqueue(b"2".to_vec()).await.unwrap();

        assert_eq!(backend.dequeue(Duration::ZERO).await.unwrap().unwrap().id, first);
        assert_eq!(backend.dequeue(Duration::ZERO).await.unwrap().unwrap().id, second);
        assert!(backend.dequeue(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blocked_dequeue_wakes_on_enqueue() {
        let backend = backend(3);
        let producer = backend.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            producer.enqueue(b"late".to_vec()).await.unwrap();
        });

        let started = std::time::Instant::now();
        let leased = backend.dequeue(Duration::from_secs(5)).await.unwrap();
        assert!(leased.is_some());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_dequeue_times_out_when_empty() {
        let backend = backend(3);
        let started = std::time::Instant::now();
        assert!(backend.dequeue(Duration::from_millis(50)).await.unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_abandon_after_max_attempts_dead_letters() {
        let backend = backend(1);
        let id = backend.enqueue(b"x".to_vec()).await.unwrap();
        let leased = backend.dequeue(Duration::ZERO).await.unwrap().unwrap();

        assert!(backend.abandon(&id, &leased.lease_token, Some("boom".into())).await.unwrap());

        let record = backend.record(&id).unwrap();
        assert!(matches!(record.state, EntryState::DeadLettered { .. }));
        let letters = backend.dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason.as_deref(), Some("boom"));
        assert!(backend.dequeue(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_delay_hides_entry() {
        let backend = MemoryBackend::new(
            QueueOptions::named("delayed").with_retry_delay(Duration::from_millis(80), Duration::from_secs(1)),
        )
        .unwrap();
        let id = backend.enqueue(b"x".to_vec()).await.unwrap();
        let leased = backend.dequeue(Duration::ZERO).await.unwrap().unwrap();
        backend.abandon(&id, &leased.lease_token, None).await.unwrap();

        assert!(backend.dequeue(Duration::ZERO).await.unwrap().is_none());
        let again = backend.dequeue(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn test_delete_queue_clears_everything() {
        let backend = backend(3);
        backend.enqueue(b"x".to_vec()).await.unwrap();
        backend.delete_queue().await.unwrap();

        assert_eq!(backend.stats().await.unwrap(), QueueStats::default());
    }
}
