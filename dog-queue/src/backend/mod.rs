#[cfg(feature = "memory")]
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use dog_core::EventHub;

use crate::{DeadLetter, EntryId, LeaseToken, LeasedEntry, QueueEvent, QueueResult, QueueStats};

/// Storage primitives for one queue, over opaque payload bytes.
///
/// Every ownership-checked call takes the lease token from the dequeue that
/// handed the entry out. A token that no longer owns the entry (superseded,
/// expired or reclaimed) makes the call return `false` and change nothing.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Queue name, for logs
    fn name(&self) -> &str;

    /// Append an entry to the back of the line
    async fn enqueue(&self, payload: Vec<u8>) -> QueueResult<EntryId>;

    /// Wait up to `wait` for an available entry and lease it.
    ///
    /// `Ok(None)` when nothing became available in time.
    async fn dequeue(&self, wait: Duration) -> QueueResult<Option<LeasedEntry>>;

    /// Push the visibility deadline to now + `extension`
    async fn renew_lock(&self, id: &EntryId, token: &LeaseToken, extension: Duration) -> QueueResult<bool>;

    /// Remove the entry for good
    async fn complete(&self, id: &EntryId, token: &LeaseToken) -> QueueResult<bool>;

    /// Give the entry back for another delivery, or dead-letter it once its
    /// attempts are used up
    async fn abandon(&self, id: &EntryId, token: &LeaseToken, reason: Option<String>) -> QueueResult<bool>;

    /// Entries parked after exhausting their attempts, oldest first
    async fn dead_letters(&self) -> QueueResult<Vec<DeadLetter>>;

    /// Re-enqueue a dead letter with its attempts reset.
    ///
    /// `Ok(false)` when `id` is not in the dead-letter area.
    async fn retry_dead_letter(&self, id: &EntryId) -> QueueResult<bool>;

    async fn stats(&self) -> QueueResult<QueueStats>;

    /// Drop every entry, dead letters included, and reset the totals
    async fn delete_queue(&self) -> QueueResult<()>;

    /// Lifecycle notifications for this queue
    fn events(&self) -> &EventHub<QueueEvent>;
}
