use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dog_core::{EventHub, JsonSerializer, Serializer};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{instrument, warn};

use crate::{
    backend::QueueBackend, DeadLetter, EntryId, LeaseToken, LeasedEntry, QueueEvent, QueueResult,
    QueueStats,
};

#[cfg(feature = "memory")]
use crate::{backend::memory::MemoryBackend, QueueOptions};

/// A dequeued value together with its lease.
///
/// Hold on to it until the work is done: `complete`, `abandon` and
/// `renew_lock` prove ownership with the lease token inside.
#[derive(Debug, Clone)]
pub struct QueueEntry<T> {
    pub id: EntryId,
    pub value: T,
    /// Deliveries so far, including this one
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub dequeued_at: DateTime<Utc>,
    /// Visibility deadline as of the last dequeue or renewal
    pub lease_until: DateTime<Utc>,
    token: LeaseToken,
}

impl<T> QueueEntry<T> {
    pub fn lease_token(&self) -> &LeaseToken {
        &self.token
    }

    /// Whether the visibility deadline has passed locally
    pub fn lease_expired(&self) -> bool {
        self.lease_until <= Utc::now()
    }

    fn from_leased(leased: LeasedEntry, value: T) -> Self {
        Self {
            id: leased.id,
            value,
            attempts: leased.attempts,
            enqueued_at: leased.enqueued_at,
            dequeued_at: leased.dequeued_at,
            lease_until: leased.lease_until,
            token: leased.lease_token,
        }
    }
}

/// Typed at-least-once queue.
///
/// Values are serialized with `S` and stored by a [`QueueBackend`]. Clones
/// share the same backend.
pub struct Queue<T, S = JsonSerializer> {
    backend: Arc<dyn QueueBackend>,
    serializer: S,
    _marker: PhantomData<fn() -> T>,
}

impl<T, S: Clone> Clone for Queue<T, S> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            serializer: self.serializer.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Queue<T, JsonSerializer>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self::with_serializer(backend, JsonSerializer)
    }

    /// Queue over a fresh [`MemoryBackend`]
    #[cfg(feature = "memory")]
    pub fn in_memory(options: QueueOptions) -> QueueResult<Self> {
        Ok(Self::new(Arc::new(MemoryBackend::new(options)?)))
    }
}

impl<T, S> Queue<T, S>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    S: Serializer,
{
    pub fn with_serializer(backend: Arc<dyn QueueBackend>, serializer: S) -> Self {
        Self {
            backend,
            serializer,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// Lifecycle notifications for this queue
    pub fn events(&self) -> &EventHub<QueueEvent> {
        self.backend.events()
    }

    #[instrument(skip(self, value), fields(queue = %self.name()))]
    pub async fn enqueue(&self, value: &T) -> QueueResult<EntryId> {
        let payload = self.serializer.to_bytes(value)?;
        self.backend.enqueue(payload).await
    }

    /// Wait up to `wait` for an entry; `None` when nothing arrived in time.
    ///
    /// A payload that no longer decodes is abandoned with the decode error as
    /// its reason, so it ends up dead-lettered instead of blocking the line.
    #[instrument(skip(self), fields(queue = %self.name()))]
    pub async fn dequeue(&self, wait: Duration) -> QueueResult<Option<QueueEntry<T>>> {
        let Some(leased) = self.backend.dequeue(wait).await? else {
            return Ok(None);
        };

        match self.serializer.from_bytes::<T>(&leased.payload) {
            Ok(value) => Ok(Some(QueueEntry::from_leased(leased, value))),
            Err(err) => {
                warn!(entry_id = %leased.id, error = %err, "payload failed to decode, abandoning");
                self.backend
                    .abandon(&leased.id, &leased.lease_token, Some(err.to_string()))
                    .await?;
                Err(err.into())
            }
        }
    }

    /// Extend the visibility deadline to now + `extension`.
    ///
    /// `false` once the lease is lost; the entry must not be worked on then.
    #[instrument(skip(self, entry), fields(queue = %self.name(), entry_id = %entry.id))]
    pub async fn renew_lock(&self, entry: &mut QueueEntry<T>, extension: Duration) -> QueueResult<bool> {
        let renewed = self.backend.renew_lock(&entry.id, &entry.token, extension).await?;
        if renewed {
            entry.lease_until = crate::options::add_duration(Utc::now(), extension);
        }
        Ok(renewed)
    }

    #[instrument(skip(self, entry), fields(queue = %self.name(), entry_id = %entry.id))]
    pub async fn complete(&self, entry: &QueueEntry<T>) -> QueueResult<bool> {
        self.backend.complete(&entry.id, &entry.token).await
    }

    #[instrument(skip(self, entry), fields(queue = %self.name(), entry_id = %entry.id))]
    pub async fn abandon(&self, entry: &QueueEntry<T>) -> QueueResult<bool> {
        self.backend.abandon(&entry.id, &entry.token, None).await
    }

    /// Abandon, recording why the delivery failed
    #[instrument(skip(self, entry, reason), fields(queue = %self.name(), entry_id = %entry.id))]
    pub async fn abandon_with_reason(&self, entry: &QueueEntry<T>, reason: impl Into<String> + Send) -> QueueResult<bool> {
        self.backend
            .abandon(&entry.id, &entry.token, Some(reason.into()))
            .await
    }

    pub async fn dead_letters(&self) -> QueueResult<Vec<DeadLetter>> {
        self.backend.dead_letters().await
    }

    /// Decode a dead letter's payload
    pub fn decode(&self, letter: &DeadLetter) -> QueueResult<T> {
        Ok(self.serializer.from_bytes(&letter.payload)?)
    }

    #[instrument(skip(self), fields(queue = %self.name()))]
    pub async fn retry_dead_letter(&self, id: &EntryId) -> QueueResult<bool> {
        self.backend.retry_dead_letter(id).await
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        self.backend.stats().await
    }

    #[instrument(skip(self), fields(queue = %self.name()))]
    pub async fn delete_queue(&self) -> QueueResult<()> {
        self.backend.delete_queue().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QueueError;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Email {
        to: String,
    }

    fn email(to: &str) -> Email {
        Email { to: to.to_string() }
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let queue = Queue::<Email>::in_memory(QueueOptions::named("mail")).unwrap();
        let id = queue.enqueue(&email("a@example.com")).await.unwrap();

        let entry = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(entry.id, id);
        assert_eq!(entry.value, email("a@example.com"));
        assert_eq!(entry.attempts, 1);
        assert!(!entry.lease_expired());
        assert!(queue.complete(&entry).await.unwrap());
        assert_eq!(queue.name(), "mail");
    }

    #[tokio::test]
    async fn test_renew_moves_local_deadline() {
        let queue = Queue::<Email>::in_memory(
            QueueOptions::named("mail").with_visibility_timeout(Duration::from_secs(1)),
        )
        .unwrap();
        queue.enqueue(&email("a@example.com")).await.unwrap();

        let mut entry = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let before = entry.lease_until;
        assert!(queue.renew_lock(&mut entry, Duration::from_secs(60)).await.unwrap());
        assert!(entry.lease_until > before);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_abandoned() {
        let backend: Arc<dyn QueueBackend> =
            Arc::new(MemoryBackend::new(QueueOptions::named("mail").with_max_attempts(1)).unwrap());
        backend.enqueue(b"{not json".to_vec()).await.unwrap();

        let queue = Queue::<Email>::new(backend);
        let result = queue.dequeue(Duration::ZERO).await;
        assert!(matches!(result, Err(QueueError::Serialization(_))));

        let letters = queue.dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].reason.is_some());
    }

    #[tokio::test]
    async fn test_decode_dead_letter() {
        let queue = Queue::<Email>::in_memory(QueueOptions::named("mail").with_max_attempts(1)).unwrap();
        queue.enqueue(&email("b@example.com")).await.unwrap();
        let entry = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        queue.abandon_with_reason(&entry, "smtp down").await.unwrap();

        let letters = queue.dead_letters().await.unwrap();
        assert_eq!(queue.decode(&letters[0]).unwrap(), email("b@example.com"));
        assert_eq!(letters[0].reason.as_deref(), Some("smtp down"));
    }
}
