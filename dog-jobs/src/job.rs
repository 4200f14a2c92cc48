use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dog_queue::{EntryId, QueueEntry};
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::sync::CancellationToken;

use crate::JobResult;

/// Everything a job sees about the entry it is processing
pub struct JobContext<T> {
    entry: Arc<QueueEntry<T>>,
    queue_name: String,
    lock_resource: Option<String>,
    cancellation: CancellationToken,
}

impl<T> Clone for JobContext<T> {
    fn clone(&self) -> Self {
        Self {
            entry: self.entry.clone(),
            queue_name: self.queue_name.clone(),
            lock_resource: self.lock_resource.clone(),
            cancellation: self.cancellation.clone(),
        }
    }
}

impl<T> JobContext<T> {
    pub fn new(
        entry: Arc<QueueEntry<T>>,
        queue_name: impl Into<String>,
        lock_resource: Option<String>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            entry,
            queue_name: queue_name.into(),
            lock_resource,
            cancellation,
        }
    }

    pub fn value(&self) -> &T {
        &self.entry.value
    }

    pub fn entry(&self) -> &QueueEntry<T> {
        &self.entry
    }

    pub fn entry_id(&self) -> &EntryId {
        &self.entry.id
    }

    /// Delivery number, 1 on the first attempt
    pub fn attempts(&self) -> u32 {
        self.entry.attempts
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.entry.enqueued_at
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Resource locked for this run, if the job asked for one
    pub fn lock_resource(&self) -> Option<&str> {
        self.lock_resource.as_deref()
    }

    /// Signalled on shutdown or once ownership of the entry or lock is lost.
    ///
    /// Long-running work should check it at safe points and stop promptly.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Completes when cancellation is signalled
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

/// Application logic run for each queue entry.
///
/// ```rust
/// use async_trait::async_trait;
/// use dog_jobs::{JobContext, JobResult, QueueJob};
///
/// struct Resize;
///
/// #[async_trait]
/// impl QueueJob for Resize {
///     type Item = String;
///
///     async fn process(&self, ctx: JobContext<String>) -> JobResult {
///         if ctx.is_cancelled() {
///             return JobResult::cancelled("stopping");
///         }
///         JobResult::success_with(format!("resized {}", ctx.value()))
///     }
///
///     fn lock_key(&self, image: &String) -> Option<String> {
///         Some(format!("image:{image}"))
///     }
/// }
/// ```
#[async_trait]
pub trait QueueJob: Send + Sync + 'static {
    type Item: Serialize + DeserializeOwned + Send + Sync + 'static;

    async fn process(&self, ctx: JobContext<Self::Item>) -> JobResult;

    /// Resource to lock while processing `item`; `None` runs unlocked
    fn lock_key(&self, _item: &Self::Item) -> Option<String> {
        None
    }
}
