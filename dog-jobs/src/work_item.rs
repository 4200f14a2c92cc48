//! Typed work items over a single queue.
//!
//! Producers enqueue a [`WorkItemData`] tagged with the handler's kind and
//! version. One [`WorkItemJob`] drains the queue and dispatches each item to
//! the handler registered for its kind.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dog_core::{publish_message, CoreResult, JsonSerializer, MessageBus, Serializer};
use dog_queue::{EntryId, Queue};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{JobContext, JobError, JobResult, JobsResult, QueueJob};

pub const WORK_ITEM_STATUS_TOPIC: &str = "dog.workitems.status";

/// Envelope stored on the work item queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemData {
    pub id: String,
    /// Handler kind the payload belongs to
    pub kind: String,
    pub version: u32,
    /// Handler payload, JSON encoded
    pub payload: Vec<u8>,
    /// Publish [`WorkItemStatus`] updates while the item runs
    pub send_progress: bool,
    pub created_at: DateTime<Utc>,
}

impl WorkItemData {
    /// Envelope for a payload of handler `H`
    pub fn new<H: WorkItemHandler>(payload: &H::Payload) -> CoreResult<Self> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            kind: H::KIND.to_string(),
            version: H::VERSION,
            payload: JsonSerializer.to_bytes(payload)?,
            send_progress: false,
            created_at: Utc::now(),
        })
    }

    pub fn with_progress(mut self) -> Self {
        self.send_progress = true;
        self
    }
}

/// Progress report published on [`WORK_ITEM_STATUS_TOPIC`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemStatus {
    pub work_item_id: String,
    pub kind: String,
    /// Percent complete, 0..=100
    pub progress: u8,
    pub message: Option<String>,
}

/// What a handler sees while running one item
pub struct WorkItemContext {
    work_item_id: String,
    kind: String,
    attempts: u32,
    lock_resource: Option<String>,
    cancellation: CancellationToken,
    status_bus: Option<Arc<dyn MessageBus>>,
    status_topic: String,
}

impl WorkItemContext {
    pub fn work_item_id(&self) -> &str {
        &self.work_item_id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn lock_resource(&self) -> Option<&str> {
        self.lock_resource.as_deref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Publish a progress update when the item asked for them and a bus is
    /// configured. Delivery is best effort.
    pub async fn report_progress(&self, progress: u8, message: Option<&str>) {
        let Some(bus) = &self.status_bus else {
            return;
        };
        let status = WorkItemStatus {
            work_item_id: self.work_item_id.clone(),
            kind: self.kind.clone(),
            progress: progress.min(100),
            message: message.map(str::to_string),
        };
        if let Err(err) = publish_message(bus.as_ref(), &JsonSerializer, &self.status_topic, &status).await {
            warn!(work_item_id = %self.work_item_id, error = %err, "failed to publish work item progress");
        }
    }
}

/// Handler for one kind of work item
#[async_trait]
pub trait WorkItemHandler: Send + Sync + 'static {
    /// Tag stamped on enqueued items and used for dispatch
    const KIND: &'static str;

    /// Newest payload version this handler understands
    const VERSION: u32 = 1;

    type Payload: Serialize + DeserializeOwned + Send + Sync + 'static;

    async fn handle(&self, ctx: &WorkItemContext, payload: Self::Payload) -> JobResult;

    /// Resource to lock while handling `payload`
    fn lock_key(&self, _payload: &Self::Payload) -> Option<String> {
        None
    }
}

/// Type-erased handler for runtime dispatch
#[async_trait]
trait ErasedHandler: Send + Sync {
    fn version(&self) -> u32;

    fn lock_key(&self, payload: &[u8]) -> Option<String>;

    async fn handle(&self, ctx: &WorkItemContext, payload: &[u8]) -> JobResult;
}

struct TypedHandler<H> {
    handler: H,
}

#[async_trait]
impl<H: WorkItemHandler> ErasedHandler for TypedHandler<H> {
    fn version(&self) -> u32 {
        H::VERSION
    }

    fn lock_key(&self, payload: &[u8]) -> Option<String> {
        let payload: H::Payload = JsonSerializer.from_bytes(payload).ok()?;
        self.handler.lock_key(&payload)
    }

    async fn handle(&self, ctx: &WorkItemContext, payload: &[u8]) -> JobResult {
        match JsonSerializer.from_bytes::<H::Payload>(payload) {
            Ok(payload) => self.handler.handle(ctx, payload).await,
            Err(err) => JobResult::failed_with(
                format!("payload for work item kind '{}' failed to decode", H::KIND),
                err.into(),
            ),
        }
    }
}

/// Registry of work item handlers keyed by kind
pub struct WorkItemHandlers {
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
    status_bus: Option<Arc<dyn MessageBus>>,
    status_topic: String,
}

impl Default for WorkItemHandlers {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkItemHandlers {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            status_bus: None,
            status_topic: WORK_ITEM_STATUS_TOPIC.to_string(),
        }
    }

    /// Bus progress reports are published on
    pub fn with_status_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.status_bus = Some(bus);
        self
    }

    pub fn with_status_topic(mut self, topic: impl Into<String>) -> Self {
        self.status_topic = topic.into();
        self
    }

    /// Register the handler for `H::KIND`
    pub fn register<H: WorkItemHandler>(&mut self, handler: H) -> JobsResult<()> {
        if self.handlers.contains_key(H::KIND) {
            return Err(JobError::DuplicateHandler(H::KIND.to_string()));
        }
        self.handlers.insert(H::KIND, Arc::new(TypedHandler { handler }));
        info!(kind = H::KIND, version = H::VERSION, "registered work item handler");
        Ok(())
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Stamp `payload` with `H`'s kind and version and enqueue it
    pub async fn enqueue<H, S>(&self, queue: &Queue<WorkItemData, S>, payload: &H::Payload) -> JobsResult<EntryId>
    where
        H: WorkItemHandler,
        S: Serializer,
    {
        let data = WorkItemData::new::<H>(payload)?;
        self.enqueue_data(queue, &data).await
    }

    /// Enqueue a prepared envelope
    pub async fn enqueue_data<S: Serializer>(
        &self,
        queue: &Queue<WorkItemData, S>,
        data: &WorkItemData,
    ) -> JobsResult<EntryId> {
        let id = queue.enqueue(data).await?;
        debug!(work_item_id = %data.id, kind = %data.kind, entry_id = %id, "work item enqueued");
        Ok(id)
    }

    /// Job dispatching items to these handlers
    pub fn into_job(self) -> WorkItemJob {
        WorkItemJob {
            handlers: Arc::new(self),
        }
    }
}

/// [`QueueJob`] that dispatches [`WorkItemData`] by kind
#[derive(Clone)]
pub struct WorkItemJob {
    handlers: Arc<WorkItemHandlers>,
}

impl WorkItemJob {
    pub fn handlers(&self) -> &WorkItemHandlers {
        &self.handlers
    }
}

#[async_trait]
impl QueueJob for WorkItemJob {
    type Item = WorkItemData;

    async fn process(&self, ctx: JobContext<WorkItemData>) -> JobResult {
        let data = ctx.value();
        let Some(handler) = self.handlers.handlers.get(data.kind.as_str()) else {
            return JobResult::failed(format!("unknown work item kind '{}'", data.kind));
        };
        if data.version > handler.version() {
            return JobResult::failed(format!(
                "work item kind '{}' version {} is newer than supported version {}",
                data.kind,
                data.version,
                handler.version()
            ));
        }

        let status_bus = if data.send_progress {
            self.handlers.status_bus.clone()
        } else {
            None
        };
        let work = WorkItemContext {
            work_item_id: data.id.clone(),
            kind: data.kind.clone(),
            attempts: ctx.attempts(),
            lock_resource: ctx.lock_resource().map(str::to_string),
            cancellation: ctx.cancellation().clone(),
            status_bus,
            status_topic: self.handlers.status_topic.clone(),
        };

        let result = handler.handle(&work, &data.payload).await;
        if result.is_success() {
            work.report_progress(100, result.message()).await;
        }
        result
    }

    fn lock_key(&self, item: &WorkItemData) -> Option<String> {
        self.handlers.handlers.get(item.kind.as_str())?.lock_key(&item.payload)
    }
}
