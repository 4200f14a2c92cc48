use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::EntryId;

/// Lifecycle notifications emitted by a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueEvent {
    Enqueued {
        id: EntryId,
        at: DateTime<Utc>,
    },

    Dequeued {
        id: EntryId,
        attempts: u32,
        lease_until: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    LockRenewed {
        id: EntryId,
        lease_until: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    Completed {
        id: EntryId,
        at: DateTime<Utc>,
    },

    /// Given back by its consumer and put back in line
    Abandoned {
        id: EntryId,
        attempts: u32,
        reason: Option<String>,
        retry_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    /// Reclaimed by the sweep after its visibility deadline passed
    LeaseExpired {
        id: EntryId,
        attempts: u32,
        at: DateTime<Utc>,
    },

    DeadLettered {
        id: EntryId,
        attempts: u32,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
}

impl QueueEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Dequeued { .. } => "dequeued",
            Self::LockRenewed { .. } => "lock_renewed",
            Self::Completed { .. } => "completed",
            Self::Abandoned { .. } => "abandoned",
            Self::LeaseExpired { .. } => "lease_expired",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }

    pub fn entry_id(&self) -> &EntryId {
        match self {
            Self::Enqueued { id, .. }
            | Self::Dequeued { id, .. }
            | Self::LockRenewed { id, .. }
            | Self::Completed { id, .. }
            | Self::Abandoned { id, .. }
            | Self::LeaseExpired { id, .. }
            | Self::DeadLettered { id, .. } => id,
        }
    }

    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Enqueued { at, .. }
            | Self::Dequeued { at, .. }
            | Self::LockRenewed { at, .. }
            | Self::Completed { at, .. }
            | Self::Abandoned { at, .. }
            | Self::LeaseExpired { at, .. }
            | Self::DeadLettered { at, .. } => at,
        }
    }
}
