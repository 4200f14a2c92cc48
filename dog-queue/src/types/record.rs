use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EntryId, LeaseToken};

/// Where an entry sits in its delivery lifecycle.
///
/// Completed entries are removed, so they never show up here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    /// Waiting for a consumer (possibly not before `available_at`)
    Enqueued,

    /// Owned by the consumer holding the current lease token
    Dequeued { lease_until: DateTime<Utc> },

    /// Retained for inspection after exhausting its attempts
    DeadLettered { at: DateTime<Utc> },
}

impl EntryState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Dequeued { .. } => "dequeued",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }
}

/// Mutable runtime state of one entry, as stored by a backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRecord {
    pub id: EntryId,

    /// Serialized value, opaque to the backend
    pub payload: Vec<u8>,

    pub state: EntryState,

    /// Number of dequeues so far (1 on the first delivery)
    pub attempts: u32,

    pub created_at: DateTime<Utc>,

    /// Not handed out before this instant (retry delay)
    pub available_at: DateTime<Utc>,

    pub dequeued_at: Option<DateTime<Utc>>,

    /// Token of the latest dequeue, while dequeued
    pub lease_token: Option<LeaseToken>,

    /// Reason given by the last abandon or timeout
    pub last_error: Option<String>,
}

impl EntryRecord {
    /// Create a new enqueued record
    pub fn new(id: EntryId, payload: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            id,
            payload,
            state: EntryState::Enqueued,
            attempts: 0,
            created_at: now,
            available_at: now,
            dequeued_at: None,
            lease_token: None,
            last_error: None,
        }
    }

    /// Ready to be handed to a consumer at `now`
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, EntryState::Enqueued) && self.available_at <= now
    }

    /// Dequeued, but the visibility deadline has passed
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, EntryState::Dequeued { lease_until } if lease_until <= now)
    }

    /// Whether `token` currently owns this entry.
    ///
    /// Ownership ends at the visibility deadline even before the sweep has
    /// reclaimed the entry.
    pub fn is_owned_by(&self, token: &LeaseToken, now: DateTime<Utc>) -> bool {
        match self.state {
            EntryState::Dequeued { lease_until } => {
                lease_until > now && self.lease_token.as_ref() == Some(token)
            }
            _ => false,
        }
    }

    /// Hand the entry to a new consumer
    pub fn start_lease(&mut self, lease_token: LeaseToken, lease_until: DateTime<Utc>, now: DateTime<Utc>) {
        self.state = EntryState::Dequeued { lease_until };
        self.attempts += 1;
        self.lease_token = Some(lease_token);
        self.dequeued_at = Some(now);
    }

    /// Move the visibility deadline
    pub fn extend_lease(&mut self, lease_until: DateTime<Utc>) {
        self.state = EntryState::Dequeued { lease_until };
    }

    /// Put the entry back in line, not visible before `available_at`
    pub fn requeue(&mut self, available_at: DateTime<Utc>, error: Option<String>) {
        self.state = EntryState::Enqueued;
        self.available_at = available_at;
        self.lease_token = None;
        if error.is_some() {
            self.last_error = error;
        }
    }

    /// Park the entry in the dead-letter area
    pub fn dead_letter(&mut self, now: DateTime<Utc>, error: Option<String>) {
        self.state = EntryState::DeadLettered { at: now };
        self.lease_token = None;
        if error.is_some() {
            self.last_error = error;
        }
    }

    /// Operator retry: fresh attempts, available immediately
    pub fn revive(&mut self, now: DateTime<Utc>) {
        self.state = EntryState::Enqueued;
        self.attempts = 0;
        self.available_at = now;
        self.dequeued_at = None;
    }
}

/// A raw entry handed out by [`crate::QueueBackend::dequeue`]
#[derive(Debug, Clone)]
pub struct LeasedEntry {
    pub id: EntryId,
    pub payload: Vec<u8>,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub dequeued_at: DateTime<Utc>,
    pub lease_token: LeaseToken,
    pub lease_until: DateTime<Utc>,
}

impl LeasedEntry {
    pub(crate) fn from_record(record: &EntryRecord, lease_token: LeaseToken, lease_until: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: record.id.clone(),
            payload: record.payload.clone(),
            attempts: record.attempts,
            enqueued_at: record.created_at,
            dequeued_at: now,
            lease_token,
            lease_until,
        }
    }
}

/// An entry parked after exhausting its attempts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: EntryId,
    pub payload: Vec<u8>,
    pub attempts: u32,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}
