//! # dog-queue: at-least-once work queue
//!
//! A [`Queue`] hands each entry to one consumer at a time. The consumer owns
//! the entry until its visibility deadline; it must `complete` it, `abandon`
//! it, or keep renewing the lease while it works. An entry whose lease runs
//! out goes back in line, and one that has used up `max_attempts` deliveries
//! is parked in the dead-letter area until an operator retries it.
//!
//! ```rust
//! use std::time::Duration;
//! use dog_queue::{Queue, QueueOptions};
//!
//! # tokio_test::block_on(async {
//! let queue = Queue::<String>::in_memory(QueueOptions::named("emails"))?;
//! queue.enqueue(&"hello".to_string()).await?;
//!
//! if let Some(entry) = queue.dequeue(Duration::from_secs(1)).await? {
//!     // ... do the work ...
//!     assert!(queue.complete(&entry).await?);
//! }
//! # Ok::<(), dog_queue::QueueError>(())
//! # }).unwrap();
//! ```
//!
//! Storage sits behind the [`QueueBackend`] trait; [`MemoryBackend`] is the
//! in-process implementation and ships with a [`LeaseReaper`] sweep.

pub mod backend;
pub mod error;
pub mod options;
pub mod queue;
pub mod types;

pub use backend::QueueBackend;
pub use error::{QueueError, QueueResult};
pub use options::QueueOptions;
pub use queue::{Queue, QueueEntry};
pub use types::{
    DeadLetter, EntryId, EntryRecord, EntryState, LeaseToken, LeasedEntry, QueueCounters, QueueEvent,
    QueueStats,
};

#[cfg(feature = "memory")]
pub use backend::memory::{LeaseReaper, MemoryBackend};
