//! # dog-jobs: queue job runner
//!
//! [`QueueJobRunner`] ties a [`dog_queue::Queue`] to a [`QueueJob`]. For
//! every entry it dequeues it optionally locks a resource through a
//! [`dog_lock::LockProvider`], keeps the queue lease and the lock alive
//! while the job works, and completes or abandons the entry afterwards.
//! When a lease cannot be renewed the job's [`CancellationToken`] fires and
//! the entry is abandoned, never completed.
//!
//! ```rust
//! use async_trait::async_trait;
//! use dog_jobs::{JobContext, JobResult, QueueJob, QueueJobRunner, RunOptions};
//! use dog_queue::{Queue, QueueOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Greet;
//!
//! #[async_trait]
//! impl QueueJob for Greet {
//!     type Item = String;
//!
//!     async fn process(&self, ctx: JobContext<String>) -> JobResult {
//!         JobResult::success_with(format!("hello {}", ctx.value()))
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let queue = Queue::<String>::in_memory(QueueOptions::named("greetings")).unwrap();
//! queue.enqueue(&"world".to_string()).await.unwrap();
//!
//! let runner = QueueJobRunner::new(queue, Greet);
//! let summary = runner.run_continuous(RunOptions::until_empty(), &CancellationToken::new()).await;
//! assert_eq!(summary.succeeded, 1);
//! # });
//! ```
//!
//! [`WorkItemHandlers`] layers kind-tagged work items on one queue.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

pub mod error;
pub mod job;
pub mod options;
pub mod result;
pub mod runner;
#[cfg(feature = "tracing-basic")]
pub mod telemetry;
pub mod work_item;
pub mod worker;

pub use error::{JobError, JobsResult};
pub use job::{JobContext, QueueJob};
pub use options::{JobRunnerOptions, RunOptions};
pub use result::JobResult;
pub use runner::{QueueJobRunner, RunSummary};
#[cfg(feature = "tracing-basic")]
pub use telemetry::init_tracing;
pub use work_item::{
    WorkItemContext, WorkItemData, WorkItemHandler, WorkItemHandlers, WorkItemJob, WorkItemStatus,
    WORK_ITEM_STATUS_TOPIC,
};
pub use worker::WorkerHandle;
