use dog_core::CoreError;
use dog_lock::LockError;
use dog_queue::QueueError;
use thiserror::Error;

pub type JobsResult<T> = Result<T, JobError>;

/// Infrastructure failures while running jobs.
///
/// A failing job is not an error here: it comes back as
/// [`JobResult::Failed`](crate::JobResult::Failed).
#[derive(Error, Debug, Clone)]
pub enum JobError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Work item handler already registered for kind '{0}'")]
    DuplicateHandler(String),

    #[error("Invalid runner options: {0}")]
    InvalidOptions(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
