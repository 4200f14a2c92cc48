use dog_core::CoreError;
use thiserror::Error;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Infrastructure errors for queue operations
///
/// An empty queue, a stale lease token or an entry reclaimed by the sweep
/// are expected outcomes and come back as `None` / `false`.
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] CoreError),

    #[error("Queue backend unavailable: {0}")]
    Backend(String),

    #[error("Invalid queue options: {0}")]
    InvalidOptions(String),
}
