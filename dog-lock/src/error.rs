use dog_cache::CacheError;
use dog_core::CoreError;
use thiserror::Error;

pub type LockResult<T> = Result<T, LockError>;

/// Infrastructure failures while coordinating locks.
///
/// Contention, acquire timeouts and lost ownership are reported as
/// `None` / `false`, never through this type.
#[derive(Error, Debug, Clone)]
pub enum LockError {
    #[error("Lock backend error: {0}")]
    Cache(#[from] CacheError),

    #[error("Lock notification error: {0}")]
    Bus(#[from] CoreError),

    #[error("Invalid lock options: {0}")]
    InvalidOptions(String),
}
