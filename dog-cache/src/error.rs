use dog_core::CoreError;
use thiserror::Error;

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Infrastructure errors for cache operations
///
/// A missing key or a failed conditional write is not an error; those come
/// back as `None` / `false`.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("Value stored at '{key}' is not an integer")]
    NotANumber { key: String },

    #[error("Counter at '{key}' overflowed")]
    Overflow { key: String },

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl CacheError {
    /// True when the backend itself failed (as opposed to bad data)
    pub fn is_backend_failure(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Core(core) => core.is_transport(),
            _ => false,
        }
    }
}
