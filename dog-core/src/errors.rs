use thiserror::Error;

/// Result type for dog-core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Failures raised by the shared building blocks.
///
/// Expected outcomes (nothing to deliver, no subscribers) are never
/// reported here; these are transport or data problems the caller has to
/// handle.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error("Serialization error ({serializer}): {message}")]
    Serialization {
        serializer: &'static str,
        message: String,
    },

    #[error("Message bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("Message bus is closed")]
    BusClosed,
}

impl CoreError {
    pub fn serialization(serializer: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Serialization {
            serializer,
            message: err.to_string(),
        }
    }

    /// True for failures caused by the transport rather than the data.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::BusUnavailable(_) | Self::BusClosed)
    }
}
