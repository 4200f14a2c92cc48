use std::fmt;
use std::sync::Arc;

/// Outcome of one job run
#[derive(Debug, Clone)]
pub enum JobResult {
    /// Work done; the entry is completed
    Success { message: Option<String> },

    /// Business failure; the entry is abandoned for another attempt
    Failed {
        message: String,
        cause: Option<Arc<anyhow::Error>>,
    },

    /// Stopped through cancellation, either requested by the caller or
    /// raised after ownership of the entry or its lock was lost
    Cancelled { message: String },
}

impl JobResult {
    pub fn success() -> Self {
        Self::Success { message: None }
    }

    pub fn success_with(message: impl Into<String>) -> Self {
        Self::Success {
            message: Some(message.into()),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            cause: None,
        }
    }

    /// Failure carrying the error that caused it
    pub fn failed_with(message: impl Into<String>, cause: anyhow::Error) -> Self {
        Self::Failed {
            message: message.into(),
            cause: Some(Arc::new(cause)),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success { message } => message.as_deref(),
            Self::Failed { message, .. } | Self::Cancelled { message } => Some(message),
        }
    }

    /// Reason recorded on the queue entry when it is abandoned
    pub(crate) fn abandon_reason(&self) -> Option<String> {
        match self {
            Self::Success { .. } => None,
            Self::Failed { message, cause: Some(cause) } => Some(format!("{message}: {cause:#}")),
            Self::Failed { message, cause: None } => Some(message.clone()),
            Self::Cancelled { message } => Some(format!("cancelled: {message}")),
        }
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { message: None } => write!(f, "success"),
            Self::Success { message: Some(message) } => write!(f, "success: {message}"),
            Self::Failed { .. } => write!(f, "failed: {}", self.abandon_reason().unwrap_or_default()),
            Self::Cancelled { message } => write!(f, "cancelled: {message}"),
        }
    }
}

impl From<anyhow::Error> for JobResult {
    fn from(err: anyhow::Error) -> Self {
        Self::failed_with(err.to_string(), err)
    }
}

impl From<anyhow::Result<()>> for JobResult {
    fn from(result: anyhow::Result<()>) -> Self {
        match result {
            Ok(()) => Self::success(),
            Err(err) => err.into(),
        }
    }
}
