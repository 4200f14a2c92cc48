use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{JobError, JobsResult, RunSummary};

/// Handle for managing a background worker started with
/// [`QueueJobRunner::start`](crate::QueueJobRunner::start)
pub struct WorkerHandle {
    cancel: CancellationToken,
    join_handle: JoinHandle<RunSummary>,
}

impl WorkerHandle {
    pub(crate) fn new(cancel: CancellationToken, join_handle: JoinHandle<RunSummary>) -> Self {
        Self { cancel, join_handle }
    }

    /// Token the worker and its in-flight job observe
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the worker loop has stopped on its own
    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Gracefully shutdown the worker.
    ///
    /// The job in flight sees cancellation and its entry is abandoned unless
    /// it finishes successfully first.
    pub async fn shutdown(self) -> JobsResult<RunSummary> {
        self.cancel.cancel();
        let summary = self
            .join_handle
            .await
            .map_err(|e| JobError::Internal(format!("Worker join error: {}", e)))?;
        info!(processed = summary.processed(), "worker stopped");
        Ok(summary)
    }

    /// Wait for a worker started with a finite [`RunOptions`](crate::RunOptions)
    pub async fn join(self) -> JobsResult<RunSummary> {
        self.join_handle
            .await
            .map_err(|e| JobError::Internal(format!("Worker join error: {}", e)))
    }
}
