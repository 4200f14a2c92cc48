use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::{AcquireOptions, Lock, LockResult};

/// Lock coordinator boundary.
///
/// Mutual exclusion is enforced by the backing store's conditional writes,
/// so two processes sharing a backend never hold overlapping leases on one
/// resource.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Wait up to `options.acquire_timeout` for a grant on `resource`.
    ///
    /// `Ok(None)` means the timeout elapsed without a grant.
    async fn acquire(&self, resource: &str, options: AcquireOptions) -> LockResult<Option<Lock>>;

    /// Extend the lease by `extension` from now.
    ///
    /// `Ok(false)` means the lock is no longer ours and the resource must
    /// not be treated as exclusively held anymore.
    async fn renew(&self, lock: &mut Lock, extension: Duration) -> LockResult<bool>;

    /// Give the lock up; `Ok(false)` when it was no longer ours.
    async fn release(&self, lock: &Lock) -> LockResult<bool>;

    async fn is_locked(&self, resource: &str) -> LockResult<bool>;
}

#[async_trait]
pub trait LockProviderExt: LockProvider {
    /// Run `work` while holding `resource`.
    ///
    /// Returns `Ok(None)` without running `work` when no grant was obtained.
    /// The lock is released afterwards; a failed release is only logged
    /// since the lease expires on its own.
    async fn try_using<F, Fut, R>(
        &self,
        resource: &str,
        options: AcquireOptions,
        work: F,
    ) -> LockResult<Option<R>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = R> + Send,
        R: Send,
    {
        let Some(lock) = self.acquire(resource, options).await? else {
            return Ok(None);
        };

        let output = work().await;

        match self.release(&lock).await {
            Ok(true) => {}
            Ok(false) => warn!(resource, "lock lease expired before release"),
            Err(err) => warn!(resource, error = %err, "failed to release lock"),
        }
        Ok(Some(output))
    }
}

impl<P: LockProvider + ?Sized> LockProviderExt for P {}
