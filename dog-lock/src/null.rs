use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::lock::deadline_after;
use crate::{AcquireOptions, Lock, LockProvider, LockResult, LockToken};

/// Provider that grants every request immediately.
///
/// For wiring where exclusion is not needed (tests, single-process tools).
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLockProvider;

#[async_trait]
impl LockProvider for NullLockProvider {
    async fn acquire(&self, resource: &str, options: AcquireOptions) -> LockResult<Option<Lock>> {
        let expires = deadline_after(Utc::now(), options.lease);
        Ok(Some(Lock::granted(resource, LockToken::new(), expires, Duration::ZERO)))
    }

    async fn renew(&self, lock: &mut Lock, extension: Duration) -> LockResult<bool> {
        lock.lease_expires_at = deadline_after(Utc::now(), extension);
        lock.renewal_count += 1;
        Ok(true)
    }

    async fn release(&self, _lock: &Lock) -> LockResult<bool> {
        Ok(true)
    }

    async fn is_locked(&self, _resource: &str) -> LockResult<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_caller_is_granted() {
        let locks = NullLockProvider;
        let a = locks.acquire("R", AcquireOptions::default()).await.unwrap();
        let b = locks.acquire("R", AcquireOptions::default()).await.unwrap();
        assert!(a.is_some() && b.is_some());
        assert!(!locks.is_locked("R").await.unwrap());
    }
}
