use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dog_core::DogConfigSnapshot;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Proof of ownership for a lock grant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(pub String);

impl LockToken {
    /// Generate a new unique lock token
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A granted lock.
///
/// Holding a `Lock` does not prove ownership: the lease may have expired
/// and been granted to someone else. Only a successful `renew` or `release`
/// confirms the token still matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub resource: String,
    pub token: LockToken,
    pub acquired_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
    /// How long `acquire` waited before the grant
    pub time_waited: Duration,
    pub renewal_count: u32,
}

impl Lock {
    pub(crate) fn granted(
        resource: &str,
        token: LockToken,
        lease_expires_at: DateTime<Utc>,
        time_waited: Duration,
    ) -> Self {
        Self {
            resource: resource.to_string(),
            token,
            acquired_at: Utc::now(),
            lease_expires_at,
            time_waited,
            renewal_count: 0,
        }
    }

    /// Whether the lease has run out by the local clock
    pub fn is_expired(&self) -> bool {
        self.lease_expires_at <= Utc::now()
    }
}

/// Per-call acquisition parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Give up (returning `None`) after waiting this long
    pub acquire_timeout: Duration,
    /// Lease granted on success
    pub lease: Duration,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(30),
            lease: Duration::from_secs(20),
        }
    }
}

impl AcquireOptions {
    pub fn new(acquire_timeout: Duration, lease: Duration) -> Self {
        Self {
            acquire_timeout,
            lease,
        }
    }

    /// A single attempt, no waiting
    pub fn immediate(lease: Duration) -> Self {
        Self::new(Duration::ZERO, lease)
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Read `{prefix}.acquire_timeout_ms` and `{prefix}.lease_ms`
    pub fn from_config(config: &DogConfigSnapshot, prefix: &str) -> Self {
        let defaults = Self::default();
        Self {
            acquire_timeout: config
                .get_duration_ms(&format!("{prefix}.acquire_timeout_ms"))
                .unwrap_or(defaults.acquire_timeout),
            lease: config
                .get_duration_ms(&format!("{prefix}.lease_ms"))
                .unwrap_or(defaults.lease),
        }
    }
}

pub(crate) fn deadline_after(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
