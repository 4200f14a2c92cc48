//! dog-lock: lease-based distributed locks for DogRS.
//!
//! - [`CacheLockProvider`]: mutual exclusion through token compare-and-swap
//!   on a shared [`dog_cache::Cache`]
//! - [`ThrottlingLockProvider`]: at most N grants per fixed time period
//! - [`NullLockProvider`]: grants everything, for wiring without locks
//!
//! ```rust
//! use std::{sync::Arc, time::Duration};
//! use dog_cache::InMemoryCache;
//! use dog_lock::{AcquireOptions, CacheLockProvider, LockProvider};
//!
//! # tokio_test::block_on(async {
//! let locks = CacheLockProvider::new(Arc::new(InMemoryCache::new()));
//! let lock = locks
//!     .acquire("report:daily", AcquireOptions::immediate(Duration::from_secs(30)))
//!     .await?
//!     .expect("uncontended");
//! assert!(locks.release(&lock).await?);
//! # Ok::<(), dog_lock::LockError>(())
//! # }).unwrap();
//! ```

mod cache;
mod error;
mod lock;
mod null;
mod provider;
mod throttling;

pub use cache::{CacheLockOptions, CacheLockProvider, LockReleased, LOCK_RELEASED_TOPIC};
pub use error::{LockError, LockResult};
pub use lock::{AcquireOptions, Lock, LockToken};
pub use null::NullLockProvider;
pub use provider::{LockProvider, LockProviderExt};
pub use throttling::{ThrottleOptions, ThrottlingLockProvider};
