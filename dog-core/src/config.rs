//! # DogRS Configuration
//!
//! DogRS keeps configuration as a flat string key/value store. Option
//! structs in the other crates (`QueueOptions`, `HybridCacheOptions`, ...)
//! read their fields out of a [`DogConfigSnapshot`] under a dotted prefix,
//! so applications can layer configuration however they like.
//!
//! ## Setting and reading values
//! ```rust
//! use dog_core::DogConfig;
//! let mut config = DogConfig::new();
//!
//! config.set("queue.orders.max_attempts", "5");
//! config.set("queue.orders.visibility_timeout_ms", "30000");
//!
//! let snapshot = config.snapshot();
//! assert_eq!(snapshot.get_u64("queue.orders.max_attempts"), Some(5));
//! ```
//!
//! ## Environment overrides
//! [`load_env`] maps `PREFIX__QUEUE__ORDERS__MAX_ATTEMPTS=7` to
//! `queue.orders.max_attempts = 7`:
//!
//! ```bash
//! export DOG__QUEUE__ORDERS__MAX_ATTEMPTS=7
//! ```

use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct DogConfig {
    values: HashMap<String, String>,
}

impl DogConfig {
    /// Create an empty config store.
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// Set a configuration key to a string value.
    ///
    /// Example: config.set("queue.orders.max_attempts", "5")
    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.values.insert(key.into(), value.into());
    }

    /// Get a configuration value by key.
    ///
    /// Returns None if the key is not present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    /// Check whether a key is present.
    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn snapshot(&self) -> DogConfigSnapshot {
        DogConfigSnapshot::new(self.values.clone())
    }
}

/// Load every environment variable starting with `prefix` into `config`.
///
/// `DOG__LOCKS__DEFAULT_LEASE_MS` with prefix `DOG__` becomes
/// `locks.default_lease_ms`. Returns how many keys were loaded.
pub fn load_env(config: &mut DogConfig, prefix: &str) -> usize {
    load_vars(config, prefix, std::env::vars())
}

fn load_vars<I>(config: &mut DogConfig, prefix: &str, vars: I) -> usize
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut loaded = 0;
    for (key, value) in vars {
        if let Some(stripped) = key.strip_prefix(prefix) {
            let normalized = stripped.to_lowercase().replace("__", ".");
            config.set(normalized, value);
            loaded += 1;
        }
    }
    loaded
}

#[derive(Debug, Clone, Default)]
pub struct DogConfigSnapshot {
    map: HashMap<String, String>,
}

impl DogConfigSnapshot {
    pub(crate) fn new(map: HashMap<String, String>) -> Self {
        Self { map }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|s| s.as_str())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.parse::<usize>().ok())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse::<u64>().ok())
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(|v| v.parse::<u32>().ok())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.parse::<bool>().ok())
    }

    /// Read a millisecond count as a [`Duration`].
    pub fn get_duration_ms(&self, key: &str) -> Option<Duration> {
        self.get_u64(key).map(Duration::from_millis)
    }
}
