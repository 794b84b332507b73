//! Shared key-value store boundary.
//!
//! Rate-limit counters, job records, item lists, per-item results and
//! partial commit logs all live behind this trait. The in-memory store backs
//! tests and single-process deployments; the Redis store (feature `redis`)
//! shares state across worker processes.

use std::collections::HashMap;
use std::time::Duration;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryKeyValueStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisKeyValueStore;

/// Key-value store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KvError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store command failed: {0}")]
    Command(String),
    #[error("stored value is malformed: {0}")]
    Malformed(String),
}

/// The two keys holding one shared token bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketKeys {
    pub tokens: String,
    pub last_update: String,
}

impl BucketKeys {
    /// `rate_limit:{id}:tokens` / `rate_limit:{id}:last_update`.
    pub fn for_limiter(id: &str) -> Self {
        Self {
            tokens: format!("rate_limit:{id}:tokens"),
            last_update: format!("rate_limit:{id}:last_update"),
        }
    }
}

/// Result of one atomic take against a shared bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketTake {
    pub granted: bool,
    /// Tokens left in the bucket after the take (refilled, decremented if granted).
    pub tokens: f64,
}

/// Parameters of a shared bucket take.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    pub rate: f64,
    pub burst: f64,
    pub requested: f64,
    /// Caller's wall clock, seconds since the Unix epoch.
    pub now: f64,
}

impl BucketParams {
    /// Time after which an untouched bucket is full again, so its keys can expire.
    pub fn idle_expiry(&self) -> Duration {
        let secs = (self.burst / self.rate).ceil().max(0.0) as u64 + 1;
        Duration::from_secs(secs)
    }
}

/// Store operations used by the scan core.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Set with a time-to-live.
    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;

    /// Refresh the time-to-live of an existing key. Returns `false` if absent.
    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;

    fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError>;

    fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, KvError>;

    fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Cheap liveness probe.
    fn ping(&self) -> bool;

    /// Atomically refill the bucket stored under `keys` by elapsed time, take
    /// `requested` tokens if there are enough, and write the refreshed state
    /// back whether or not the take was granted.
    fn take_tokens(&self, keys: &BucketKeys, params: BucketParams) -> Result<BucketTake, KvError>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<S> {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        (**self).set(key, value)
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        (**self).set_ex(key, value, ttl)
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        (**self).expire(key, ttl)
    }

    fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        (**self).hset(key, field, value)
    }

    fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        (**self).hget_all(key)
    }

    fn delete(&self, key: &str) -> Result<(), KvError> {
        (**self).delete(key)
    }

    fn ping(&self) -> bool {
        (**self).ping()
    }

    fn take_tokens(&self, keys: &BucketKeys, params: BucketParams) -> Result<BucketTake, KvError> {
        (**self).take_tokens(keys, params)
    }
}
