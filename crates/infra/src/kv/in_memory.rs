//! In-memory key-value store for tests, benches and single-process runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::rate_limit::refill;

use super::{BucketKeys, BucketParams, BucketTake, KeyValueStore, KvError};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// TTL-aware in-memory store.
///
/// Expired entries are invisible to readers and purged on the next access.
/// [`set_available`](Self::set_available) simulates an outage: every
/// operation fails with [`KvError::Unavailable`] and `ping` reports `false`.
#[derive(Debug)]
pub struct InMemoryKeyValueStore {
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|e| e.live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<(), KvError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KvError::Unavailable("in-memory store switched off".to_string()))
        }
    }

    /// Locked map with the entry under `key` purged if it has expired.
    fn fresh(&self, key: &str) -> Result<MutexGuard<'_, HashMap<String, Entry>>, KvError> {
        self.check()?;
        let mut entries = self.lock();
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| !e.live(now)) {
            entries.remove(key);
        }
        Ok(entries)
    }
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_type(key: &str) -> KvError {
    KvError::Command(format!("WRONGTYPE operation against key {key}"))
}

fn read_str(entries: &HashMap<String, Entry>, key: &str) -> Result<Option<String>, KvError> {
    match entries.get(key) {
        Some(Entry { value: Value::Str(s), .. }) => Ok(Some(s.clone())),
        Some(_) => Err(wrong_type(key)),
        None => Ok(None),
    }
}

fn parse_f64(key: &str, raw: Option<String>) -> Result<Option<f64>, KvError> {
    raw.map(|s| {
        s.parse::<f64>()
            .map_err(|e| KvError::Malformed(format!("{key}: {e}")))
    })
    .transpose()
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let entries = self.fresh(key)?;
        read_str(&entries, key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.check()?;
        self.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        self.check()?;
        self.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut entries = self.fresh(key)?;
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        let mut entries = self.fresh(key)?;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(map) => {
                map.insert(field.to_string(), value.to_string());
                Ok(())
            }
            Value::Str(_) => Err(wrong_type(key)),
        }
    }

    fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let entries = self.fresh(key)?;
        match entries.get(key) {
            Some(Entry { value: Value::Hash(map), .. }) => Ok(map.clone()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(HashMap::new()),
        }
    }

    fn delete(&self, key: &str) -> Result<(), KvError> {
        self.check()?;
        self.lock().remove(key);
        Ok(())
    }

    fn ping(&self) -> bool {
        self.check().is_ok()
    }

    fn take_tokens(&self, keys: &BucketKeys, params: BucketParams) -> Result<BucketTake, KvError> {
        self.check()?;
        // One lock for the whole read-refill-write makes the take atomic.
        let mut entries = self.lock();
        let now = Instant::now();
        entries.retain(|_, e| e.live(now));

        let tokens = parse_f64(&keys.tokens, read_str(&entries, &keys.tokens)?)?;
        let last_update = parse_f64(&keys.last_update, read_str(&entries, &keys.last_update)?)?;

        let mut tokens = refill(
            tokens.unwrap_or(params.burst),
            params.now - last_update.unwrap_or(params.now),
            params.rate,
            params.burst,
        );
        let granted = tokens >= params.requested;
        if granted {
            tokens -= params.requested;
        }

        let expires_at = Some(now + params.idle_expiry());
        entries.insert(
            keys.tokens.clone(),
            Entry {
                value: Value::Str(tokens.to_string()),
                expires_at,
            },
        );
        entries.insert(
            keys.last_update.clone(),
            Entry {
                value: Value::Str(params.now.to_string()),
                expires_at,
            },
        );

        Ok(BucketTake { granted, tokens })
    }
}
