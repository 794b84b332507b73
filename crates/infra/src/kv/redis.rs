//! Redis-backed key-value store (optional, feature `redis`).
//!
//! Uses a synchronous client with one connection per operation. The shared
//! token bucket is updated by a Lua script so the read-refill-write happens
//! atomically on the server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::Script;
use tracing::debug;

use super::{BucketKeys, BucketParams, BucketTake, KeyValueStore, KvError};

/// Refill-and-take over the `tokens` / `last_update` string keys.
///
/// Returns `{granted, tokens}`; tokens travel as a string because Lua numbers
/// are truncated to integers on the way back to the client.
const TAKE_TOKENS_SCRIPT: &str = r#"
local rate = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local tokens = tonumber(redis.call('GET', KEYS[1])) or burst
local last_update = tonumber(redis.call('GET', KEYS[2])) or now

local elapsed = math.max(0, now - last_update)
tokens = math.min(burst, tokens + elapsed * rate)

local granted = 0
if tokens >= requested then
    tokens = tokens - requested
    granted = 1
end

redis.call('SET', KEYS[1], tostring(tokens), 'EX', ttl)
redis.call('SET', KEYS[2], tostring(now), 'EX', ttl)
return {granted, tostring(tokens)}
"#;

#[derive(Debug, Clone)]
pub struct RedisKeyValueStore {
    client: Arc<redis::Client>,
    take_tokens: Arc<Script>,
}

impl RedisKeyValueStore {
    /// Create a store for `redis_url` (e.g. `redis://localhost:6379/0`).
    ///
    /// No connection is made until the first operation.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, KvError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            take_tokens: Arc::new(Script::new(TAKE_TOKENS_SCRIPT)),
        })
    }

    fn connection(&self) -> Result<redis::Connection, KvError> {
        self.client
            .get_connection()
            .map_err(|e| KvError::Unavailable(e.to_string()))
    }
}

fn command_error(op: &str, err: redis::RedisError) -> KvError {
    if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        KvError::Unavailable(format!("{op}: {err}"))
    } else {
        KvError::Command(format!("{op} failed: {err}"))
    }
}

/// Redis expiries are whole milliseconds; never send zero.
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

impl KeyValueStore for RedisKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.connection()?;
        redis::cmd("GET")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| command_error("GET", e))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut conn = self.connection()?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query::<()>(&mut conn)
            .map_err(|e| command_error("SET", e))
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.connection()?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query::<()>(&mut conn)
            .map_err(|e| command_error("SET PX", e))
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.connection()?;
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query(&mut conn)
            .map_err(|e| command_error("PEXPIRE", e))?;
        Ok(updated == 1)
    }

    fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        let mut conn = self.connection()?;
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query::<i64>(&mut conn)
            .map(|_| ())
            .map_err(|e| command_error("HSET", e))
    }

    fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let mut conn = self.connection()?;
        redis::cmd("HGETALL")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| command_error("HGETALL", e))
    }

    fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.connection()?;
        redis::cmd("DEL")
            .arg(key)
            .query::<i64>(&mut conn)
            .map(|_| ())
            .map_err(|e| command_error("DEL", e))
    }

    fn ping(&self) -> bool {
        let Ok(mut conn) = self.connection() else {
            return false;
        };
        match redis::cmd("PING").query::<String>(&mut conn) {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "redis ping failed");
                false
            }
        }
    }

    fn take_tokens(&self, keys: &BucketKeys, params: BucketParams) -> Result<BucketTake, KvError> {
        let mut conn = self.connection()?;
        let (granted, tokens): (i64, String) = self
            .take_tokens
            .key(&keys.tokens)
            .key(&keys.last_update)
            .arg(params.rate)
            .arg(params.burst)
            .arg(params.requested)
            .arg(params.now)
            .arg(params.idle_expiry().as_secs())
            .invoke(&mut conn)
            .map_err(|e| command_error("take_tokens script", e))?;

        let tokens = tokens
            .parse::<f64>()
            .map_err(|e| KvError::Malformed(format!("{}: {e}", keys.tokens)))?;
        Ok(BucketTake {
            granted: granted == 1,
            tokens,
        })
    }
}
