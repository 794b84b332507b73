//! Token bucket shared across worker processes through the key-value store.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::kv::{BucketKeys, BucketParams, KeyValueStore};

use super::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, RateLimiter, TokenBucket, secs_to_duration,
};

/// Distributed token bucket with a local fallback.
///
/// The shared state lives under `rate_limit:{id}:tokens` and
/// `rate_limit:{id}:last_update`. Store access is guarded by a circuit
/// breaker; while the store is unreachable (or the circuit is open) each
/// process rate-limits itself with its own [`TokenBucket`], so aggregate
/// throughput can exceed the shared rate by a factor of the number of workers.
pub struct DistributedLimiter {
    id: String,
    keys: BucketKeys,
    rate: f64,
    burst: f64,
    store: Arc<dyn KeyValueStore>,
    breaker: CircuitBreaker,
    fallback: TokenBucket,
}

impl std::fmt::Debug for DistributedLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLimiter")
            .field("id", &self.id)
            .field("rate", &self.rate)
            .field("burst", &self.burst)
            .field("breaker", &self.breaker.state())
            .finish()
    }
}

impl DistributedLimiter {
    /// `burst` defaults to `rate`.
    pub fn new(
        id: impl Into<String>,
        rate: f64,
        burst: Option<f64>,
        store: Arc<dyn KeyValueStore>,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        let id = id.into();
        let burst = burst.unwrap_or(rate);
        Self {
            keys: BucketKeys::for_limiter(&id),
            breaker: CircuitBreaker::new(format!("rate_limit:{id}"), breaker),
            fallback: TokenBucket::new(format!("{id}:local"), rate, Some(burst)),
            id,
            rate,
            burst,
            store,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> f64 {
        self.burst
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn fallback(&self) -> &TokenBucket {
        &self.fallback
    }

    /// Take from the shared bucket. `None` means the store could not be used.
    fn take_shared(&self, n: u32) -> Option<bool> {
        if !self.breaker.should_attempt() {
            return None;
        }

        let params = BucketParams {
            rate: self.rate,
            burst: self.burst,
            requested: f64::from(n),
            now: unix_now(),
        };
        match self.store.take_tokens(&self.keys, params) {
            Ok(take) => {
                // A denial is the bucket working, not the store failing.
                self.breaker.record_success();
                Some(take.granted)
            }
            Err(e) => {
                warn!(limiter = %self.id, error = %e, "shared rate limit operation failed");
                self.breaker.record_failure();
                None
            }
        }
    }

    /// Returns whether a warning was logged: only while the circuit is
    /// closed. Once it has tripped the breaker has logged the outage.
    fn note_fallback(&self) -> bool {
        if self.breaker.state() != CircuitState::Closed {
            return false;
        }
        warn!(
            limiter = %self.id,
            rate = self.rate,
            "rate limiter falling back to in-memory limiter (store unavailable)"
        );
        true
    }
}

impl RateLimiter for DistributedLimiter {
    fn name(&self) -> &str {
        &self.id
    }

    fn rate(&self) -> f64 {
        self.rate
    }

    fn acquire(&self, n: u32) -> bool {
        if let Some(granted) = self.take_shared(n) {
            return granted;
        }
        self.note_fallback();
        self.fallback.acquire(n)
    }

    /// On a shared-bucket denial the returned wait is the estimate `n / rate`;
    /// the caller sleeps (or reschedules) rather than polling the store.
    fn wait(&self, n: u32) -> Duration {
        match self.take_shared(n) {
            Some(true) => Duration::ZERO,
            Some(false) => secs_to_duration(f64::from(n) / self.rate),
            None => {
                self.note_fallback();
                self.fallback.wait(n)
            }
        }
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
