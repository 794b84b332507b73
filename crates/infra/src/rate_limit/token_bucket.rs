//! Single-process token bucket.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{RateLimiter, secs_to_duration};

/// Tokens after `elapsed_secs` of refill at `rate`, capped at `burst`.
/// Negative elapsed time (clock skew between processes) refills nothing.
pub(crate) fn refill(tokens: f64, elapsed_secs: f64, rate: f64, burst: f64) -> f64 {
    (tokens + elapsed_secs.max(0.0) * rate).min(burst)
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_update: Instant,
}

/// Thread-safe token bucket: up to `burst` immediate requests, refilling at
/// `rate` tokens per second.
#[derive(Debug)]
pub struct TokenBucket {
    name: String,
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A full bucket. `rate` must be positive; `burst` defaults to `rate`.
    pub fn new(name: impl Into<String>, rate: f64, burst: Option<f64>) -> Self {
        let burst = burst.unwrap_or(rate);
        Self {
            name: name.into(),
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_update: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> f64 {
        self.burst
    }

    /// Tokens currently available (after refill).
    pub fn available(&self) -> f64 {
        self.refilled().tokens
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refilled(&self) -> MutexGuard<'_, BucketState> {
        let mut state = self.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        state.tokens = refill(state.tokens, elapsed, self.rate, self.burst);
        state.last_update = now;
        state
    }
}

impl RateLimiter for TokenBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn rate(&self) -> f64 {
        self.rate
    }

    fn acquire(&self, n: u32) -> bool {
        let mut state = self.refilled();
        let n = f64::from(n);
        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    /// When short, the bucket is emptied and the caller is told to wait for
    /// the missing tokens; the fractional tokens it held are not banked.
    fn wait(&self, n: u32) -> Duration {
        let mut state = self.refilled();
        let n = f64::from(n);
        if state.tokens >= n {
            state.tokens -= n;
            return Duration::ZERO;
        }
        let wait = (n - state.tokens) / self.rate;
        state.tokens = 0.0;
        secs_to_duration(wait)
    }
}
