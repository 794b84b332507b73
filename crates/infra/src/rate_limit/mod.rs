//! Admission control against rate-limited external dependencies.
//!
//! - [`TokenBucket`]: single-process limiter
//! - [`CircuitBreaker`]: guards access to the shared store
//! - [`DistributedLimiter`]: bucket shared across processes through the
//!   key-value store, falling back to a local bucket while the store is down

use std::time::Duration;

pub mod circuit_breaker;
pub mod distributed;
pub mod token_bucket;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use distributed::DistributedLimiter;
pub use token_bucket::TokenBucket;

pub(crate) use token_bucket::refill;

/// The acquire/wait contract shared by every limiter.
pub trait RateLimiter: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Sustained tokens per second.
    fn rate(&self) -> f64;

    /// Take `n` tokens if available. Never blocks.
    fn acquire(&self, n: u32) -> bool;

    /// Take `n` tokens, returning how long the caller must wait before
    /// proceeding (zero when the tokens were available).
    ///
    /// A non-zero wait is a reservation: once it has passed the caller
    /// proceeds without asking again.
    fn wait(&self, n: u32) -> Duration;
}

/// Seconds to a `Duration`, saturating on infinities and clamping negatives to zero.
pub(crate) fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secs_to_duration_handles_edge_values() {
        assert_eq!(secs_to_duration(-1.0), Duration::ZERO);
        assert_eq!(secs_to_duration(f64::NAN), Duration::ZERO);
        assert_eq!(secs_to_duration(f64::INFINITY), Duration::MAX);
        assert_eq!(secs_to_duration(0.5), Duration::from_millis(500));
    }
}
