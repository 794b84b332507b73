//! Circuit breaker guarding a dependency that may become unavailable.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens (at least 1)
    pub failure_threshold: u32,
    /// How long the circuit stays open before a recovery trial is allowed
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Dependency considered down; callers skip it
    Open,
    /// One recovery trial is in flight
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_started: Option<Instant>,
}

/// Consecutive-failure circuit breaker with a single-trial half-open state.
///
/// Once the recovery timeout has elapsed, exactly one caller is let through.
/// Its success closes the circuit; its failure re-opens it immediately. A
/// trial that never reports back is abandoned after another recovery timeout.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_started: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the guarded operation may be attempted now.
    pub fn should_attempt(&self) -> bool {
        let mut inner = self.lock();
        let timeout = self.config.recovery_timeout;
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let recovered = inner.last_failure.is_none_or(|at| at.elapsed() >= timeout);
                if recovered {
                    info!(breaker = %self.name, "circuit breaker attempting recovery");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started = Some(Instant::now());
                }
                recovered
            }
            CircuitState::HalfOpen => {
                let abandoned = inner.trial_started.is_none_or(|at| at.elapsed() >= timeout);
                if abandoned {
                    inner.trial_started = Some(Instant::now());
                }
                abandoned
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(breaker = %self.name, "circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.trial_started = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    recovery_secs = self.config.recovery_timeout.as_secs_f64(),
                    "circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.trial_started = None;
                warn!(breaker = %self.name, "circuit breaker recovery trial failed");
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// True only while fully open; a half-open breaker is not open.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_millis(recovery_ms),
            },
        )
    }

    #[test]
    fn opens_after_threshold_and_recovers_after_timeout() {
        let cb = breaker(3, 100);
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.is_open());
        assert!(cb.should_attempt());

        cb.record_failure();
        assert!(cb.is_open());
        assert!(!cb.should_attempt());

        thread::sleep(Duration::from_millis(150));
        assert!(cb.should_attempt());
        assert!(!cb.is_open());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = breaker(3, 100);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.is_open());
    }

    #[test]
    fn half_open_admits_a_single_trial() {
        let cb = breaker(1, 50);
        cb.record_failure();
        thread::sleep(Duration::from_millis(70));

        assert!(cb.should_attempt());
        assert!(!cb.should_attempt());
        assert!(!cb.should_attempt());
    }

    #[test]
    fn trial_success_closes() {
        let cb = breaker(2, 50);
        cb.record_failure();
        cb.record_failure();
        thread::sleep(Duration::from_millis(70));
        assert!(cb.should_attempt());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.should_attempt());
    }

    #[test]
    fn trial_failure_reopens_immediately() {
        let cb = breaker(2, 50);
        cb.record_failure();
        cb.record_failure();
        thread::sleep(Duration::from_millis(70));
        assert!(cb.should_attempt());

        cb.record_failure();
        assert!(cb.is_open());
        assert!(cb.failure_count() >= 2);
        assert!(!cb.should_attempt());
    }

    #[test]
    fn abandoned_trial_is_replaced() {
        let cb = breaker(1, 40);
        cb.record_failure();
        thread::sleep(Duration::from_millis(60));
        assert!(cb.should_attempt());
        assert!(!cb.should_attempt());

        thread::sleep(Duration::from_millis(60));
        assert!(cb.should_attempt());
    }

    #[test]
    fn zero_threshold_is_treated_as_one() {
        let cb = breaker(0, 1_000);
        assert_eq!(cb.config().failure_threshold, 1);
        cb.record_failure();
        assert!(cb.is_open());
    }
}
