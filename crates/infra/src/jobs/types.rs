//! Shared job-processing types and policies.

use std::time::Duration;

use bulkscan_core::ItemOutcome;
use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy for transient per-item failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per item, the first one included (at least 1)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0); the offset is derived from the attempt number,
    /// so it varies delays across attempts but not across workers
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * f64::from(attempt)).min(max_ms),
        };

        // Deterministic spread derived from the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((f64::from(attempt) * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another attempt may follow failed attempt `attempt`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

/// The "process one item" collaborator (DNS/WHOIS lookups, scoring, persistence).
///
/// `commit` tells the processor whether to commit its own writes. An `Err` is
/// recorded as a non-retryable failure of that item.
pub trait ItemProcessor: Send + Sync {
    fn process(&self, item: &str, commit: bool) -> anyhow::Result<ItemOutcome>;
}

impl<F> ItemProcessor for F
where
    F: Fn(&str, bool) -> anyhow::Result<ItemOutcome> + Send + Sync,
{
    fn process(&self, item: &str, commit: bool) -> anyhow::Result<ItemOutcome> {
        self(item, commit)
    }
}

/// Result of one orchestrator run over a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every item has been processed (now or by an earlier run).
    Completed { succeeded: u64, failed: u64 },
    /// Rate limits asked for a long wait; the job should be re-run after
    /// `resume_after` and will continue where it stopped.
    Deferred { resume_after: Duration },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(300));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_range() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(1_000), Duration::from_secs(60));
        for attempt in 1..5 {
            let nominal = 1_000.0 * 2_f64.powi(attempt as i32 - 1);
            let actual = policy.delay_for_attempt(attempt).as_millis() as f64;
            assert!((actual - nominal).abs() <= nominal * 0.1 + 1.0);
        }
    }

    #[test]
    fn jitter_is_a_function_of_the_attempt() {
        let a = RetryPolicy::exponential(5, Duration::from_millis(1_000), Duration::from_secs(60));
        let b = a.clone();
        for attempt in 1..5 {
            assert_eq!(a.delay_for_attempt(attempt), b.delay_for_attempt(attempt));
        }
        assert_ne!(a.delay_for_attempt(1), Duration::from_millis(1_000));
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        let once = RetryPolicy::no_retry();
        assert!(!once.should_retry(1));
    }

    #[test]
    fn closures_are_processors() {
        let processor = |item: &str, _commit: bool| -> anyhow::Result<ItemOutcome> {
            Ok(ItemOutcome::success(serde_json::json!({ "item": item })))
        };
        let outcome = processor.process("a.com", true).unwrap();
        assert!(outcome.is_success());
    }
}
