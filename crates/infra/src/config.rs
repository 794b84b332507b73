//! Scan settings loaded from `BULKSCAN_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::jobs::{OrchestratorConfig, RetryPolicy};
use crate::rate_limit::CircuitBreakerConfig;

const PREFIX: &str = "BULKSCAN_";

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
    #[error("{key} must hold at least one token, effective burst is {burst}")]
    BurstBelowOne { key: String, burst: String },
}

/// Rate and burst of one admission limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterSettings {
    pub rate: f64,
    pub burst: Option<f64>,
}

impl LimiterSettings {
    /// Bucket capacity; `rate` when no burst is set.
    pub fn effective_burst(&self) -> f64 {
        self.burst.unwrap_or(self.rate)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanSettings {
    /// Shared store; in-memory when unset
    pub redis_url: Option<String>,
    /// Durable job archive; none when unset
    pub database_url: Option<String>,
    pub dns: LimiterSettings,
    pub whois: LimiterSettings,
    pub batch_window: Duration,
    pub max_batch_size: usize,
    pub job_ttl: Duration,
    pub commit_log_ttl: Duration,
    pub breaker: CircuitBreakerConfig,
    pub contention_max_attempts: u32,
    pub contention_base_delay: Duration,
    pub max_inline_wait: Duration,
    pub submit_chunk_size: usize,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            database_url: None,
            dns: LimiterSettings { rate: 10.0, burst: None },
            whois: LimiterSettings { rate: 5.0, burst: None },
            batch_window: Duration::from_secs(10),
            max_batch_size: 100,
            job_ttl: Duration::from_secs(3600),
            commit_log_ttl: Duration::from_secs(86_400),
            breaker: CircuitBreakerConfig::default(),
            contention_max_attempts: 3,
            contention_base_delay: Duration::from_millis(100),
            max_inline_wait: Duration::from_millis(250),
            submit_chunk_size: 100,
        }
    }
}

impl ScanSettings {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key -> value source; `lookup` receives the full
    /// `BULKSCAN_`-prefixed name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let defaults = Self::default();

        let settings = Self {
            redis_url: env.string("REDIS_URL"),
            database_url: env.string("DATABASE_URL"),
            dns: env.limiter("DNS", defaults.dns.rate)?,
            whois: env.limiter("WHOIS", defaults.whois.rate)?,
            batch_window: Duration::from_secs(
                env.parse("BATCH_WINDOW_SECS", defaults.batch_window.as_secs())?,
            ),
            max_batch_size: env.parse("MAX_BATCH_SIZE", defaults.max_batch_size)?,
            job_ttl: Duration::from_secs(env.parse("JOB_TTL_SECS", defaults.job_ttl.as_secs())?),
            commit_log_ttl: Duration::from_secs(
                env.parse("COMMIT_LOG_TTL_SECS", defaults.commit_log_ttl.as_secs())?,
            ),
            breaker: CircuitBreakerConfig {
                failure_threshold: env
                    .parse("BREAKER_FAILURE_THRESHOLD", defaults.breaker.failure_threshold)?,
                recovery_timeout: Duration::from_secs(env.parse(
                    "BREAKER_RECOVERY_SECS",
                    defaults.breaker.recovery_timeout.as_secs(),
                )?),
            },
            contention_max_attempts: env
                .parse("CONTENTION_MAX_ATTEMPTS", defaults.contention_max_attempts)?,
            contention_base_delay: Duration::from_millis(env.parse(
                "CONTENTION_BASE_DELAY_MS",
                defaults.contention_base_delay.as_millis() as u64,
            )?),
            max_inline_wait: Duration::from_millis(env.parse(
                "MAX_INLINE_WAIT_MS",
                defaults.max_inline_wait.as_millis() as u64,
            )?),
            submit_chunk_size: env.parse("SUBMIT_CHUNK_SIZE", defaults.submit_chunk_size)?,
        };
        Ok(settings)
    }

    /// Orchestrator settings derived from these.
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            batch_window: self.batch_window,
            max_batch_size: self.max_batch_size,
            contention_retry: RetryPolicy::exponential(
                self.contention_max_attempts,
                self.contention_base_delay,
                self.contention_base_delay.saturating_mul(16),
            ),
            max_inline_wait: self.max_inline_wait,
            ..OrchestratorConfig::default()
        }
    }
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn raw(&self, key: &str) -> Option<(String, String)> {
        let name = format!("{PREFIX}{key}");
        (self.0)(&name).map(|value| (name, value))
    }

    fn string(&self, key: &str) -> Option<String> {
        self.raw(key)
            .map(|(_, value)| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.raw(key) {
            Some((name, value)) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key: name, value }),
            None => Ok(default),
        }
    }

    fn optional_rate(&self, key: &str) -> Result<Option<f64>, ConfigError> {
        match self.raw(key) {
            Some((name, value)) => match value.trim().parse::<f64>() {
                Ok(rate) if rate.is_finite() && rate > 0.0 => Ok(Some(rate)),
                _ => Err(ConfigError::Invalid { key: name, value }),
            },
            None => Ok(None),
        }
    }

    fn rate(&self, key: &str, default: f64) -> Result<f64, ConfigError> {
        Ok(self.optional_rate(key)?.unwrap_or(default))
    }

    /// `{name}_RATE` and `{name}_BURST`. A bucket that cannot hold one whole
    /// token never grants a single-token request.
    fn limiter(&self, name: &str, default_rate: f64) -> Result<LimiterSettings, ConfigError> {
        let settings = LimiterSettings {
            rate: self.rate(&format!("{name}_RATE"), default_rate)?,
            burst: self.optional_rate(&format!("{name}_BURST"))?,
        };
        let burst = settings.effective_burst();
        if burst < 1.0 {
            return Err(ConfigError::BurstBelowOne {
                key: format!("{PREFIX}{name}_BURST"),
                burst: burst.to_string(),
            });
        }
        Ok(settings)
    }
}
