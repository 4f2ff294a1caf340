//! Retry policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{duration_millis, ConfigError};
use crate::error::TaskError;

/// Configuration for task retries
///
/// Retries are opt-in: a task without a policy resolves on its first
/// failure. Supports exponential backoff with jitter to avoid thundering
/// herd when many tasks fail together.
///
/// # Example
///
/// ```
/// use taskpool::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_retries(2)
///     .with_initial_interval(Duration::from_millis(50))
///     .with_max_interval(Duration::from_secs(2));
///
/// assert_eq!(policy.max_attempts, 3);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one)
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0); 0.1 means ±10% randomness
    pub jitter: f64,

    /// Error types that are never retried
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Create an exponential backoff policy
    ///
    /// - 3 max attempts (2 retries)
    /// - 100ms initial interval
    /// - 10 second max interval
    /// - 2x backoff coefficient
    /// - 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            non_retryable_errors: vec![],
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Create a policy with fixed intervals (no backoff, no jitter)
    pub fn fixed(interval: Duration, max_retries: u32) -> Self {
        Self {
            max_attempts: max_retries.saturating_add(1),
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Set the number of retries after the initial attempt
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_attempts = retries.saturating_add(1);
        self
    }

    /// Set the maximum number of attempts (including the initial one)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Add an error type that must not be retried
    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }

    /// Retries allowed after the initial attempt
    pub fn max_retries(&self) -> u32 {
        self.max_attempts.saturating_sub(1)
    }

    /// Calculate the delay before a given attempt number (1-based)
    ///
    /// Attempt 1 runs immediately; attempt 2 waits `initial_interval`,
    /// attempt 3 waits `initial_interval * coefficient`, and so on, capped
    /// at `max_interval`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1;
        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jitter_range = capped * self.jitter;
        let jittered = if jitter_range > 0.0 {
            let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        if !jittered.is_finite() {
            return self.max_interval;
        }
        Duration::try_from_secs_f64(jittered.max(0.0)).unwrap_or(self.max_interval)
    }

    /// Reject coefficients and jitter factors that make delays meaningless
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_coefficient.is_finite() || self.backoff_coefficient < 1.0 {
            return Err(ConfigError::InvalidBackoffCoefficient(self.backoff_coefficient));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::InvalidJitter(self.jitter));
        }
        Ok(())
    }

    /// Check whether a failure may be retried under this policy
    pub fn should_retry(&self, error: &TaskError) -> bool {
        if !error.is_retryable() {
            return false;
        }
        match error.error_type() {
            Some(error_type) => !self.non_retryable_errors.iter().any(|e| e == error_type),
            None => true,
        }
    }

    /// Check if there are remaining attempts
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}
