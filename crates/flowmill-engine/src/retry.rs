//! Retry policy
//!
//! Exponential backoff with optional jitter. A node-level `RetrySpec` from
//! the definition overrides the engine default; `max_attempts = 0` disables
//! retries so the first retriable failure is promoted to a permanent one.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use flowmill_model::RetrySpec;

use crate::config::duration_millis;

/// Retry configuration for node attempts
///
/// # Example
///
/// ```
/// use flowmill_engine::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default()
///     .with_max_attempts(5)
///     .with_base_delay(Duration::from_secs(1));
///
/// // First retry after ~1s, second after ~2s, third after ~4s, ...
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum attempts including the first; 0 means a single attempt with no
    /// retries
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Backoff multiplier per retry (>= 1.0)
    pub backoff_factor: f64,

    /// Randomize each delay by +/-25%
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::ZERO,
            backoff_factor: 1.0,
            jitter: false,
        }
    }

    /// Build from a definition-level retry spec
    pub fn from_spec(spec: &RetrySpec) -> Self {
        Self {
            max_attempts: spec.max_attempts,
            base_delay: Duration::from_millis(spec.base_delay_ms),
            backoff_factor: spec.backoff_factor.max(1.0),
            jitter: spec.jitter,
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the base delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the backoff factor (clamped to >= 1.0)
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor.max(1.0);
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total attempts the conductor will make (at least one)
    pub fn effective_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.effective_attempts()
    }

    /// Backoff before retrying after `attempt` (1-based) failed
    ///
    /// `base_delay * backoff_factor^(attempt - 1)`, with +/-25% jitter when
    /// enabled.
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);

        let delayed = if self.jitter && base > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = base * 0.25;
            let offset = rng.gen_range(-jitter_range..jitter_range);
            (base + offset).max(0.0)
        } else {
            base
        };

        Duration::from_secs_f64(delayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert_eq!(policy.backoff_factor, 2.0);
        assert!(policy.jitter);
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.effective_attempts(), 1);
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_secs(1))
            .with_jitter(false);

        assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_factor_clamped() {
        let policy = RetryPolicy::default().with_backoff_factor(0.1);
        assert_eq!(policy.backoff_factor, 1.0);
    }

    #[test]
    fn test_from_spec() {
        let spec = RetrySpec {
            max_attempts: 5,
            base_delay_ms: 250,
            backoff_factor: 3.0,
            jitter: false,
        };

        let policy = RetryPolicy::from_spec(&spec);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_millis(750));
    }

    #[test]
    fn test_jitter_stays_positive() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_millis(10))
            .with_jitter(true);

        for attempt in 1..6 {
            let delay = policy.delay_after_attempt(attempt);
            assert!(delay >= Duration::ZERO);
        }
    }

    #[test]
    fn test_serialization_round_trip() {
        let policy = RetryPolicy::default().with_max_attempts(7);
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }

    #[test]
    fn test_has_attempts_remaining() {
        let policy = RetryPolicy::default().with_max_attempts(3);
        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }
}
