//! Reconnection Policy
//!
//! Exponential backoff for channel re-establishment. The delay after the
//! `n`th consecutive failure is `min(base * 2^n, max_delay)`, optionally
//! randomised by a jitter factor. Once more than `max_attempts` consecutive
//! failures have been recorded the policy refuses further retries.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectConfig {
    /// Base delay; the first retry waits twice this.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
    /// Consecutive failures tolerated before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.0,
            max_attempts: 5,
        }
    }
}

/// Backoff state for one channel.
///
/// # Example
///
/// ```rust
/// use progress_sync::application::services::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
///
/// assert_eq!(policy.record_failure().unwrap(), Duration::from_secs(2));
/// assert_eq!(policy.record_failure().unwrap(), Duration::from_secs(4));
///
/// // Successful connection
/// policy.reset();
/// assert_eq!(policy.attempts(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Record a failure and return the delay before the next attempt.
    ///
    /// # Errors
    ///
    /// Returns [`ReconnectError::MaxAttemptsExceeded`] once the failure count
    /// exceeds `max_attempts`.
    pub fn record_failure(&mut self) -> Result<Duration, ReconnectError> {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts > self.config.max_attempts {
            return Err(ReconnectError::MaxAttemptsExceeded(self.config.max_attempts));
        }
        Ok(self.apply_jitter(self.delay_for(self.attempts)))
    }

    /// Un-jittered delay after `attempt` consecutive failures.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.config
            .base_delay
            .saturating_mul(factor)
            .min(self.config.max_delay)
    }

    /// Reset the policy after a successful connection.
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Consecutive failures recorded since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether another failure would still be retried.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.attempts < self.config.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

/// Error type for reconnection failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconnectError {
    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxAttemptsExceeded(u32),
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn default_config_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.base_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!(config.jitter_factor.abs() < f64::EPSILON);
        assert_eq!(config.max_attempts, 5);
    }

    #[test_case(1, 2_000 ; "first failure")]
    #[test_case(2, 4_000 ; "second failure")]
    #[test_case(3, 8_000 ; "third failure")]
    #[test_case(4, 16_000 ; "fourth failure")]
    #[test_case(5, 30_000 ; "capped")]
    #[test_case(40, 30_000 ; "overflow stays capped")]
    fn backoff_schedule(attempt: u32, expected_ms: u64) {
        let policy = ReconnectPolicy::new(ReconnectConfig::default());
        assert_eq!(policy.delay_for(attempt), Duration::from_millis(expected_ms));
    }

    #[test]
    fn third_consecutive_failure_waits_eight_seconds() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
        let _ = policy.record_failure();
        let _ = policy.record_failure();
        assert_eq!(policy.record_failure(), Ok(Duration::from_millis(8_000)));
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::default());

        for _ in 0..5 {
            assert!(policy.record_failure().is_ok());
        }
        assert!(!policy.should_retry());
        assert_eq!(
            policy.record_failure(),
            Err(ReconnectError::MaxAttemptsExceeded(5))
        );
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
        let _ = policy.record_failure();
        let _ = policy.record_failure();
        assert_eq!(policy.attempts(), 2);

        policy.reset();

        assert_eq!(policy.attempts(), 0);
        assert!(policy.should_retry());
        assert_eq!(policy.record_failure(), Ok(Duration::from_secs(2)));
    }

    #[test]
    fn jitter_bounds() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                jitter_factor: 0.1,
                ..ReconnectConfig::default()
            });

            let millis = policy.record_failure().unwrap().as_millis();
            assert!(millis >= 1_800, "delay {millis}ms is below minimum 1800ms");
            assert!(millis <= 2_200, "delay {millis}ms is above maximum 2200ms");
        }
    }
}
