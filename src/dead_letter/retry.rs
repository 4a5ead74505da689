//! # Retry Policy
//!
//! Bounded retry decisions and capped exponential backoff. The policy never
//! re-derives classification; it asks its [`ErrorClassifier`].

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::dead_letter::classifier::{ErrorClassifier, FailureKind, StandardFailureClassifier};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retry_attempts: u32,
    initial_delay: Duration,
    backoff_multiplier: f64,
    max_delay: Duration,
    classifier: Arc<dyn ErrorClassifier>,
}

impl RetryPolicy {
    pub fn new(
        max_retry_attempts: u32,
        initial_delay: Duration,
        backoff_multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_retry_attempts,
            initial_delay,
            backoff_multiplier,
            max_delay,
            classifier: Arc::new(StandardFailureClassifier),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retry_attempts,
            config.initial_delay(),
            config.backoff_multiplier,
            config.max_delay(),
        )
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn max_retry_attempts(&self) -> u32 {
        self.max_retry_attempts
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn classifier(&self) -> &Arc<dyn ErrorClassifier> {
        &self.classifier
    }

    pub fn classify(&self, error: &(dyn StdError + 'static)) -> FailureKind {
        self.classifier.classify(error)
    }

    /// Whether another attempt should be made after `attempt_count` failed attempts
    pub fn should_retry(&self, error: &(dyn StdError + 'static), attempt_count: u32) -> bool {
        if attempt_count >= self.max_retry_attempts {
            return false;
        }
        self.should_retry_kind(self.classify(error), attempt_count)
    }

    /// Retry decision for an already classified failure
    pub fn should_retry_kind(&self, kind: FailureKind, attempt_count: u32) -> bool {
        if attempt_count >= self.max_retry_attempts {
            return false;
        }
        match kind {
            FailureKind::Permanent | FailureKind::Critical => false,
            FailureKind::Transient => true,
            // integer division: max 5 retries unknown failures below attempt 2
            FailureKind::Unknown => attempt_count < self.max_retry_attempts / 2,
        }
    }

    /// `initial * multiplier^(attempt - 1)`, capped; attempt 0 is treated as 1
    pub fn calculate_retry_delay(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.max(1) - 1;
        let factor = self.backoff_multiplier.powi(exponent.min(i32::MAX as u32) as i32);
        let raw_nanos = self.initial_delay.as_nanos() as f64 * factor;

        if !raw_nanos.is_finite() || raw_nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(raw_nanos.max(0.0).round() as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::classifier::HandlerFailure;

    fn policy(max: u32) -> RetryPolicy {
        RetryPolicy::new(max, Duration::from_secs(1), 2.0, Duration::from_secs(30))
    }

    #[test]
    fn backoff_schedule() {
        let policy = policy(5);
        assert_eq!(policy.calculate_retry_delay(1), Duration::from_secs(1));
        assert_eq!(policy.calculate_retry_delay(2), Duration::from_secs(2));
        assert_eq!(policy.calculate_retry_delay(3), Duration::from_secs(4));
        assert_eq!(policy.calculate_retry_delay(5), Duration::from_secs(16));
        assert_eq!(policy.calculate_retry_delay(6), Duration::from_secs(30));
        assert_eq!(policy.calculate_retry_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn zero_attempt_is_first_attempt() {
        assert_eq!(policy(5).calculate_retry_delay(0), Duration::from_secs(1));
    }

    #[test]
    fn transient_retries_until_max() {
        let policy = policy(5);
        let err = HandlerFailure::network("connection reset");
        assert!(policy.should_retry(&err, 3));
        assert!(policy.should_retry(&err, 4));
        assert!(!policy.should_retry(&err, 5));
        assert!(!policy.should_retry(&err, 6));
    }

    #[test]
    fn terminal_failures_never_retry() {
        let policy = policy(5);
        assert!(!policy.should_retry(&HandlerFailure::validation("bad"), 1));
        assert!(!policy.should_retry(&HandlerFailure::data_integrity("corrupt"), 0));
    }

    #[test]
    fn unknown_retries_below_half() {
        let policy = policy(6);
        assert!(policy.should_retry_kind(FailureKind::Unknown, 2));
        assert!(!policy.should_retry_kind(FailureKind::Unknown, 3));

        let policy = self::policy(1);
        assert!(!policy.should_retry_kind(FailureKind::Unknown, 0));
    }

    #[test]
    fn fractional_multiplier_below_cap() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), 1.5, Duration::from_secs(1));
        assert_eq!(policy.calculate_retry_delay(2), Duration::from_millis(150));
    }
}
