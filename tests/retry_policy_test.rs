//! Retry decisions and backoff schedule

use dead_letter_core::config::RetryConfig;
use dead_letter_core::dead_letter::{
    ErrorClassifier, FailureCause, FailureKind, HandlerFailure, RetryPolicy,
};
use proptest::prelude::*;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

fn policy(max_retry_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_retry_attempts,
        Duration::from_secs(1),
        2.0,
        Duration::from_secs(30),
    )
}

#[test]
fn transient_failure_retries_until_exhausted() {
    let policy = policy(5);
    let failure = HandlerFailure::network("connection reset by peer");

    assert!(policy.should_retry(&failure, 3));
    assert!(!policy.should_retry(&failure, 5));
}

#[test]
fn backoff_schedule_is_capped() {
    let policy = policy(5);

    assert_eq!(policy.calculate_retry_delay(1), Duration::from_secs(1));
    assert_eq!(policy.calculate_retry_delay(2), Duration::from_secs(2));
    assert_eq!(policy.calculate_retry_delay(3), Duration::from_secs(4));
    assert_eq!(policy.calculate_retry_delay(6), Duration::from_secs(30));
    assert_eq!(policy.calculate_retry_delay(0), Duration::from_secs(1));
}

#[test]
fn io_errors_in_source_chain_are_classified() {
    let policy = policy(5);
    let wrapped = HandlerFailure::new(FailureCause::Network, "upstream").with_source(
        std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
    );
    assert_eq!(policy.classify(&wrapped), FailureKind::Transient);

    let bare = std::io::Error::new(std::io::ErrorKind::InvalidData, "garbage");
    assert_eq!(policy.classify(&bare), FailureKind::Permanent);
}

#[test]
fn unrecognised_errors_get_half_the_budget() {
    #[derive(Debug, thiserror::Error)]
    #[error("something odd")]
    struct Odd;

    let policy = policy(5);
    assert_eq!(policy.classify(&Odd), FailureKind::Unknown);
    assert!(policy.should_retry(&Odd, 1));
    assert!(!policy.should_retry(&Odd, 2));
}

#[derive(Debug)]
struct AlwaysCritical;

impl ErrorClassifier for AlwaysCritical {
    fn classify(&self, _error: &(dyn StdError + 'static)) -> FailureKind {
        FailureKind::Critical
    }
}

#[test]
fn custom_classifier_is_the_only_source_of_truth() {
    let policy = policy(5).with_classifier(Arc::new(AlwaysCritical));
    assert!(!policy.should_retry(&HandlerFailure::timeout("slow"), 1));
}

#[test]
fn config_defaults_produce_working_policy() {
    let policy = RetryPolicy::from_config(&RetryConfig::default());
    assert_eq!(policy.max_retry_attempts(), 3);
    assert_eq!(policy.calculate_retry_delay(1), Duration::from_millis(1000));
    assert_eq!(policy.max_delay(), Duration::from_millis(30_000));
}

fn terminal_failure() -> impl Strategy<Value = HandlerFailure> {
    prop_oneof![
        Just(FailureCause::Validation),
        Just(FailureCause::BusinessRule),
        Just(FailureCause::DataIntegrity),
        Just(FailureCause::SecurityViolation),
    ]
    .prop_map(|cause| HandlerFailure::new(cause, "handler rejected message"))
}

proptest! {
    #[test]
    fn delay_is_monotonic_and_capped(
        initial_ms in 1u64..5_000,
        multiplier in 1.0f64..4.0,
        max_ms in 5_000u64..120_000,
        attempt in 1u32..64,
    ) {
        let policy = RetryPolicy::new(
            10,
            Duration::from_millis(initial_ms),
            multiplier,
            Duration::from_millis(max_ms),
        );
        let current = policy.calculate_retry_delay(attempt);
        let next = policy.calculate_retry_delay(attempt + 1);

        prop_assert!(current <= next);
        prop_assert!(next <= Duration::from_millis(max_ms));
    }

    #[test]
    fn terminal_failures_never_retry(failure in terminal_failure(), attempt in 0u32..100) {
        prop_assert!(!policy(5).should_retry(&failure, attempt));
    }

    #[test]
    fn transient_failures_retry_below_max(max in 1u32..20, attempt in 0u32..40) {
        let failure = HandlerFailure::timeout("slow");
        prop_assert_eq!(policy(max).should_retry(&failure, attempt), attempt < max);
    }
}
