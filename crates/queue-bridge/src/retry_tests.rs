//! Tests for retry policy module

use super::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn fast_policy(retries: u32) -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(4), retries).unwrap()
}

// ============================================================================
// RetryPolicy Tests
// ============================================================================

#[test]
fn test_retry_policy_default_values() {
    let policy = RetryPolicy::default();

    assert_eq!(policy.minimum_backoff(), Duration::from_secs(5));
    assert_eq!(policy.maximum_backoff(), Duration::from_secs(30));
    assert_eq!(policy.maximum_retry_count(), 10);
    assert_eq!(policy.jitter_percent(), None);
}

#[test]
fn test_build_retry_policy_keeps_exact_fields() {
    let policy = build_retry_policy(1.5, 12.0, 4).unwrap();

    assert_eq!(policy.minimum_backoff(), Duration::from_millis(1500));
    assert_eq!(policy.maximum_backoff(), Duration::from_secs(12));
    assert_eq!(policy.maximum_retry_count(), 4);
}

#[test]
fn test_build_retry_policy_accepts_equal_bounds_and_zero_retries() {
    let policy = build_retry_policy(5.0, 5.0, 0).unwrap();

    assert_eq!(policy.minimum_backoff(), policy.maximum_backoff());
    assert!(!policy.should_retry(0));
}

#[test]
fn test_build_retry_policy_rejects_min_greater_than_max() {
    let result = build_retry_policy(30.0, 5.0, 10);

    assert!(matches!(
        result,
        Err(ConfigurationError::InvalidRetryPolicy { .. })
    ));
}

#[test]
fn test_build_retry_policy_rejects_negative_retry_count() {
    let result = build_retry_policy(5.0, 30.0, -1);

    assert!(matches!(
        result,
        Err(ConfigurationError::InvalidRetryPolicy { .. })
    ));
}

#[test]
fn test_build_retry_policy_rejects_negative_or_non_finite_backoff() {
    assert!(build_retry_policy(-1.0, 30.0, 10).is_err());
    assert!(build_retry_policy(5.0, f64::NAN, 10).is_err());
    assert!(build_retry_policy(5.0, f64::INFINITY, 10).is_err());
}

#[test]
fn test_retry_policy_exponential_backoff_sequence() {
    let policy = RetryPolicy::default();

    assert_eq!(policy.calculate_delay(0), Duration::from_secs(5));
    assert_eq!(policy.calculate_delay(1), Duration::from_secs(10));
    assert_eq!(policy.calculate_delay(2), Duration::from_secs(20));

    // Further attempts capped at 30s
    assert_eq!(policy.calculate_delay(3), Duration::from_secs(30));
    assert_eq!(policy.calculate_delay(9), Duration::from_secs(30));
    assert_eq!(policy.calculate_delay(u32::MAX), Duration::from_secs(30));
}

#[test]
fn test_retry_policy_should_retry() {
    let policy = build_retry_policy(1.0, 2.0, 3).unwrap();

    assert!(policy.should_retry(0));
    assert!(policy.should_retry(2));
    assert!(!policy.should_retry(3));
    assert_eq!(policy.total_attempts(), 4);
}

#[test]
fn test_retry_policy_with_jitter_stays_in_range() {
    let policy = RetryPolicy::default().with_jitter_percent(0.5);

    for _ in 0..20 {
        let secs = policy.calculate_delay(0).as_secs_f64();
        // With 50% jitter, 5s base should be in range [2.5s, 7.5s]
        assert!((2.5..=7.5).contains(&secs), "Delay {} out of range", secs);
    }
}

#[test]
fn test_retry_policy_jitter_percent_clamped() {
    let policy = RetryPolicy::default().with_jitter_percent(1.5);
    assert_eq!(policy.jitter_percent(), Some(1.0));

    let policy = RetryPolicy::default().with_jitter_percent(-0.5);
    assert_eq!(policy.jitter_percent(), Some(0.0));
}

// ============================================================================
// RetryState Tests
// ============================================================================

#[test]
fn test_retry_state_workflow() {
    let policy = build_retry_policy(1.0, 4.0, 3).unwrap();
    let mut state = RetryState::new();

    let mut delays = Vec::new();
    while state.can_retry(&policy) {
        delays.push(state.get_delay(&policy));
        state.next_attempt();
    }

    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );

    state.reset();
    assert_eq!(state.attempt, 0);
}

// ============================================================================
// execute_with_retry Tests
// ============================================================================

#[tokio::test]
async fn test_execute_with_retry_recovers_from_transient_errors() {
    let calls = AtomicU32::new(0);

    let result = execute_with_retry(&fast_policy(3), "receive", || {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if call < 2 {
                Err(QueueError::ConnectionFailed {
                    message: "reset".to_string(),
                })
            } else {
                Ok(call)
            }
        }
    })
    .await;

    assert_eq!(result.unwrap(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_execute_with_retry_gives_up_after_retry_budget() {
    let calls = AtomicU32::new(0);

    let result: Result<(), QueueError> = execute_with_retry(&fast_policy(2), "complete", || {
        calls.fetch_add(1, Ordering::SeqCst);
        async {
            Err(QueueError::ServerBusy {
                message: "throttled".to_string(),
            })
        }
    })
    .await;

    assert!(matches!(result, Err(QueueError::ServerBusy { .. })));
    // Initial attempt plus two retries
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_execute_with_retry_does_not_retry_permanent_errors() {
    let calls = AtomicU32::new(0);

    let result: Result<(), QueueError> = execute_with_retry(&fast_policy(5), "send", || {
        calls.fetch_add(1, Ordering::SeqCst);
        async {
            Err(QueueError::AuthenticationFailed {
                message: "bad token".to_string(),
            })
        }
    })
    .await;

    assert!(matches!(
        result,
        Err(QueueError::AuthenticationFailed { .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
