//! # Retry Policy Module
//!
//! Bounded exponential backoff for transient transport failures.
//!
//! A [`RetryPolicy`] is an immutable value handed to every client the factory
//! builds. Delays grow as `minimum_backoff * 2^attempt`, capped at
//! `maximum_backoff`, until `maximum_retry_count` retries have been spent;
//! the triggering error is then propagated.

use crate::error::{ConfigurationError, QueueError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Default minimum backoff in seconds
pub const DEFAULT_MINIMUM_BACKOFF_SECS: f64 = 5.0;

/// Default maximum backoff in seconds
pub const DEFAULT_MAXIMUM_BACKOFF_SECS: f64 = 30.0;

/// Default number of retries after the initial attempt
pub const DEFAULT_MAXIMUM_RETRY_COUNT: u32 = 10;

const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Retry policy configuration for exponential backoff
///
/// # Examples
///
/// ```rust
/// use queue_bridge::retry::{build_retry_policy, RetryPolicy};
/// use std::time::Duration;
///
/// // Default policy: 5s minimum, 30s maximum, 10 retries
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.maximum_backoff(), Duration::from_secs(30));
///
/// // Custom policy from seconds
/// let policy = build_retry_policy(1.0, 8.0, 3).unwrap();
/// assert_eq!(policy.maximum_retry_count(), 3);
///
/// // Minimum above maximum is rejected
/// assert!(build_retry_policy(30.0, 5.0, 10).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    minimum_backoff: Duration,
    maximum_backoff: Duration,
    maximum_retry_count: u32,
    jitter_percent: Option<f64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            minimum_backoff: Duration::from_secs_f64(DEFAULT_MINIMUM_BACKOFF_SECS),
            maximum_backoff: Duration::from_secs_f64(DEFAULT_MAXIMUM_BACKOFF_SECS),
            maximum_retry_count: DEFAULT_MAXIMUM_RETRY_COUNT,
            jitter_percent: None,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    ///
    /// # Errors
    ///
    /// [`ConfigurationError::InvalidRetryPolicy`] when `minimum_backoff`
    /// exceeds `maximum_backoff`.
    pub fn new(
        minimum_backoff: Duration,
        maximum_backoff: Duration,
        maximum_retry_count: u32,
    ) -> Result<Self, ConfigurationError> {
        if minimum_backoff > maximum_backoff {
            return Err(ConfigurationError::InvalidRetryPolicy {
                message: format!(
                    "minimum backoff {:?} is greater than maximum backoff {:?}",
                    minimum_backoff, maximum_backoff
                ),
            });
        }

        Ok(Self {
            minimum_backoff,
            maximum_backoff,
            maximum_retry_count,
            jitter_percent: None,
        })
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            minimum_backoff: Duration::ZERO,
            maximum_backoff: Duration::ZERO,
            maximum_retry_count: 0,
            jitter_percent: None,
        }
    }

    /// Randomize delays by up to +-`percent` (clamped to 0.0..=1.0)
    pub fn with_jitter_percent(mut self, percent: f64) -> Self {
        self.jitter_percent = Some(percent.clamp(0.0, 1.0));
        self
    }

    pub fn minimum_backoff(&self) -> Duration {
        self.minimum_backoff
    }

    pub fn maximum_backoff(&self) -> Duration {
        self.maximum_backoff
    }

    pub fn maximum_retry_count(&self) -> u32 {
        self.maximum_retry_count
    }

    pub fn jitter_percent(&self) -> Option<f64> {
        self.jitter_percent
    }

    /// Calculate delay for a specific retry attempt
    ///
    /// Uses `minimum_backoff * 2^attempt`, capped at `maximum_backoff`.
    ///
    /// # Arguments
    ///
    /// * `attempt` - Retry attempt number (0-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay_secs = self.minimum_backoff.as_secs_f64() * BACKOFF_MULTIPLIER.powi(exponent);

        let capped_delay_secs = base_delay_secs.min(self.maximum_backoff.as_secs_f64());

        let final_delay_secs = match self.jitter_percent {
            Some(percent) => Self::add_jitter(capped_delay_secs, percent),
            None => capped_delay_secs,
        };

        Duration::from_secs_f64(final_delay_secs)
    }

    /// Check if we should retry for this attempt number
    ///
    /// # Arguments
    ///
    /// * `attempt` - Current attempt number (0-based, where 0 is first retry)
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.maximum_retry_count
    }

    /// Get total number of attempts (initial + retries)
    pub fn total_attempts(&self) -> u32 {
        self.maximum_retry_count.saturating_add(1)
    }

    /// Applies random variation in range [delay * (1-jitter), delay * (1+jitter)]
    fn add_jitter(delay_secs: f64, jitter_percent: f64) -> f64 {
        let jitter_range = delay_secs * jitter_percent;
        if jitter_range <= 0.0 {
            return delay_secs;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(-jitter_range..=jitter_range);

        (delay_secs + jitter).max(0.0)
    }
}

/// Build a retry policy from seconds and a signed retry count.
///
/// # Errors
///
/// [`ConfigurationError::InvalidRetryPolicy`] if either backoff is negative or
/// not finite, if `min_backoff_secs > max_backoff_secs`, or if
/// `max_retries < 0`.
pub fn build_retry_policy(
    min_backoff_secs: f64,
    max_backoff_secs: f64,
    max_retries: i64,
) -> Result<RetryPolicy, ConfigurationError> {
    let minimum_backoff = backoff_from_secs("minimum", min_backoff_secs)?;
    let maximum_backoff = backoff_from_secs("maximum", max_backoff_secs)?;

    let maximum_retry_count =
        u32::try_from(max_retries).map_err(|_| ConfigurationError::InvalidRetryPolicy {
            message: format!(
                "maximum retry count must be between 0 and {}, got {}",
                u32::MAX,
                max_retries
            ),
        })?;

    RetryPolicy::new(minimum_backoff, maximum_backoff, maximum_retry_count)
}

fn backoff_from_secs(which: &str, secs: f64) -> Result<Duration, ConfigurationError> {
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigurationError::InvalidRetryPolicy {
        message: format!(
            "{} backoff must be a finite, non-negative number of seconds, got {}",
            which, secs
        ),
    })
}

/// State tracker for retry operations
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Current retry attempt (0-based)
    pub attempt: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment to next retry attempt
    pub fn next_attempt(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    /// Start over after a success
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Get next delay from policy
    pub fn get_delay(&self, policy: &RetryPolicy) -> Duration {
        policy.calculate_delay(self.attempt)
    }

    /// Check if we can retry with this policy
    pub fn can_retry(&self, policy: &RetryPolicy) -> bool {
        policy.should_retry(self.attempt)
    }
}

/// Run `operation` until it succeeds, fails with a non-transient error, or
/// the policy's retries are exhausted.
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, QueueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, QueueError>>,
{
    let mut state = RetryState::new();

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && state.can_retry(policy) => {
                let delay = state.get_delay(policy);
                debug!(
                    operation = operation_name,
                    attempt = state.attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                state.next_attempt();
            }
            Err(error) => {
                if error.is_transient() {
                    warn!(
                        operation = operation_name,
                        attempts = state.attempt + 1,
                        error = %error,
                        "Retries exhausted"
                    );
                }
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
