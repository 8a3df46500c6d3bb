//! Retry with backoff.
//!
//! One primitive, [`retry_with_backoff`], runs an idempotent async operation
//! until it succeeds, fails with a non-retryable error, or exhausts the
//! attempt bound of its [`RetryPolicy`]. Delays come from a
//! [`BackoffConfig`] with optional proportional jitter.
//!
//! The same [`BackoffConfig`] also drives delays that are not bounded by an
//! attempt count, such as listener reconnection.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

// =============================================================================
// Backoff
// =============================================================================

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Fixed delay between attempts.
    Fixed {
        /// Delay duration.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// Exponential backoff.
    Exponential {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,

        /// Multiplier for each retry (default: 2.0).
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },

    /// Linear backoff.
    Linear {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Increment per retry.
        #[serde(with = "humantime_serde")]
        increment: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
    },
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay after a given failed attempt (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let step = attempt.saturating_sub(1);
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                let exponent = i32::try_from(step).unwrap_or(i32::MAX);
                let delay_secs = initial_delay.as_secs_f64() * multiplier.powi(exponent);
                Duration::try_from_secs_f64(delay_secs)
                    .unwrap_or(*max_delay)
                    .min(*max_delay)
            },
            Self::Linear {
                initial_delay,
                increment,
                max_delay,
            } => increment
                .checked_mul(step)
                .and_then(|extra| initial_delay.checked_add(extra))
                .unwrap_or(*max_delay)
                .min(*max_delay),
        }
    }

    /// Upper bound of any delay this configuration produces.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential { max_delay, .. } | Self::Linear { max_delay, .. } => *max_delay,
        }
    }

    /// Smallest delay this configuration produces.
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential { initial_delay, .. } | Self::Linear { initial_delay, .. } => {
                *initial_delay
            },
        }
    }
}

/// Spreads `delay` uniformly over `delay * (1 ± ratio)`.
///
/// `ratio` is clamped to `[0, 1]`; zero returns `delay` unchanged.
#[must_use]
pub fn jittered(delay: Duration, ratio: f64) -> Duration {
    let ratio = ratio.clamp(0.0, 1.0);
    if ratio <= 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range((1.0 - ratio)..=(1.0 + ratio));
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Bounded retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Proportional jitter applied to each delay, `0.0..=1.0`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Delay between attempts.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_jitter() -> f64 {
    0.2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            jitter: default_jitter(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl RetryPolicy {
    /// A policy with a fixed delay and no jitter.
    #[must_use]
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            jitter: 0.0,
            backoff: BackoffConfig::Fixed { delay },
        }
    }

    /// Sets the attempt bound.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the jitter ratio.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Jittered delay after failed attempt `attempt`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        jittered(self.backoff.delay_for_attempt(attempt), self.jitter)
    }
}

// =============================================================================
// Retry Loop
// =============================================================================

/// Classifies errors for [`retry_with_backoff`].
pub trait Retryable {
    /// Returns `true` if another attempt may succeed.
    fn is_retryable(&self) -> bool;
}

/// A successful result and the attempt that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    /// Operation result.
    pub value: T,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// Failure of a retried operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The attempt bound was reached; `last` is the final error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the last attempt.
        last: E,
    },

    /// The operation failed with a non-retryable error.
    #[error("permanent failure after {attempts} attempts: {error}")]
    Permanent {
        /// Attempts made.
        attempts: u32,
        /// The non-retryable error.
        error: E,
    },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Permanent { attempts, .. } => *attempts,
        }
    }

    /// The final underlying error.
    #[must_use]
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Permanent { error, .. } => error,
        }
    }
}

/// Runs `operation` until it succeeds or the policy gives up.
///
/// `operation` receives the 1-based attempt number and must be idempotent.
/// `on_failure` observes every failed attempt before the retry decision, so
/// callers can keep their own bookkeeping (retry counters, metrics).
/// A `max_attempts` of zero is treated as one.
pub async fn retry_with_backoff<T, E, F, Fut, H>(
    policy: &RetryPolicy,
    mut operation: F,
    mut on_failure: H,
) -> Result<Retried<T>, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
    H: FnMut(u32, &E),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                });
            },
            Err(error) => {
                on_failure(attempt, &error);
                if !error.is_retryable() {
                    return Err(RetryError::Permanent {
                        attempts: attempt,
                        error,
                    });
                }
                if attempt >= max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: error,
                    });
                }
                let delay = policy.delay_for_attempt(attempt);
                debug!(attempt, max_attempts, ?delay, error = %error, "attempt failed, backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
        }
    }
}

pub(crate) mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum TestError {
        Flaky,
        Fatal,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, Self::Flaky)
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let config = BackoffConfig::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(60));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(60));
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
    }

    #[test]
    fn test_linear_backoff() {
        let config = BackoffConfig::Linear {
            initial_delay: Duration::from_secs(1),
            increment: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(50), Duration::from_secs(10));
        assert_eq!(config.initial_delay(), Duration::from_secs(1));
        assert_eq!(config.max_delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let base = Duration::from_millis(1000);
        assert_eq!(jittered(base, 0.0), base);
        for _ in 0..100 {
            let delay = jittered(base, 0.25);
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_backoff_config_toml() {
        let policy: RetryPolicy = toml::from_str(
            r#"
            max_attempts = 3
            jitter = 0.0
            [backoff]
            type = "exponential"
            initial_delay = "250ms"
            max_delay = "5s"
            "#,
        )
        .unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(
            policy.backoff,
            BackoffConfig::Exponential {
                initial_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(5),
                multiplier: 2.0,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let mut failures = Vec::new();
        let policy = RetryPolicy::fixed(5, Duration::from_secs(1));

        let result = retry_with_backoff(
            &policy,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 4 {
                        Err(TestError::Flaky)
                    } else {
                        Ok(attempt * 10)
                    }
                }
            },
            |attempt, _| failures.push(attempt),
        )
        .await
        .unwrap();

        assert_eq!(result.value, 40);
        assert_eq!(result.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(failures, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_bound() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        let err = retry_with_backoff(
            &policy,
            |_| async { Err::<(), _>(TestError::Flaky) },
            |_, _| {},
        )
        .await
        .unwrap_err();
        assert_eq!(err.attempts(), 3);
        assert!(matches!(err, RetryError::Exhausted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_permanent_error() {
        let policy = RetryPolicy::fixed(5, Duration::from_secs(1));
        let err = retry_with_backoff(
            &policy,
            |_| async { Err::<(), _>(TestError::Fatal) },
            |_, _| {},
        )
        .await
        .unwrap_err();
        assert_eq!(err.attempts(), 1);
        assert_eq!(err.into_inner(), TestError::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempt_bound_still_runs_once() {
        let policy = RetryPolicy::fixed(0, Duration::ZERO);
        let result = retry_with_backoff(&policy, |_| async { Ok::<_, TestError>(7) }, |_, _| {})
            .await
            .unwrap();
        assert_eq!(result.attempts, 1);
    }
}
