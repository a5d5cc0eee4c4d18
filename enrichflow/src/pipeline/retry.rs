//! Retry envelope with configurable backoff and jitter.
//!
//! Wraps one fallible async unit. Transient failures are retried up to the
//! attempt ceiling; permanent ones return immediately. The caller always gets
//! a [`RetryError`] value, never a panic or an unhandled error.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::errors::{RetryError, Retryable};

/// Backoff strategy for retry delays. `attempt` is the 1-based number of the
/// attempt that just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// delay = base * attempt
    #[default]
    Linear,
    /// delay = base * 2^(attempt - 1)
    Exponential,
    /// delay = base
    Constant,
}

/// Jitter applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterStrategy {
    /// Exact delays.
    #[default]
    None,
    /// Uniform in `0..=delay`.
    Full,
    /// Half fixed, half uniform.
    Equal,
}

/// Attempt ceiling and delay schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts including the first. At least 1.
    pub max_attempts: u32,
    /// Base delay.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            backoff: BackoffStrategy::Linear,
            jitter: JitterStrategy::None,
        }
    }
}

impl RetryPolicy {
    /// Builds the policy used by the enrichment pipeline.
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_delay: config.retry_max_delay(),
            backoff: config.retry_backoff,
            jitter: config.retry_jitter,
            ..Self::default()
        }
        .with_max_attempts(config.retry_attempts)
        .with_base_delay(config.retry_base_delay())
    }

    /// Sets the attempt ceiling. Zero is treated as one.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub const fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Delay to wait after `attempt` (1-based) failed, before jitter.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt.max(1)),
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Constant => self.base_delay,
        };
        delay.min(self.max_delay)
    }

    /// Delay to wait after `attempt` failed, jitter included.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return delay;
        }
        match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => Duration::from_millis(rand::thread_rng().gen_range(0..=millis)),
            JitterStrategy::Equal => {
                let half = millis / 2;
                Duration::from_millis(half + rand::thread_rng().gen_range(0..=half))
            }
        }
    }
}

/// Runs `operation` under `policy`.
///
/// Sleeping between attempts suspends only the calling task. Errors whose
/// [`Retryable::is_transient`] is false end the envelope after one attempt.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    key: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(RetryError::Permanent(e)),
            Err(e) if attempt >= policy.max_attempts => {
                debug!(key, attempt, error = %e, "Retries exhausted");
                return Err(RetryError::RetriesExhausted { attempts: attempt, last: e });
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                debug!(
                    key,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::errors::PredictionError;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transport() -> PredictionError {
        PredictionError::TransportError("503".into())
    }

    fn policy_from_toml(pipeline: &str) -> RetryPolicy {
        let config = AppConfig::from_toml_str(&format!("[pipeline]\n{pipeline}")).unwrap();
        RetryPolicy::from_config(&config.pipeline)
    }

    #[test]
    fn test_policy_from_config() {
        let config = PipelineConfig::default()
            .with_retry_attempts(4)
            .with_retry_base_delay_ms(250);
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(300));
        assert_eq!(policy.backoff, BackoffStrategy::Linear);
        assert_eq!(policy.jitter, JitterStrategy::None);
    }

    #[test]
    fn test_linear_backoff_grows_with_attempt() {
        let policy = RetryPolicy::default().with_base_delay(Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(15));
    }

    #[test]
    fn test_exponential_and_constant_backoff_from_config() {
        let policy = policy_from_toml("retry_base_delay_ms = 100\nretry_backoff = \"exponential\"");
        assert_eq!(policy.backoff, BackoffStrategy::Exponential);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));

        let policy = policy_from_toml("retry_base_delay_ms = 100\nretry_backoff = \"constant\"");
        assert_eq!(policy.delay_for(7), Duration::from_millis(100));
    }

    #[test]
    fn test_delay_capped_from_config() {
        let policy = policy_from_toml("retry_base_delay_ms = 10000\nretry_max_delay_ms = 15000");
        assert_eq!(policy.delay_for(5), Duration::from_secs(15));
    }

    #[test]
    fn test_jitter_from_config_stays_in_bounds() {
        let policy = policy_from_toml("retry_base_delay_ms = 100\nretry_jitter = \"full\"");
        assert_eq!(policy.jitter, JitterStrategy::Full);
        for _ in 0..50 {
            assert!(policy.delay_for(2) <= Duration::from_millis(200));
        }

        let policy = policy_from_toml("retry_base_delay_ms = 100\nretry_jitter = \"equal\"");
        for _ in 0..50 {
            let d = policy.delay_for(2);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_unknown_backoff_rejected() {
        let err = AppConfig::from_toml_str("[pipeline]\nretry_backoff = \"fibonacci\"").unwrap_err();
        assert!(matches!(err, crate::errors::ConfigError::Parse(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::default().with_max_attempts(3);
        let calls = AtomicU32::new(0);

        let started = tokio::time::Instant::now();
        let result = with_retry(&policy, "row-1", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(transport())
            } else {
                Ok("ok")
            }
        })
        .await;

        assert_eq!(result, Ok("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 5s after the first failure, 10s after the second
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_tagged_error() {
        let policy = RetryPolicy::default().with_max_attempts(3);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(&policy, "row-2", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(PredictionError::MalformedResponse("not json".into()))
        })
        .await;

        assert_eq!(
            result,
            Err(RetryError::RetriesExhausted {
                attempts: 3,
                last: PredictionError::MalformedResponse("not json".into()),
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(&policy, "row-3", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(PredictionError::EmptyInput)
        })
        .await;

        assert_eq!(result, Err(RetryError::Permanent(PredictionError::EmptyInput)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_does_not_block_siblings() {
        let policy = RetryPolicy::default().with_max_attempts(2);
        let sibling_done = AtomicU32::new(0);

        let retrying = with_retry(&policy, "slow", || async {
            if sibling_done.load(Ordering::SeqCst) == 0 {
                Err(transport())
            } else {
                Ok(())
            }
        });
        let sibling = async {
            sibling_done.store(1, Ordering::SeqCst);
        };

        let (result, ()) = tokio::join!(retrying, sibling);
        assert_eq!(result, Ok(()));
    }
}
