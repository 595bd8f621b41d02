//! Exponential backoff retry.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result, RetryError};

/// Backoff policy for [`retry`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Backoff before the attempt following failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let scaled = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped
        };
        Duration::from_secs_f64(scaled.max(0.0))
    }
}

/// Retry `op` on errors where [`Error::is_retryable`] holds.
pub async fn retry<T, F, Fut>(config: &RetryConfig, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_if(config, Error::is_retryable, op).await
}

/// Retry `op` while `should_retry` holds for the error it returns.
///
/// Errors that fail the predicate are returned as-is. Once attempts run out
/// the last error is wrapped in [`RetryError::Exhausted`]. A provider's
/// `retry_after` hint stretches the delay, still capped at `max_delay`.
pub async fn retry_if<T, F, Fut, P>(config: &RetryConfig, should_retry: P, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !should_retry(&err) {
            return Err(err);
        }
        if attempt >= max_attempts {
            warn!(attempts = attempt, error = %err, "Retries exhausted");
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last_error: Box::new(err),
            }
            .into());
        }

        let mut delay = config.delay_for(attempt);
        if let Some(hint) = err.retry_after() {
            delay = delay.max(hint).min(config.max_delay);
        }
        debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::error::{AgentError, LlmError};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            jitter: false,
            ..RetryConfig::default()
        }
    }

    fn transient() -> Error {
        LlmError::ServerError {
            provider: "openai".into(),
            reason: "503".into(),
        }
        .into()
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let config = RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        };
        assert_eq!(config.delay_for(1), Duration::from_secs(1));
        assert_eq!(config.delay_for(2), Duration::from_secs(2));
        assert_eq!(config.delay_for(3), Duration::from_secs(4));
        assert_eq!(config.delay_for(10), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_half_to_full() {
        let config = RetryConfig::default();
        for _ in 0..100 {
            let delay = config.delay_for(2);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(2));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = &AtomicU32::new(0);
        let result = retry(&fast(), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(transient())
            } else {
                Ok("ok")
            }
        })
        .await
        .unwrap();

        assert_eq!(result, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempts() {
        let calls = &AtomicU32::new(0);
        let err = retry(&fast(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(transient())
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("failed after 3 attempts"));
        assert!(matches!(err, Error::Retry(RetryError::Exhausted { attempts: 3, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_returns_immediately() {
        let calls = &AtomicU32::new(0);
        let err = retry(&fast(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::Agent(AgentError::InvalidInput {
                agent: "triage".into(),
                reason: "empty".into(),
            }))
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, Error::Agent(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_stretches_delay() {
        let start = tokio::time::Instant::now();
        let calls = &AtomicU32::new(0);
        let _ = retry(&fast(), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Llm(LlmError::RateLimited {
                    provider: "anthropic".into(),
                    retry_after: Some(Duration::from_secs(5)),
                }))
            } else {
                Ok(())
            }
        })
        .await;

        assert!(start.elapsed() >= Duration::from_secs(5));
    }
}
