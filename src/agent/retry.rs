//! Retry with exponential backoff for rate-limit-class agent failures.

use gantry_common::agent::AgentError;
use gantry_common::snapshot::RetryPolicy;
use std::future::Future;
use std::time::Duration;

/// Run `f` up to `policy.max_attempts` times, sleeping
/// `policy.delay_secs(attempt)` between attempts. Only
/// [`AgentError::is_retryable`] failures are retried; everything else
/// propagates immediately.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, mut f: F) -> Result<T, AgentError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
{
    let mut attempt = 1u32;
    loop {
        match f(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_secs(attempt);
                tracing::warn!(attempt, delay_secs = delay, error = %err, "agent rate limited, backing off");
                tokio::time::sleep(Duration::from_secs(delay)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn instant_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_secs: 0,
        }
    }

    #[tokio::test]
    async fn succeeds_first_try_without_retrying() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let result = with_backoff(&instant_policy(5), move |_| {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AgentError>(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_rate_limits_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let result = with_backoff(&instant_policy(5), move |attempt| {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(AgentError::RateLimited("429".to_string()))
                } else {
                    Ok("ok")
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let err = with_backoff(&instant_policy(3), move |_| {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AgentError::RateLimited("429".to_string()))
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, AgentError::RateLimited(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_propagate_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let err = with_backoff(&instant_policy(5), move |_| {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AgentError::Timeout { timeout_secs: 120 })
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, AgentError::Timeout { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
