use std::future::Future;
use std::time::Duration;

use rand::Rng;

use poolgate_common::RequestContext;
use poolgate_provider_core::error::ProviderError;

const RETRYABLE_STATUS_CODES: &[u16] = &[408, 429, 500, 502, 503, 504];
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// Exponential delay for `attempt` (0-based): doubling, capped, with a
    /// jitter factor drawn from [0.5, 1.0).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter = rand::rng().random_range(0.5..1.0);
        exp.mul_f64(jitter)
    }
}

/// Retry on retryable failures only, never after cancellation. A 429 with a
/// `Retry-After` hint overrides the computed backoff for that attempt.
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    ctx: &RequestContext,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_retries
                    || !should_retry(&err)
                    || ctx.is_cancelled()
                {
                    return Err(err);
                }
                let delay = err
                    .retry_after
                    .filter(|_| err.rate_limited)
                    .unwrap_or_else(|| policy.delay_for(attempt));
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying upstream call"
                );
                tokio::select! {
                    _ = ctx.cancelled() => return Err(ProviderError::cancelled()),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

fn should_retry(err: &ProviderError) -> bool {
    if !err.retryable {
        return false;
    }
    match err.status {
        Some(status) => RETRYABLE_STATUS_CODES.contains(&status),
        None => err.class.is_retryable(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_doubles_and_respects_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        // Jitter is in [0.5, 1.0), so bounds are deterministic.
        let d0 = policy.delay_for(0);
        assert!(d0 >= Duration::from_millis(50) && d0 < Duration::from_millis(100));
        let d1 = policy.delay_for(1);
        assert!(d1 >= Duration::from_millis(100) && d1 < Duration::from_millis(200));
        let d4 = policy.delay_for(4);
        assert!(d4 < Duration::from_millis(350));
    }

    #[tokio::test]
    async fn retries_stop_on_non_retryable_errors() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let ctx = RequestContext::new(Duration::from_secs(1));
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(&policy, &ctx, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::from_status(401, "denied")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_status_is_attempted_up_to_budget() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let ctx = RequestContext::new(Duration::from_secs(1));
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(&policy, &ctx, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::from_status(503, "unavailable")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_retries() {
        let policy = RetryPolicy::new(5, Duration::from_millis(50));
        let ctx = RequestContext::new(Duration::from_secs(5));
        let calls = AtomicU32::new(0);
        ctx.cancel();
        let result: Result<(), _> = with_retries(&policy, &ctx, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::from_status(500, "boom")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let ctx = RequestContext::new(Duration::from_secs(1));
        let calls = AtomicU32::new(0);
        let result = with_retries(&policy, &ctx, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::from_status(502, "bad gateway"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }
}
