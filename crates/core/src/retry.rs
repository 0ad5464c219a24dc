use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::errors::ApplicationError;

/// Bounded exponential backoff for transient outbound failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 2, base_delay_ms: 200, max_delay_ms: 2_000 }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self { max_retries: 0, base_delay_ms: 0, max_delay_ms: 0 }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. Only `ApplicationError::is_retryable` errors are retried.
    pub async fn run<T, F, Fut>(
        &self,
        operation_name: &str,
        mut operation: F,
    ) -> Result<T, ApplicationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApplicationError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < self.max_retries => {
                    let delay = self.backoff(attempt);
                    warn!(
                        event_name = "outbound.retry.scheduled",
                        operation = operation_name,
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient outbound failure; retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::RetryPolicy;
    use crate::errors::ApplicationError;

    fn instant_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy { max_retries, base_delay_ms: 0, max_delay_ms: 0 }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy { max_retries: 5, base_delay_ms: 100, max_delay_ms: 500 };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = instant_policy(3)
            .run("check_status", || async {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                if call < 2 {
                    Err(ApplicationError::transient_gateway("timeout"))
                } else {
                    Ok(call)
                }
            })
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn business_rejections_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = instant_policy(3)
            .run("get_methods", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ApplicationError::Validation("bad amount".to_string()))
            })
            .await;

        assert!(matches!(result, Err(ApplicationError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = instant_policy(2)
            .run("get_requisites", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ApplicationError::transient_gateway("connection reset"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
