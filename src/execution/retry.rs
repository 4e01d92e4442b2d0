use std::future::Future;

use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;

/// Bounded retry with exponential backoff for gateway calls
///
/// `max_attempts` counts every call including the first. The wait before
/// attempt `n + 1` is `base_delay * 2^(n - 1)`. Only transient errors are
/// retried. With a shutdown token attached, [`RetryPolicy::run`] abandons a
/// backoff as soon as the token is cancelled.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    shutdown: Option<CancellationToken>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Backoff before the attempt following `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }

    /// Run `operation` until it succeeds, fails permanently, attempts run out
    /// or shutdown is requested
    pub async fn run<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        self.retry(operation_name, operation, self.shutdown.as_ref())
            .await
    }

    /// Like [`RetryPolicy::run`] but ignores shutdown; for order submission
    pub async fn run_to_completion<F, Fut, T>(
        &self,
        operation_name: &str,
        operation: F,
    ) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        self.retry(operation_name, operation, None).await
    }

    async fn retry<F, Fut, T>(
        &self,
        operation_name: &str,
        mut operation: F,
        shutdown: Option<&CancellationToken>,
    ) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(
                            "✓ {} succeeded after {} attempts",
                            operation_name,
                            attempt
                        );
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let backoff = self.backoff(attempt);
                    tracing::warn!(
                        "{} attempt {}/{} failed ({}): {}. Retrying in {:?}...",
                        operation_name,
                        attempt,
                        self.max_attempts,
                        e.kind(),
                        e,
                        backoff
                    );
                    match shutdown {
                        Some(token) => {
                            tokio::select! {
                                _ = token.cancelled() => {
                                    tracing::warn!(
                                        "{} retry abandoned after {} attempts: shutting down",
                                        operation_name,
                                        attempt
                                    );
                                    return Err(e);
                                }
                                _ = sleep(backoff) => {}
                            }
                        }
                        None => sleep(backoff).await,
                    }
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::error!(
                            "{} failed after {} attempts ({}): {}",
                            operation_name,
                            attempt,
                            e.kind(),
                            e
                        );
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result = policy
            .run("fetch", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(GatewayError::Transient("timeout".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // base + 2 * base
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .run("fetch", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GatewayError::Transient("503".into())) }
            })
            .await;

        assert_eq!(result, Err(GatewayError::Transient("503".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<(), _> = policy
            .run("submit", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GatewayError::Rejected("insufficient balance".into())) }
            })
            .await;

        assert!(matches!(result, Err(GatewayError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cuts_backoff_short() {
        let shutdown = CancellationToken::new();
        let policy = RetryPolicy::new(3, Duration::from_secs(10)).with_shutdown(shutdown.clone());
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let canceller = tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            shutdown.cancel();
        });
        let result: Result<(), _> = policy
            .run("fetch", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GatewayError::Transient("timeout".into())) }
            })
            .await;
        canceller.await.unwrap();

        assert!(matches!(result, Err(GatewayError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_to_completion_ignores_shutdown() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let policy = RetryPolicy::new(3, Duration::from_secs(1)).with_shutdown(shutdown);
        let calls = AtomicU32::new(0);

        let result = policy
            .run_to_completion("submit_order", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 2 {
                        Err(GatewayError::Transient("timeout".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(2));
    }

    #[test]
    fn test_zero_attempts_clamped() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1));
        assert_eq!(policy.max_attempts, 1);
    }
}
