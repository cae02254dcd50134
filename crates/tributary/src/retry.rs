//! Bounded retry around single upstream API calls.
//!
//! Transient failures (rate limiting, server errors, network trouble) are
//! retried with exponential backoff; permanent failures are returned on the
//! first attempt so the caller can short-circuit.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder, Retryable};

use crate::api::{ApiClient, ApiError, ObjectList, Request};
use crate::record::Record;

/// Delay before the first retry.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on any single delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Total attempts per call, the first one included.
pub const MAX_ATTEMPTS: usize = 5;

/// Configuration for retry operations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub min_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Total number of attempts, including the first.
    pub max_attempts: usize,
    /// Whether to add jitter to delays.
    pub with_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay: INITIAL_BACKOFF,
            max_delay: MAX_BACKOFF,
            max_attempts: MAX_ATTEMPTS,
            with_jitter: false,
        }
    }
}

impl RetryConfig {
    /// Build an exponential backoff strategy from this configuration.
    #[must_use]
    pub fn into_backoff(self) -> ExponentialBuilder {
        let mut builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_factor(2.0)
            .with_max_times(self.max_attempts.saturating_sub(1));

        if self.with_jitter {
            builder = builder.with_jitter();
        }

        builder
    }

    /// The sequence of delays this configuration sleeps between attempts.
    #[must_use]
    pub fn delays(self) -> Vec<Duration> {
        self.into_backoff().build().collect()
    }
}

/// Build the default backoff: 1s doubling up to 30s, 5 attempts, no jitter.
#[must_use]
pub fn default_backoff() -> ExponentialBuilder {
    RetryConfig::default().into_backoff()
}

/// Run `operation`, retrying transient API errors with the default backoff.
///
/// `what` names the call in log lines.
pub async fn with_retry<T, F, Fut>(operation: F, what: &str) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    with_retry_config(operation, what, RetryConfig::default()).await
}

/// [`with_retry`] with an explicit configuration.
pub async fn with_retry_config<T, F, Fut>(
    mut operation: F,
    what: &str,
    config: RetryConfig,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let max_attempts = config.max_attempts;
    let attempt = AtomicUsize::new(0);

    let retry_op = || {
        attempt.fetch_add(1, Ordering::SeqCst);
        operation()
    };

    retry_op
        .retry(config.into_backoff())
        .when(|e: &ApiError| !e.is_permanent())
        .notify(|err: &ApiError, delay: Duration| {
            let attempts_left = max_attempts.saturating_sub(attempt.load(Ordering::SeqCst));
            tracing::warn!(
                call = what,
                attempts_left,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "api call failed, will retry after delay"
            );
        })
        .await
}

/// Fetch one listing page with retries.
pub async fn fetch_list_with_retry<C: ApiClient + ?Sized>(
    client: &C,
    request: &Request,
) -> Result<ObjectList, ApiError> {
    with_retry(|| client.fetch_list(request), &request.path).await
}

/// Fetch one object with retries.
pub async fn fetch_one_with_retry<C: ApiClient + ?Sized>(
    client: &C,
    request: &Request,
) -> Result<Record, ApiError> {
    with_retry(|| client.fetch_one(request), &request.path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    use tokio::time::Instant;

    fn transient() -> ApiError {
        ApiError::Transient {
            status: 503,
            message: "service unavailable".to_string(),
        }
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();

        assert_eq!(config.min_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.max_attempts, 5);
        assert!(!config.with_jitter);
    }

    #[test]
    fn default_delays_double_from_one_second() {
        let delays = RetryConfig::default().delays();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ]
        );
    }

    #[test]
    fn delays_are_non_decreasing_and_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            ..RetryConfig::default()
        };
        let delays = config.delays();

        assert_eq!(delays.len(), 9);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= MAX_BACKOFF));
        assert_eq!(delays.last(), Some(&MAX_BACKOFF));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_use_all_five_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_capture = Arc::clone(&calls);
        let start = Instant::now();

        let err = with_retry(
            move || {
                let calls = Arc::clone(&calls_capture);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(transient())
                }
            },
            "/v1/charges",
        )
        .await
        .expect_err("should exhaust attempts");

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(!err.is_permanent());
        assert!(start.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_recover_when_the_call_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_capture = Arc::clone(&calls);

        let value = with_retry(
            move || {
                let calls = Arc::clone(&calls_capture);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient())
                    } else {
                        Ok(42u32)
                    }
                }
            },
            "/v1/charges",
        )
        .await
        .expect("third attempt succeeds");

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_fail_on_first_attempt_without_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_capture = Arc::clone(&calls);
        let start = Instant::now();

        let err = with_retry(
            move || {
                let calls = Arc::clone(&calls_capture);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ApiError::from_status(401, b""))
                }
            },
            "/v1/charges",
        )
        .await
        .expect_err("permanent");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(err.is_auth_related());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
