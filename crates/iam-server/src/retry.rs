//! Retry policy for requests forwarded to other nodes.
//!
//! A forwarded call fails transiently when the target node is reconnecting
//! and its stream is briefly missing from the registry. Only that failure is
//! retried, a bounded number of times. A stream closing under an in-flight
//! request is final since the node may already have acted on the frame, and
//! so are timeouts and business errors.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::IamError;

/// Default number of attempts for a forwarded request
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default wait between attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Configuration for forwarded request retries
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Wait between attempts
    pub retry_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl RetryConfig {
    /// Create a config with the given attempt count and interval
    pub fn new(max_attempts: u32, retry_interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_interval,
        }
    }
}

/// Run `operation` until it succeeds, fails permanently or runs out of attempts.
///
/// The wait between attempts ends early when `closed` is cancelled, in which
/// case [`IamError::HandlerClosed`] is returned immediately. `closed` is also
/// checked before every attempt. No wait follows the final attempt.
pub async fn request_with_retry<F, Fut, T>(
    config: &RetryConfig,
    closed: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T, IamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IamError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        if closed.is_cancelled() {
            return Err(IamError::HandlerClosed);
        }

        attempt += 1;

        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !err.is_retryable() {
            debug!(operation = %operation_name, error = %err, "Request failed, not retrying");
            return Err(err);
        }

        if attempt >= max_attempts {
            warn!(
                operation = %operation_name,
                attempt = attempt,
                error = %err,
                "Request failed after max attempts"
            );
            return Err(err);
        }

        debug!(
            operation = %operation_name,
            attempt = attempt,
            error = %err,
            delay_ms = config.retry_interval.as_millis(),
            "Request failed, retrying"
        );

        tokio::select! {
            _ = closed.cancelled() => return Err(IamError::HandlerClosed),
            _ = tokio::time::sleep(config.retry_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig::new(max_attempts, Duration::from_millis(20))
    }

    #[tokio::test]
    async fn succeeds_immediately() {
        let closed = CancellationToken::new();
        let result = request_with_retry(&fast_config(3), &closed, "op", || async {
            Ok::<_, IamError>(42)
        })
        .await;
        assert_eq!(result.expect("should succeed"), 42);
    }

    #[tokio::test]
    async fn succeeds_after_stream_reappears() {
        let closed = CancellationToken::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result = request_with_retry(&fast_config(3), &closed, "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(IamError::StreamNotFound)
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.expect("should succeed"), "done");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausts_exactly_max_attempts_with_waits_between() {
        let closed = CancellationToken::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let started = Instant::now();

        let result: Result<(), _> = request_with_retry(&fast_config(3), &closed, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(IamError::StreamNotFound)
            }
        })
        .await;

        assert!(matches!(result, Err(IamError::StreamNotFound)));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        // two waits between three attempts, none after the last
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn business_errors_are_not_retried() {
        let closed = CancellationToken::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), _> = request_with_retry(&fast_config(3), &closed, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(IamError::Service(ServiceError::WrongState("paused".into())))
            }
        })
        .await;

        assert!(matches!(result, Err(IamError::Service(_))));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeouts_are_not_retried() {
        let closed = CancellationToken::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), _> = request_with_retry(&fast_config(3), &closed, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(IamError::Timeout(Duration::from_millis(1)))
            }
        })
        .await;

        assert!(matches!(result, Err(IamError::Timeout(_))));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_stream_is_not_retried() {
        let closed = CancellationToken::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), _> = request_with_retry(&fast_config(3), &closed, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(IamError::StreamClosed)
            }
        })
        .await;

        assert!(matches!(result, Err(IamError::StreamClosed)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_interrupts_wait() {
        let closed = CancellationToken::new();
        let config = RetryConfig::new(3, Duration::from_secs(30));
        let started = Instant::now();

        let closer = closed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            closer.cancel();
        });

        let result: Result<(), _> = request_with_retry(&config, &closed, "op", || async {
            Err(IamError::StreamNotFound)
        })
        .await;

        assert!(matches!(result, Err(IamError::HandlerClosed)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn closed_before_first_attempt() {
        let closed = CancellationToken::new();
        closed.cancel();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), _> = request_with_retry(&fast_config(3), &closed, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert!(matches!(result, Err(IamError::HandlerClosed)));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
