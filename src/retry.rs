use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Number of spellchecker readiness checks before giving up.
pub const SPELLCHECKER_ATTEMPTS: u32 = 10;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one)
    pub max_attempts: u32,
    /// Delay before every retry
    pub delay: Duration,
}

impl RetryConfig {
    /// Create a new retry configuration with a fixed delay
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Preset: spellchecker readiness (10 attempts, fixed `delay` between them)
    pub fn spellchecker_ready(delay: Duration) -> Self {
        Self::new(SPELLCHECKER_ATTEMPTS, delay)
    }

    /// Continue a budget of which `attempts_used` attempts are already spent.
    ///
    /// At least one attempt always remains, and it runs without delay, so a
    /// caller passing a count beyond the budget gets a single immediate check.
    pub fn resume_from(mut self, attempts_used: u32) -> Self {
        self.max_attempts = self.max_attempts.saturating_sub(attempts_used).max(1);
        self
    }

    /// Calculate the delay for a given attempt number (0-indexed)
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            self.delay
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::spellchecker_ready(Duration::from_secs(1))
    }
}

/// Why [`with_retry`] gave up.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The token was cancelled before or between attempts.
    Cancelled,
    /// Every attempt failed.
    Exhausted { attempts: u32, last_error: E },
}

/// Execute an async operation with retries, stopping early when `cancel` fires
///
/// # Arguments
/// * `config` - Retry configuration (max_attempts must be >= 1)
/// * `operation_name` - Name of the operation for logging
/// * `cancel` - Checked before every attempt and raced against every delay
/// * `operation` - Async closure that returns Result<T, E>
///
/// # Returns
/// The result of the first successful attempt, or why none succeeded
///
/// # Panics
/// Panics if `config.max_attempts` is 0
pub async fn with_retry<T, E, F, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    assert!(
        config.max_attempts >= 1,
        "RetryConfig.max_attempts must be >= 1, got {}",
        config.max_attempts
    );

    let mut last_error: Option<E> = None;

    for attempt in 0..config.max_attempts {
        // Wait before retry (except for first attempt)
        let delay = config.delay_for_attempt(attempt);
        if !delay.is_zero() {
            debug!(
                "{}: Retry attempt {}/{} after {:?}",
                operation_name,
                attempt + 1,
                config.max_attempts,
                delay
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancel.cancelled() => {
                    debug!("{}: Cancelled while waiting to retry", operation_name);
                    return Err(RetryError::Cancelled);
                }
            }
        }

        if cancel.is_cancelled() {
            debug!("{}: Cancelled before attempt {}", operation_name, attempt + 1);
            return Err(RetryError::Cancelled);
        }

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        "{}: Succeeded on attempt {}/{}",
                        operation_name,
                        attempt + 1,
                        config.max_attempts
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                let remaining = config.max_attempts - attempt - 1;
                if remaining > 0 {
                    debug!(
                        "{}: Attempt {}/{} failed ({}), {} retries remaining",
                        operation_name,
                        attempt + 1,
                        config.max_attempts,
                        e,
                        remaining
                    );
                } else {
                    warn!(
                        "{}: All {} attempts failed. Last error: {}",
                        operation_name, config.max_attempts, e
                    );
                }
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(last_error) => Err(RetryError::Exhausted {
            attempts: config.max_attempts,
            last_error,
        }),
        None => unreachable!("at least one attempt is always made"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_retry_config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.delay, Duration::from_secs(1));
    }

    #[test]
    fn test_spellchecker_delay_is_fixed() {
        let config = RetryConfig::spellchecker_ready(Duration::from_secs(1));

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(9), Duration::from_secs(1));
    }

    #[test]
    fn test_resume_from() {
        let base = RetryConfig::spellchecker_ready(Duration::from_secs(1));
        assert_eq!(base.clone().resume_from(0).max_attempts, 10);
        assert_eq!(base.clone().resume_from(3).max_attempts, 7);
        assert_eq!(base.clone().resume_from(10).max_attempts, 1);
        assert_eq!(base.resume_from(100).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_first_attempt() {
        let config = RetryConfig::new(3, Duration::from_millis(10));
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<u32, RetryError<&str>> =
            with_retry(&config, "test", &CancellationToken::new(), || {
                let c = counter_clone.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_after_failures() {
        let config = RetryConfig::new(3, Duration::from_millis(10));
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<u32, RetryError<&str>> =
            with_retry(&config, "test", &CancellationToken::new(), || {
                let c = counter_clone.clone();
                async move {
                    let attempt = c.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err("temporary failure")
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_all_attempts_fail() {
        let config = RetryConfig::new(3, Duration::from_millis(5));
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<u32, RetryError<String>> =
            with_retry(&config, "test", &CancellationToken::new(), || {
                let c = counter_clone.clone();
                async move {
                    let attempt = c.fetch_add(1, Ordering::SeqCst);
                    Err(format!("error on attempt {}", attempt + 1))
                }
            })
            .await;

        assert_eq!(
            result.unwrap_err(),
            RetryError::Exhausted {
                attempts: 3,
                last_error: "error on attempt 3".to_string()
            }
        );
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let config = RetryConfig::new(3, Duration::from_millis(5));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<(), RetryError<&str>> = with_retry(&config, "test", &cancel, || {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(result.unwrap_err(), RetryError::Cancelled);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_delay() {
        let config = RetryConfig::new(5, Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let start = std::time::Instant::now();
        let result: Result<(), RetryError<&str>> =
            with_retry(&config, "test", &cancel, || async { Err("not ready") }).await;

        assert_eq!(result.unwrap_err(), RetryError::Cancelled);
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "Expected cancellation to cut the delay short, took {:?}",
            start.elapsed()
        );
    }

    // ==================== Timing Verification Tests ====================

    #[tokio::test]
    async fn test_fixed_delay_timing() {
        let config = RetryConfig::new(3, Duration::from_millis(50));

        let start = std::time::Instant::now();

        let _result: Result<(), RetryError<&str>> =
            with_retry(&config, "timing_test", &CancellationToken::new(), || async {
                Err("always fails")
            })
            .await;

        let elapsed = start.elapsed();

        // Should have waited: 0ms + 50ms + 50ms = 100ms minimum
        assert!(
            elapsed >= Duration::from_millis(90),
            "Expected at least 90ms delay, got {:?}",
            elapsed
        );
        assert!(
            elapsed < Duration::from_millis(500),
            "Expected less than 500ms total, got {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn test_single_attempt_has_no_delay() {
        let config = RetryConfig::spellchecker_ready(Duration::from_secs(10)).resume_from(100);

        let start = std::time::Instant::now();
        let result: Result<(), RetryError<&str>> =
            with_retry(&config, "override", &CancellationToken::new(), || async {
                Err("not ready")
            })
            .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
