//! Retry with backoff for transient storage failures.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pod_evolution_kernel::store::RetryPolicy;
//!
//! let policy = RetryPolicy::exponential(3, Duration::from_millis(100));
//!
//! let result = policy.retry(|| async {
//!     store.insert_event(&event).await
//! }).await?;
//! ```

use std::time::Duration;

use tracing::{debug, warn};

/// Retry policy configuration
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first; at least 1.
    pub max_attempts: usize,
    /// Delay schedule between attempts.
    pub strategy: RetryStrategy,
}

/// Retry backoff strategy
#[derive(Clone, Debug, PartialEq)]
pub enum RetryStrategy {
    /// Fixed delay between retries
    Fixed {
        /// Delay after every failed attempt.
        delay: Duration,
    },
    /// Exponential backoff (delay doubles each time)
    Exponential {
        /// Delay after the first failure.
        initial_delay: Duration,
        /// Upper bound on any single delay.
        max_delay: Duration,
        /// Growth factor per attempt.
        multiplier: f64,
    },
}

impl Default for RetryPolicy {
    /// Three attempts, 100 ms initial delay, doubling.
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(100))
    }
}

impl RetryPolicy {
    /// Create policy with fixed delay
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            strategy: RetryStrategy::Fixed { delay },
        }
    }

    /// Create policy with exponential backoff
    pub fn exponential(max_attempts: usize, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            strategy: RetryStrategy::Exponential {
                initial_delay,
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
            },
        }
    }

    /// Execute operation with retries.
    ///
    /// Runs `f` up to `max_attempts` times (at least once), sleeping
    /// between failures. Returns the first success or the last error.
    ///
    /// # Errors
    ///
    /// The error from the final attempt when every attempt failed.
    pub async fn retry<F, Fut, T, E>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            debug!(attempt = attempt, max = max_attempts, "retry: attempting operation");

            match f().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(attempt = attempt, "retry: operation succeeded after retries");
                    }
                    return Ok(result);
                }
                Err(e) => {
                    warn!(
                        attempt = attempt,
                        max = max_attempts,
                        error = %e,
                        "retry: operation failed"
                    );

                    if attempt >= max_attempts {
                        warn!(attempts = attempt, "retry: all attempts exhausted");
                        return Err(e);
                    }

                    let delay = self.calculate_delay(attempt);
                    debug!(delay_ms = delay.as_millis() as u64, "retry: waiting before next attempt");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        match &self.strategy {
            RetryStrategy::Fixed { delay } => *delay,
            RetryStrategy::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
                let millis = initial_delay.as_millis() as f64 * multiplier.powi(exponent);
                let delay = if millis.is_finite() && millis >= 0.0 {
                    Duration::from_millis(millis as u64)
                } else {
                    *max_delay
                };
                delay.min(*max_delay)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_eventually() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let policy = RetryPolicy::fixed(5, Duration::from_millis(10));

        let result = policy
            .retry(|| {
                let attempts = attempts_clone.clone();
                async move {
                    let count = attempts.fetch_add(1, Ordering::SeqCst);
                    if count < 2 {
                        Err("failing")
                    } else {
                        Ok("success")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_attempts_and_returns_last_error() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::exponential(3, Duration::from_millis(100));

        let result = policy
            .retry(|| {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(format!("failure {n}"))
                }
            })
            .await;

        assert_eq!(result.unwrap_err(), "failure 2");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_still_runs_once() {
        let policy = RetryPolicy::fixed(0, Duration::from_millis(10));
        let result = policy.retry(|| async { Ok::<_, String>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::exponential(4, Duration::from_millis(10));

        assert_eq!(policy.calculate_delay(1), Duration::from_millis(10));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(20));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(40));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy::exponential(64, Duration::from_secs(1));
        assert_eq!(policy.calculate_delay(60), Duration::from_secs(30));
    }

    #[test]
    fn test_default_policy_matches_storage_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
    }
}
