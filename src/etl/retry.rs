//! Retry policy for content-store and pin-state calls
//!
//! Bounded exponential backoff. Exhaustion returns the last error to the caller, which decides
//! whether it is fatal (it never is for a single hash: the next cycle recomputes everything).

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries, just try once)
    pub max_retries: u32,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Upper bound for a single backoff
    pub max_backoff: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential backoff)
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    /// Creates a policy with no retries (fail immediately).
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Total number of calls the policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs)
    }

    /// Executes `operation` until it succeeds or the attempt ceiling is reached.
    ///
    /// `label` names the operation in logs (e.g. `"pin 0xab..."`).
    pub async fn execute<F, Fut, T>(&self, label: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;

        loop {
            match operation().await {
                Ok(result) => {
                    if retries > 0 {
                        tracing::info!(
                            target: "torii_pin::etl::retry",
                            operation = label,
                            "Operation succeeded after {} attempt(s)",
                            retries + 1
                        );
                    }
                    return Ok(result);
                }
                Err(err) => {
                    retries += 1;

                    if retries > self.max_retries {
                        tracing::warn!(
                            target: "torii_pin::etl::retry",
                            operation = label,
                            "Giving up after {} attempt(s): {:#}",
                            retries,
                            err
                        );
                        return Err(err);
                    }

                    let backoff = self.backoff_for(retries);
                    tracing::debug!(
                        target: "torii_pin::etl::retry",
                        operation = label,
                        "Attempt {}/{} failed: {:#}. Retrying in {:?}",
                        retries,
                        self.max_attempts(),
                        err,
                        backoff
                    );

                    sleep(backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(350), 2.0);
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(350));
        assert_eq!(policy.backoff_for(9), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_after_failures() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50), 2.0);
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = policy
            .execute("flaky", || {
                let c = counter_clone.clone();
                async move {
                    let count = c.fetch_add(1, Ordering::SeqCst);
                    if count < 2 {
                        anyhow::bail!("Simulated failure");
                    }
                    Ok::<_, anyhow::Error>(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted() {
        let policy = RetryPolicy::new(2, Duration::from_millis(5), Duration::from_millis(20), 2.0);
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<()> = policy
            .execute("broken", || {
                let c = counter_clone.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("Always fails")
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), policy.max_attempts());
    }

    #[tokio::test]
    async fn test_no_retry_policy() {
        let policy = RetryPolicy::no_retry();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<()> = policy
            .execute("once", || {
                let c = counter_clone.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("Fails immediately")
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
