//! Retry-on-contention for ledger writes.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::LedgerError;
use crate::telemetry;

/// Computes the delay before retry `attempt` (1-based) using exponential backoff.
///
/// Formula: delay = min(base_delay * 2^(attempt-1), max_backoff)
pub fn compute_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exp = attempt.saturating_sub(1).min(31) as i32;
    let scaled = (config.base_delay_ms as f64) * 2f64.powi(exp);
    let capped = scaled.min(config.max_backoff_ms as f64).max(0.0);

    Duration::from_millis(capped as u64)
}

/// Adds up to `jitter_ratio` of random extra delay.
fn with_jitter(delay: Duration, jitter_ratio: f32) -> Duration {
    if jitter_ratio <= 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(0.0..=jitter_ratio as f64);
    delay + delay.mul_f64(factor)
}

/// Runs an operation, retrying while it fails with retryable contention.
#[derive(Clone, Debug, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// exhausts `max_attempts`. The last error is returned unchanged.
    pub async fn run<T, F, Fut>(&self, op_name: &'static str, mut op: F) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(op = op_name, attempt, "write succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = with_jitter(
                        compute_backoff(attempt, &self.config),
                        self.config.jitter_ratio,
                    );
                    telemetry::record_write_retry(op_name, attempt, delay, &err);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        tracing::error!(
                            op = op_name,
                            attempts = attempt,
                            error = %err,
                            "write retries exhausted"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::tests::db_error;
    use crate::dialect::Dialect;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1,
            max_backoff_ms: 4,
            jitter_ratio: 0.0,
        }
    }

    #[test]
    fn test_compute_backoff_exponential() {
        let config = RetryConfig {
            base_delay_ms: 100,
            max_backoff_ms: 10_000,
            ..Default::default()
        };

        assert_eq!(compute_backoff(0, &config), Duration::ZERO);
        assert_eq!(compute_backoff(1, &config), Duration::from_millis(100));
        assert_eq!(compute_backoff(2, &config), Duration::from_millis(200));
        assert_eq!(compute_backoff(3, &config), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_capped() {
        let config = RetryConfig {
            base_delay_ms: 1000,
            max_backoff_ms: 5000,
            ..Default::default()
        };

        assert_eq!(compute_backoff(10, &config), Duration::from_millis(5000));
        assert_eq!(compute_backoff(u32::MAX, &config), Duration::from_millis(5000));
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let base = Duration::from_millis(100);
        for _ in 0..100 {
            let jittered = with_jitter(base, 0.5);
            assert!(jittered >= base);
            assert!(jittered <= Duration::from_millis(150));
        }
        assert_eq!(with_jitter(base, 0.0), base);
    }

    #[tokio::test]
    async fn test_retries_classified_contention_then_succeeds() {
        let policy = RetryPolicy::new(fast_config(5));
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result = policy
            .run("test", || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(Dialect::Postgres.classify(db_error("40001", "could not serialize access")))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_last_error() {
        let policy = RetryPolicy::new(fast_config(3));
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<(), _> = policy
            .run("test", || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(LedgerError::Contention(format!("locked #{n}")))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(LedgerError::Contention(message)) => assert_eq!(message, "locked #2"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let policy = RetryPolicy::new(fast_config(5));
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<(), _> = policy
            .run("test", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Dialect::Sqlite.classify(db_error("1", "no such table: ledger_jobs")))
            })
            .await;

        assert!(matches!(result, Err(LedgerError::Database(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
