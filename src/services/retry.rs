//! Bounded exponential backoff for infrastructure calls.
//!
//! Only errors that report themselves as transient are retried: a version
//! conflict or a missing record is an answer, not an outage.

use std::future::Future;
use std::time::Duration;

use crate::db::store::StoreError;
use crate::services::credits::CreditError;
use crate::services::queue::QueueError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// `base * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

impl Retryable for QueueError {
    fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Redis(_))
    }
}

impl Retryable for CreditError {
    fn is_retryable(&self) -> bool {
        matches!(self, CreditError::Database(_))
    }
}

/// Run `op` until it succeeds, fails permanently, or retries run out.
pub async fn with_retry<T, E, F, Fut>(config: &RetryConfig, operation: &str, mut op: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                let delay = config.delay_for(attempt);
                tracing::warn!(
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use uuid::Uuid;

    use super::*;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(400));
        assert_eq!(config.delay_for(20), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_exhausted() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), StoreError> = with_retry(&fast(), "update_job", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_return_at_once() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), StoreError> = with_retry(&fast(), "update_job", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::NotFound(Uuid::nil()))
        })
        .await;

        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, StoreError> = with_retry(&fast(), "get_job", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StoreError::Database(sqlx::Error::PoolTimedOut))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }
}
