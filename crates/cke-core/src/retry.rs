use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

/// Retry a fallible async operation with exponential backoff.
///
/// Only use this for idempotent reads; commanders with side effects are
/// never retried.
///
/// - `max_attempts`: Total attempts (including the first).
/// - `base_delay`: Delay after first failure, doubled on each subsequent failure.
/// - `label`: Description for log messages.
/// - `f`: Produces a fresh future for every attempt.
pub async fn retry<F, Fut, T>(
    max_attempts: u32,
    base_delay: Duration,
    label: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = base_delay;
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if attempt < max_attempts.max(1) => {
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "{} failed, retrying",
                    label,
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result = retry(3, Duration::from_millis(1), "test", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let count = AtomicU32::new(0);
        let result = retry(3, Duration::from_millis(1), "test", || {
            let c = count.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if c < 3 {
                    anyhow::bail!("not yet");
                }
                Ok(c)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_all_attempts() {
        let count = AtomicU32::new(0);
        let result: Result<i32> = retry(3, Duration::from_millis(1), "test", || {
            count.fetch_add(1, Ordering::SeqCst);
            async { anyhow::bail!("always fails") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_zero_attempts_runs_once() {
        let count = AtomicU32::new(0);
        let result: Result<i32> = retry(0, Duration::from_millis(1), "test", || {
            count.fetch_add(1, Ordering::SeqCst);
            async { anyhow::bail!("fail") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
