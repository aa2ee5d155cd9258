//! Bounded exponential backoff for transient failures.
//!
//! A failure is retried only when [`Error::is_transient`] says so. Each
//! attempt can be given a deadline; an expired deadline becomes the
//! timeout flavor of the caller's error kind.

use std::future::Future;
use std::time::Duration;

use docrag_core::{Error, ErrorKind, Result};

/// Retry budget and backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based): base, 2×base, 4×base, …
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails non-transiently, or the budget is spent.
///
/// `attempt_timeout` bounds each attempt; on expiry the attempt fails with
/// `Error::timeout(kind, what, ..)` and is retried like any transient error
/// of that kind.
pub async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    kind: ErrorKind,
    what: &str,
    attempt_timeout: Option<Duration>,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        if attempt > 0 {
            tokio::time::sleep(policy.delay(attempt)).await;
        }

        let result = match attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(r) => r,
                Err(_) => Err(Error::timeout(kind, what, limit.as_secs())),
            },
            None => op().await,
        };

        match result {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                tracing::warn!(
                    operation = what,
                    attempt,
                    max_retries = policy.max_retries,
                    error = %e,
                    "transient failure, retrying"
                );
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_delay_curve_is_capped() {
        let p = policy(10);
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(4), Duration::from_millis(800));
        assert_eq!(p.delay(5), Duration::from_secs(1));
        assert_eq!(p.delay(40), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let out = retry(policy(3), ErrorKind::EmbeddingError, "embed", None, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::embedding_transient("503"))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let err = retry(policy(2), ErrorKind::EmbeddingError, "embed", None, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::embedding_transient("503"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Embedding { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let _ = retry(policy(5), ErrorKind::EmbeddingError, "embed", None, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::embedding_fatal("bad request"))
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_transient_for_storage() {
        let calls = AtomicU32::new(0);
        let err = retry(
            policy(1),
            ErrorKind::StorageError,
            "store",
            Some(Duration::from_secs(2)),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Storage { transient: true, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
