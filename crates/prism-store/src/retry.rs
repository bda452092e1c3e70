//! Bounded retry for optimistic transactions.

use std::future::Future;
use std::time::Duration;

use crate::{Result, StoreError};

/// Retry policy for read-check-write loops: how many attempts before the
/// conflict is surfaced, and how long to back off between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_micros(200),
        }
    }
}

/// Run `op` until it succeeds or the policy is exhausted. Only
/// [`StoreError::Conflict`] is retried; every other error propagates
/// immediately.
pub async fn attempt<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 1..=policy.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_conflict() && attempt < policy.max_attempts => {
                tracing::debug!(attempt, "optimistic transaction conflicted, retrying");
                tokio::time::sleep(policy.backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
    Err(StoreError::Conflict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            backoff: Duration::from_micros(1),
        }
    }

    #[tokio::test]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = attempt(policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(7) }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_conflicts_until_success() {
        let calls = AtomicU32::new(0);
        let result = attempt(policy(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(StoreError::Conflict)
                } else {
                    Ok("done")
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = attempt(policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Conflict) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Conflict)));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn non_conflict_errors_propagate_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = attempt(policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(serde_json::from_str::<serde_json::Value>("{")
                    .map_err(StoreError::from)
                    .unwrap_err())
            }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Payload(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
