//! Call-site retry with exponential backoff for transient client errors.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ClientError;
use crate::ClientResult;

/// Upper bound accepted for [`RetryPolicy::max_retries`].
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Longest single backoff delay.
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Retry policy for a single client call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = run once).
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries (milliseconds).
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_base_ms: 0,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor)).min(MAX_DELAY)
    }
}

/// Run `op` until it succeeds, fails fatally, or retries are exhausted.
///
/// Only errors for which [`ClientError::is_transient`] holds are retried.
/// The last error is returned unchanged.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, op: &str, mut f: F) -> ClientResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ClientResult<T>>,
{
    let max_attempts = policy.max_retries + 1;
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.delay(attempt);
                warn!(
                    op = %op,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Collapse "not found" into success for idempotent deletions.
pub fn ignore_not_found(result: ClientResult<()>) -> ClientResult<()> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_is_retried_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 3,
            backoff_base_ms: 10,
        };

        let result = with_backoff(&policy, "flaky", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(ClientError::Transport("reset".into()))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: ClientResult<()> = with_backoff(&RetryPolicy::default(), "fatal", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ClientError::Api {
                status: 401,
                method: "GET".into(),
                url: "/x".into(),
                body: "unauthorized".into(),
            })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_returns_last_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 2,
            backoff_base_ms: 1,
        };
        let result: ClientResult<()> = with_backoff(&policy, "down", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ClientError::Transport("refused".into()))
        })
        .await;

        assert!(matches!(result, Err(ClientError::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_delay_doubles_and_saturates() {
        let policy = RetryPolicy {
            max_retries: 70,
            backoff_base_ms: 500,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(3), Duration::from_millis(2000));
        assert_eq!(policy.delay(65), MAX_DELAY);
        assert_eq!(policy.delay(u32::MAX), MAX_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_many_retries_do_not_overflow() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 70,
            backoff_base_ms: 1,
        };
        let result: ClientResult<()> = with_backoff(&policy, "down", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ClientError::Transport("refused".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 71);
    }

    #[test]
    fn test_ignore_not_found() {
        assert!(ignore_not_found(Err(ClientError::NotFound {
            resource: "branch".into()
        }))
        .is_ok());
        assert!(ignore_not_found(Err(ClientError::Transport("x".into()))).is_err());
    }
}
