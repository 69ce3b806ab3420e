use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryConfig;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// Every attempt failed or timed out; `last` is the final failure.
    #[error("{op} failed after {attempts} attempts: {last}")]
    Exhausted {
        op: String,
        attempts: u32,
        last: String,
    },
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Bounded retry with a per-attempt timeout and a fixed backoff.
///
/// Activity handlers are invoked through this policy, so they must be
/// idempotent: an attempt that times out may still have taken effect.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub attempt_timeout: Duration,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            attempt_timeout: Duration::from_secs(600),
            backoff: Duration::from_millis(500),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            attempts: cfg.attempts,
            attempt_timeout: Duration::from_secs(cfg.attempt_timeout_secs),
            backoff: Duration::from_millis(cfg.backoff_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// retry
// ---------------------------------------------------------------------------

/// Run `f` until it succeeds or the policy's attempt budget is spent.
pub async fn retry<F, Fut, T, E>(policy: &RetryPolicy, op: &str, mut f: F) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut last = String::new();
    for attempt in 1..=policy.attempts {
        match tokio::time::timeout(policy.attempt_timeout, f()).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    debug!(op, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(e)) => {
                last = e.to_string();
                warn!(op, attempt, error = %last, "attempt failed");
            }
            Err(_elapsed) => {
                last = format!("timed out after {:?}", policy.attempt_timeout);
                warn!(op, attempt, "attempt timed out");
            }
        }
        if attempt < policy.attempts {
            tokio::time::sleep(policy.backoff).await;
        }
    }

    Err(RetryError::Exhausted {
        op: op.to_string(),
        attempts: policy.attempts,
        last,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            attempt_timeout: Duration::from_millis(50),
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn first_attempt_success() {
        let calls = AtomicU32::new(0);
        let result = retry(&quick_policy(), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry(&quick_policy(), "op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_reports_last_error() {
        let result: Result<(), _> = retry(&quick_policy(), "flaky", || async {
            Err::<(), _>("boom".to_string())
        })
        .await;

        match result {
            Err(RetryError::Exhausted { op, attempts, last }) => {
                assert_eq!(op, "flaky");
                assert_eq!(attempts, 3);
                assert_eq!(last, "boom");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out() {
        let result: Result<(), _> = retry(&quick_policy(), "slow", || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<(), String>(())
        })
        .await;

        match result {
            Err(RetryError::Exhausted { last, .. }) => assert!(last.contains("timed out")),
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }
}
