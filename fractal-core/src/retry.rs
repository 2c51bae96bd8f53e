//! Bounded retry shared by operation runs, task pushes and task handling.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{ReplicationError, Result};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; grows linearly after that.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// Runs `f` until it succeeds, fails with a terminal error, or the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, what: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    return Err(ReplicationError::RetriesExhausted {
                        attempts: attempt,
                        last: e.to_string(),
                    })
                }
                Err(e) => {
                    warn!(what, attempt, error = %e, "Attempt failed, retrying");
                    if !self.backoff.is_zero() {
                        tokio::time::sleep(self.backoff * attempt).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::immediate(3)
            .run("flaky", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ReplicationError::from(TransportError::Request("503".into())))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_is_terminal() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = RetryPolicy::immediate(3)
            .run("down", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ReplicationError::from(TransportError::Request("503".into())))
            })
            .await;

        assert!(matches!(
            result,
            Err(ReplicationError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_configuration_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = RetryPolicy::immediate(3)
            .run("bad link", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ReplicationError::config("parent == child"))
            })
            .await;

        assert!(matches!(result, Err(ReplicationError::Configuration(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
