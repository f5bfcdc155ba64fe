//! Bounded retry around source adapter calls.

use crate::config::SyncConfig;
use crate::error::AdapterError;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Lifecycle of one adapter invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptState {
    /// Not started.
    Pending,
    /// In flight.
    Running,
    /// Finished successfully.
    Success,
    /// Gave up.
    Failed,
}

/// Final record of a retried operation.
#[derive(Debug, Clone)]
pub struct Attempt<T> {
    /// Final state.
    pub state: AttemptState,
    /// Number of tries made.
    pub attempts: u32,
    /// Output of the successful try.
    pub value: Option<T>,
    /// Last error, if the operation did not succeed.
    pub error: Option<String>,
}

impl<T> Attempt<T> {
    fn pending() -> Self {
        Self {
            state: AttemptState::Pending,
            attempts: 0,
            value: None,
            error: None,
        }
    }

    /// The last try succeeded.
    pub fn succeeded(&self) -> bool {
        self.state == AttemptState::Success
    }
}

/// How often and how long an adapter call may be tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Tries, at least 1.
    pub max_attempts: u32,
    /// Delay before the second try; grows linearly with each further try.
    pub backoff: Duration,
    /// Budget for each individual try.
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Policy from the `retry` section and adapter timeout.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.retry.max_attempts.max(1),
            backoff: Duration::from_millis(config.retry.backoff_ms),
            timeout: config.adapter_timeout(),
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are exhausted. A try that exceeds the timeout counts as a
    /// retryable failure. Never returns an error: the outcome is data.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Attempt<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        let mut attempt = Attempt::pending();
        let max = self.max_attempts.max(1);

        for n in 1..=max {
            attempt.state = AttemptState::Running;
            attempt.attempts = n;

            let err = match tokio::time::timeout(self.timeout, op()).await {
                Ok(Ok(value)) => {
                    debug!(label, attempt = n, "attempt succeeded");
                    attempt.state = AttemptState::Success;
                    attempt.value = Some(value);
                    attempt.error = None;
                    return attempt;
                }
                Ok(Err(e)) => e,
                Err(_) => AdapterError::Timeout {
                    secs: self.timeout.as_secs(),
                },
            };

            let again = err.is_retryable() && n < max;
            warn!(label, attempt = n, max, error = %err, retrying = again, "attempt failed");
            attempt.error = Some(err.to_string());
            if !again {
                break;
            }
            tokio::time::sleep(self.backoff * n).await;
        }

        attempt.state = AttemptState::Failed;
        attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(100),
            timeout: Duration::from_secs(10),
        }
    }

    fn unavailable() -> AdapterError {
        AdapterError::SourceUnavailable {
            source_name: "hdd".into(),
            msg: "offline".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let attempt = policy(3)
            .run("hdd/StudyA/s1", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(unavailable())
                } else {
                    Ok(7)
                }
            })
            .await;

        assert!(attempt.succeeded());
        assert_eq!(attempt.attempts, 3);
        assert_eq!(attempt.value, Some(7));
        assert!(attempt.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempts() {
        let attempt: Attempt<()> = policy(2).run("x", || async { Err(unavailable()) }).await;
        assert_eq!(attempt.state, AttemptState::Failed);
        assert_eq!(attempt.attempts, 2);
        assert!(attempt.error.unwrap().contains("offline"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let attempt: Attempt<()> = policy(5)
            .run("x", || async {
                Err(AdapterError::NotConfigured {
                    source_name: "hdd".into(),
                    msg: "no base".into(),
                })
            })
            .await;
        assert_eq!(attempt.state, AttemptState::Failed);
        assert_eq!(attempt.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_failed_outcome() {
        let p = RetryPolicy {
            max_attempts: 1,
            backoff: Duration::ZERO,
            timeout: Duration::from_secs(1),
        };
        let attempt: Attempt<()> = p
            .run("slow", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert_eq!(attempt.state, AttemptState::Failed);
        assert!(attempt.error.unwrap().contains("timed out"));
    }

    #[test]
    fn test_from_config() {
        let config = SyncConfig::default();
        let p = RetryPolicy::from_config(&config);
        assert_eq!(p.max_attempts, 1);
        assert_eq!(p.backoff, Duration::from_millis(1000));
        assert_eq!(p.timeout, Duration::from_secs(3600));
    }
}
