//! Bounded retry with per-attempt timeout and exponential backoff for
//! storage calls.

use std::future::Future;
use std::time::Duration;

use skillgate_state::{StorageError, StorageResult};

use crate::domain::{Result, SkillError};
use crate::metrics::METRICS;
use crate::obs;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Wall-clock limit for one attempt; `None` waits indefinitely.
    pub attempt_timeout: Option<Duration>,
    /// Retries after the first attempt (0 = run once).
    pub max_retries: u32,
    /// Delay before retry `n` is `backoff_base * 2^(n-1)`.
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Some(Duration::from_secs(2)),
            max_retries: 3,
            backoff_base: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Same retries without the per-attempt timeout. For non-idempotent
    /// writes, where abandoning an attempt that later lands would duplicate it.
    pub fn without_timeout(&self) -> Self {
        Self {
            attempt_timeout: None,
            ..self.clone()
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Transient storage errors and timeouts are retried; exhausting the
    /// budget yields `RegistryUnavailable`. Permanent errors return at once.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let max_attempts = self.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let outcome = match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(result) => result,
                    Err(_elapsed) => Err(StorageError::Unavailable(format!(
                        "{operation} timed out after {}ms",
                        limit.as_millis()
                    ))),
                },
                None => op().await,
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        METRICS.inc_registry_retries();
                        obs::emit_registry_retry(operation, attempt, &last_error);
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(SkillError::RegistryUnavailable {
            attempts: max_attempts,
            last_error,
        })
    }
}
