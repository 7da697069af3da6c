//! Bounded retries for optimistic-concurrency conflicts
//!
//! Read-merge-write sequences against the API server fail with 409 Conflict
//! when another writer got there first. The operation closure re-reads on
//! every attempt, so retrying it is safe.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{KubeError, Result};

/// Retry policy for conflicting writes
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Default delays with a custom attempt budget
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }

    /// No delay between attempts
    pub fn immediate(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Run `operation`, retrying while it fails with a conflict
///
/// Any other error is returned immediately. After `max_attempts` conflicts the
/// last conflict is returned.
pub async fn retry_on_conflict<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let mut delay = policy.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = %operation_name, attempt, "Succeeded after conflict");
                }
                return Ok(value);
            }
            Err(e) if e.is_conflict() && attempt < policy.max_attempts => {
                // 0.5x to 1.5x jitter
                let jittered = if delay.is_zero() {
                    Duration::ZERO
                } else {
                    let jitter = rand::rng().random_range(0.5..1.5);
                    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
                };

                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered.as_millis() as u64,
                    "Conflict, retrying with a fresh read"
                );

                tokio::time::sleep(jittered).await;
                delay = policy.next_delay(delay);
            }
            Err(e) => {
                if e.is_conflict() {
                    warn!(
                        operation = %operation_name,
                        attempt,
                        "Giving up after repeated conflicts"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Convenience conflict constructor
pub(crate) fn conflict(resource: impl Into<String>, message: impl Into<String>) -> KubeError {
    KubeError::Conflict {
        resource: resource.into(),
        message: message.into(),
    }
}
