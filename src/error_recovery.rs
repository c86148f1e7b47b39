//! Automatic error recovery strategies.
//
// Reconnect attempts against flaky transports go through a configurable retry
// policy. Each failed attempt is logged; the last error is returned once the
// policy is exhausted.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay between attempts.
    #[serde(with = "millis")]
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_delay: Duration::ZERO,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Runs `operation` until it succeeds or the policy is exhausted.
///
/// Returns the error of the final attempt.
pub async fn retry_async<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                warn!(
                    operation = label,
                    attempt,
                    max_attempts = attempts,
                    error = %err,
                    "Attempt failed, retrying"
                );
                sleep(policy.backoff_delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_logic_succeeds() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(10),
        };
        let result: Result<(), String> = retry_async(&policy, "connect", move || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) + 1 >= 2 {
                Ok(())
            } else {
                Err("Failed to recover".to_string())
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_logic_fails() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(10),
        };
        let result: Result<(), String> = retry_async(&policy, "connect", move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err("still down".to_string())
        })
        .await;
        assert_eq!(result.unwrap_err(), "still down");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let policy = RetryPolicy {
            max_attempts: 0,
            backoff_delay: Duration::ZERO,
        };
        let _: Result<(), String> =
            tokio_test::block_on(retry_async(&policy, "connect", move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("down".to_string())
            }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
