// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Bounded retry with configurable backoff for step execution.

use agentflow_core::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// delay = initial * attempt.
    #[default]
    Linear,

    /// delay = initial.
    Constant,
}

/// Retry policy for one operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt (2 retries = up to 3 attempts).
    pub max_retries: u32,

    /// Base delay between attempts.
    pub initial_delay: Duration,

    /// Backoff strategy.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(2),
            backoff: Backoff::Linear,
        }
    }
}

impl RetryPolicy {
    /// A linear policy with the given bound and base delay.
    pub fn linear(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            backoff: Backoff::Linear,
        }
    }

    /// Delay before the given retry (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Linear => self.initial_delay * retry,
            Backoff::Constant => self.initial_delay,
        }
    }
}

/// Runs an operation under a retry policy. Only transient errors are
/// retried; permanent errors surface immediately.
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor for a policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Execute with retry.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry: u32 = 0;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && retry < self.policy.max_retries => {
                    retry += 1;
                    let delay = self.policy.delay_for(retry);
                    warn!(
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient step failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::error::EngineError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> EngineError {
        EngineError::Tool {
            tool: "job_search".to_string(),
            message: "connection reset".to_string(),
            retriable: true,
        }
    }

    fn permanent() -> EngineError {
        EngineError::Tool {
            tool: "job_search".to_string(),
            message: "bad parameter".to_string(),
            retriable: false,
        }
    }

    #[test]
    fn test_linear_delays_grow() {
        let policy = RetryPolicy::linear(3, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_to_success() {
        let attempts = AtomicU32::new(0);
        let executor = RetryExecutor::new(RetryPolicy::linear(2, Duration::from_millis(1)));

        let result = executor
            .execute(|| async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let attempts = AtomicU32::new(0);
        let executor = RetryExecutor::new(RetryPolicy::linear(2, Duration::from_millis(1)));

        let result: Result<u32> = executor
            .execute(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(permanent())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_bound_is_exhausted() {
        let attempts = AtomicU32::new(0);
        let executor = RetryExecutor::new(RetryPolicy::linear(2, Duration::from_millis(1)));

        let result: Result<u32> = executor
            .execute(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
