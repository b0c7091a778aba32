//! Retry policy: re-run a task's process invocation up to `RetryCount + 1`
//! times with fixed or exponential backoff (spec.md §4.4 step 5, §8).
//!
//! A `TaskResult` triggers retry iff `IsFailed ∧ ¬WasSkipped`; cancellation is
//! never retried. The policy itself is a thin wrapper around any async
//! operation that produces a `TaskResult` — it doesn't know about processes,
//! strategies, or expressions.

use crate::state::{TaskResult, TaskStatus};
use std::future::Future;
use std::time::Duration;

/// Per-task retry configuration (spec.md §3 `RetryCount`/`RetryDelayMs`).
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Additional attempts after the first (total invocations = max_retries + 1).
    pub max_retries: u32,
    pub delay_ms: u64,
    /// When true, delay doubles after each retry (capped, see `delay_for_attempt`).
    pub exponential: bool,
}

impl RetryConfig {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delay_ms: 0,
            exponential: false,
        }
    }

    /// Delay before retry attempt `attempt` (1-based: the first retry is
    /// attempt 1). Exponential backoff caps the shift to avoid overflow.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.exponential {
            let shift = attempt.saturating_sub(1).min(20);
            Duration::from_millis(self.delay_ms.saturating_mul(1u64 << shift))
        } else {
            Duration::from_millis(self.delay_ms)
        }
    }
}

/// A `TaskResult` is a retry candidate iff it failed and wasn't skipped
/// (spec.md §4.4 step 5). Cancellation is excluded even though
/// `TaskResult::is_failed` reports it, per spec.md §4.4 step 5 "Cancellation
/// is never retried."
fn is_retry_candidate(result: &TaskResult) -> bool {
    result.is_failed() && !result.was_skipped() && result.status != TaskStatus::Cancelled
}

/// Runs `op` up to `config.max_retries + 1` times. `on_retry(attempt,
/// max_retries)` fires once per retry, before the delay, matching spec.md
/// §8's testable property ("invoked `onRetry` exactly k times").
pub async fn run_with_retry<F, Fut>(
    config: &RetryConfig,
    mut on_retry: impl FnMut(u32, u32),
    mut op: F,
) -> TaskResult
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = TaskResult>,
{
    let mut attempt = 0;
    loop {
        let result = op(attempt).await;
        if result.status == TaskStatus::Cancelled
            || attempt >= config.max_retries
            || !is_retry_candidate(&result)
        {
            return result;
        }
        attempt += 1;
        on_retry(attempt, config.max_retries);
        tokio::time::sleep(config.delay_for_attempt(attempt)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TaskOutput;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retries_until_success_then_stops() {
        let config = RetryConfig {
            max_retries: 2,
            delay_ms: 1,
            exponential: false,
        };
        let calls = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let retries_clone = retries.clone();

        let result = run_with_retry(
            &config,
            |_attempt, _max| {
                retries_clone.fetch_add(1, Ordering::SeqCst);
            },
            |_attempt| {
                let calls = calls_clone.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        TaskResult::failed("flaky".into(), 1, TaskOutput::empty(), "boom", Utc::now())
                    } else {
                        TaskResult::succeeded("flaky".into(), 0, TaskOutput::empty(), Utc::now())
                    }
                }
            },
        )
        .await;

        assert!(result.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausts_retries_and_returns_last_failure() {
        let config = RetryConfig {
            max_retries: 1,
            delay_ms: 1,
            exponential: false,
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = run_with_retry(&config, |_, _| {}, |_attempt| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                TaskResult::failed("t".into(), 1, TaskOutput::empty(), "boom", Utc::now())
            }
        })
        .await;

        assert!(result.is_failed());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_is_never_retried() {
        let config = RetryConfig {
            max_retries: 5,
            delay_ms: 1,
            exponential: false,
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = run_with_retry(&config, |_, _| {}, |_attempt| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                TaskResult::cancelled("t".into(), None, Utc::now())
            }
        })
        .await;

        assert_eq!(result.status, TaskStatus::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exponential_delay_doubles_and_caps_shift() {
        let config = RetryConfig {
            max_retries: 10,
            delay_ms: 100,
            exponential: true,
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
    }
}
