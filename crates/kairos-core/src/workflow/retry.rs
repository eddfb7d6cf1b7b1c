//! Retry policies.
//!
//! Two independent mechanisms:
//! - [`ResumableProgress`]: operator-internal retries. An operator that runs
//!   a list of idempotent operations records how far it got in its state
//!   params and asks to be polled again after a transient failure.
//! - [`RetryHandler`]: task-level retries of deterministic failures, bounded
//!   by the task's `retry` budget.
//!
//! Both back off exponentially, capped by [`BackoffPolicy`].

use kairos_types::config::RetryConfig;
use kairos_types::session::StateParams;
use serde_json::Value;

use super::operator::TaskExecutionError;

/// State key: index of the operation to resume from.
pub const OPERATION_KEY: &str = "operation";
/// State key: consecutive transient failures of the current operation.
pub const RETRY_KEY: &str = "retry";

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff: `min(initial * 2^retry, max)` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial_interval_secs: u64,
    pub max_interval_secs: u64,
}

impl BackoffPolicy {
    pub fn new(initial_interval_secs: u64, max_interval_secs: u64) -> Self {
        Self {
            initial_interval_secs,
            max_interval_secs,
        }
    }

    /// Wait before the retry following `retry` earlier failures.
    pub fn interval_secs(&self, retry: u32) -> u64 {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        self.initial_interval_secs
            .saturating_mul(factor)
            .min(self.max_interval_secs)
    }
}

impl From<RetryConfig> for BackoffPolicy {
    fn from(config: RetryConfig) -> Self {
        Self::new(config.initial_interval_secs, config.max_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// Operator-internal progress
// ---------------------------------------------------------------------------

/// How one operation of a [`ResumableProgress`] run failed.
#[derive(Debug, Clone, PartialEq)]
pub enum StepFailure {
    /// Retrying will not help; fail the task.
    Deterministic { message: String, error_config: Value },
    /// Temporary condition; resume this operation later.
    Transient(String),
}

impl StepFailure {
    pub fn deterministic(message: impl Into<String>) -> Self {
        let message = message.into();
        StepFailure::Deterministic {
            error_config: serde_json::json!({ "message": message }),
            message,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        StepFailure::Transient(message.into())
    }
}

/// Runs a fixed list of operations across invocations of the same task.
///
/// Operations with an index below the stored `operation` are skipped. A
/// transient failure of operation `i` stores `operation = i` and increments
/// `retry`, then returns [`TaskExecutionError::Polling`] with the backoff
/// interval for the previous retry count. A success clears `retry`.
#[derive(Debug, Clone)]
pub struct ResumableProgress {
    state: StateParams,
    backoff: BackoffPolicy,
}

impl ResumableProgress {
    pub fn new(state: StateParams, backoff: BackoffPolicy) -> Self {
        Self { state, backoff }
    }

    /// Index of the first operation still to run.
    pub fn resume_from(&self) -> usize {
        self.state
            .get_i64(OPERATION_KEY)
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or(0)
    }

    pub fn retry(&self) -> u32 {
        self.state
            .get_i64(RETRY_KEY)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0)
    }

    pub fn state(&self) -> &StateParams {
        &self.state
    }

    /// Run operations `resume_from()..count`, calling `step(i)` for each.
    ///
    /// Returns the final state on success.
    pub async fn run<F, Fut>(mut self, count: usize, mut step: F) -> Result<StateParams, TaskExecutionError>
    where
        F: FnMut(usize) -> Fut,
        Fut: std::future::Future<Output = Result<(), StepFailure>>,
    {
        for index in self.resume_from()..count {
            match step(index).await {
                Ok(()) => {
                    self.state.remove(RETRY_KEY);
                }
                Err(StepFailure::Deterministic { message, error_config }) => {
                    return Err(TaskExecutionError::Deterministic { message, error_config });
                }
                Err(StepFailure::Transient(message)) => {
                    let retry = self.retry();
                    let interval = self.backoff.interval_secs(retry);
                    tracing::warn!(
                        operation = index,
                        retry,
                        interval_secs = interval,
                        error = %message,
                        "transient failure, polling again"
                    );
                    self.state.set(OPERATION_KEY, index as i64).set(RETRY_KEY, retry + 1);
                    return Err(TaskExecutionError::next_polling(interval, self.state));
                }
            }
        }
        Ok(self.state)
    }
}

// ---------------------------------------------------------------------------
// Task-level retry
// ---------------------------------------------------------------------------

/// Stateless task-level retry decisions.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether a task that already consumed `retry_count` retries may run again.
    pub fn should_retry(retry_limit: u32, retry_count: u32) -> bool {
        retry_count < retry_limit
    }

    /// Wait before the next task-level retry.
    pub fn retry_interval_secs(config: &RetryConfig, retry_count: u32) -> u64 {
        BackoffPolicy::from(*config).interval_secs(retry_count)
    }
}
