//! Operator contract: the interface every task executor implements.
//!
//! An operator receives the task's config, the attempt params and the task's
//! persisted state params. It either returns a [`TaskResult`], fails
//! deterministically, or asks to be polled again later with an updated state
//! snapshot (see [`TaskExecutionError::Polling`]).

use chrono::{DateTime, Utc};
use kairos_types::config::RetryConfig;
use kairos_types::session::StateParams;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Request / context
// ---------------------------------------------------------------------------

/// Everything an operator knows about the task it runs.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub attempt_id: Uuid,
    pub task_id: Uuid,
    pub workflow_name: String,
    /// Dot path of the task; empty when the task is the attempt root.
    pub task_path: String,
    pub task_type: String,
    pub config: Value,
    pub params: Map<String, Value>,
    pub session_time: DateTime<Utc>,
    pub time_zone: String,
    /// State persisted by the previous invocation, empty on the first run.
    pub state_params: StateParams,
    /// Task-level retries consumed so far.
    pub retry_count: u32,
}

impl TaskRequest {
    /// Display name: `workflow+path`, or the workflow name for the root.
    pub fn full_name(&self) -> String {
        if self.task_path.is_empty() {
            self.workflow_name.clone()
        } else {
            format!("{}+{}", self.workflow_name, self.task_path)
        }
    }

    /// A string field of the task config.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

/// Handed to an operator factory for each invocation.
#[derive(Debug, Clone)]
pub struct OperatorContext {
    pub request: TaskRequest,
    /// Cancelled when the attempt is cancelled. Operators poll it to abort
    /// cooperatively; the executor never interrupts a running operator.
    pub cancel: CancellationToken,
    /// Backoff bounds for operator-internal retries.
    pub retry: RetryConfig,
}

// ---------------------------------------------------------------------------
// Result / errors
// ---------------------------------------------------------------------------

/// Successful operator outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskResult {
    /// Output stored on the task row.
    pub store_params: Map<String, Value>,
    /// Final progress state to persist, if the operator keeps one.
    pub state_params: Option<StateParams>,
}

impl TaskResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_store_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.store_params.insert(key.into(), value.into());
        self
    }

    pub fn with_state_params(mut self, state: StateParams) -> Self {
        self.state_params = Some(state);
        self
    }
}

/// Typed failure raised by an operator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskExecutionError {
    /// Will never succeed as-is. Recorded on the task; only a task-level
    /// retry budget re-runs it.
    #[error("task failed: {message}")]
    Deterministic { message: String, error_config: Value },

    /// Not done yet: persist `state_params` and invoke again after
    /// `interval_secs`.
    #[error("task asked to be polled again in {interval_secs}s")]
    Polling {
        interval_secs: u64,
        state_params: StateParams,
    },
}

impl TaskExecutionError {
    pub fn deterministic(message: impl Into<String>) -> Self {
        let message = message.into();
        TaskExecutionError::Deterministic {
            error_config: serde_json::json!({ "message": message }),
            message,
        }
    }

    pub fn with_error_config(message: impl Into<String>, error_config: Value) -> Self {
        TaskExecutionError::Deterministic {
            message: message.into(),
            error_config,
        }
    }

    pub fn next_polling(interval_secs: u64, state_params: StateParams) -> Self {
        TaskExecutionError::Polling {
            interval_secs,
            state_params,
        }
    }

    pub fn is_polling(&self) -> bool {
        matches!(self, TaskExecutionError::Polling { .. })
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// One invocation of a task.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods.
pub trait Operator: Send {
    fn run_task(
        &mut self,
    ) -> impl std::future::Future<Output = Result<TaskResult, TaskExecutionError>> + Send;
}

/// Creates operators for one task type tag.
pub trait OperatorFactory: Send + Sync {
    type Operator: Operator + 'static;

    /// Type tag this factory serves (the task's `type`).
    fn operator_type(&self) -> &str;

    fn new_operator(&self, context: OperatorContext) -> Self::Operator;
}
