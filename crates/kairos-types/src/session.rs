//! Session, attempt and task types.
//!
//! A session is the logical identity `(repository, workflow, session time)`.
//! Each session owns one or more attempts, and each attempt owns a tree of
//! tasks wired with upstream dependency edges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Site id used when a deployment runs a single site.
pub const DEFAULT_SITE_ID: i32 = 0;

// ---------------------------------------------------------------------------
// Attempt request
// ---------------------------------------------------------------------------

/// Immutable description of one run to submit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRequest {
    pub repository_id: Uuid,
    pub revision_id: Uuid,
    pub workflow_definition_id: Uuid,
    pub workflow_name: String,
    pub session_time: DateTime<Utc>,
    pub time_zone: String,
    /// Workflow defaults merged with caller overrides.
    pub params: serde_json::Map<String, Value>,
    pub parent_attempt_id: Option<Uuid>,
    /// When set, the attempt is added to an existing session as a retry.
    pub retry_attempt_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Sessions and attempts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    pub id: Uuid,
    pub repository_id: Uuid,
    pub workflow_name: String,
    pub session_time: DateTime<Utc>,
    pub last_attempt_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Attempt lifecycle. Every state except `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Running,
    Success,
    Error,
    Canceled,
}

impl AttemptStatus {
    pub fn is_done(self) -> bool {
        !matches!(self, AttemptStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSessionAttempt {
    pub id: Uuid,
    /// Site that submitted the attempt.
    pub site_id: i32,
    pub session_id: Uuid,
    pub repository_id: Uuid,
    pub workflow_name: String,
    pub session_time: DateTime<Utc>,
    /// `None` for the first attempt of a session.
    pub attempt_name: Option<String>,
    pub revision_id: Uuid,
    pub workflow_definition_id: Uuid,
    pub time_zone: String,
    pub params: serde_json::Map<String, Value>,
    pub parent_attempt_id: Option<Uuid>,
    pub status: AttemptStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Blocked,
    Ready,
    Running,
    RetryWaiting,
    Success,
    Error,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Error | TaskState::Canceled)
    }

    /// Terminal states that block downstream tasks.
    pub fn is_failure(self) -> bool {
        matches!(self, TaskState::Error | TaskState::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Blocked => "blocked",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::RetryWaiting => "retry_waiting",
            TaskState::Success => "success",
            TaskState::Error => "error",
            TaskState::Canceled => "canceled",
        }
    }
}

/// Current layout version of [`StateParams`].
pub const STATE_PARAMS_VERSION: u32 = 1;

fn state_params_version() -> u32 {
    STATE_PARAMS_VERSION
}

/// Opaque, versioned scratch space an operator uses to persist progress.
///
/// The executor never interprets the values; it stores them verbatim and
/// hands them back on the next invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateParams {
    #[serde(default = "state_params_version")]
    pub version: u32,
    #[serde(default)]
    values: serde_json::Map<String, Value>,
}

impl Default for StateParams {
    fn default() -> Self {
        Self::new()
    }
}

impl StateParams {
    pub fn new() -> Self {
        Self {
            version: STATE_PARAMS_VERSION,
            values: serde_json::Map::new(),
        }
    }

    pub fn from_map(values: serde_json::Map<String, Value>) -> Self {
        Self {
            version: STATE_PARAMS_VERSION,
            values,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Integer value for `key`, `None` if absent or not an integer.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(Value::as_i64)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_map(&self) -> &serde_json::Map<String, Value> {
        &self.values
    }
}

/// A task row to insert when an attempt is expanded.
///
/// Ids are assigned by the caller so parent and upstream links can be wired
/// before anything is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub upstream_ids: Vec<Uuid>,
    /// Dot path from the workflow root; empty for the root task.
    pub path: String,
    pub is_group: bool,
    pub task_type: Option<String>,
    pub config: Value,
    pub retry_limit: u32,
    pub state: TaskState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTask {
    pub id: Uuid,
    pub attempt_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub upstream_ids: Vec<Uuid>,
    pub path: String,
    pub is_group: bool,
    pub task_type: Option<String>,
    pub config: Value,
    pub state: TaskState,
    pub state_params: StateParams,
    /// Output of the last successful invocation.
    pub store_params: Value,
    pub error: Option<Value>,
    /// Task-level retries consumed so far.
    pub retry_count: u32,
    pub retry_limit: u32,
    /// Earliest moment a `RetryWaiting` task may be dispatched again.
    pub retry_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// A state transition plus the columns it rewrites.
///
/// `retry_at` is always written (`None` clears it); the other optional
/// fields keep the stored value when `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub state: TaskState,
    pub state_params: Option<StateParams>,
    pub store_params: Option<Value>,
    pub error: Option<Value>,
    pub retry_at: Option<DateTime<Utc>>,
    pub retry_count: Option<u32>,
}

impl TaskUpdate {
    pub fn to(state: TaskState) -> Self {
        Self {
            state,
            state_params: None,
            store_params: None,
            error: None,
            retry_at: None,
            retry_count: None,
        }
    }

    pub fn with_state_params(mut self, params: StateParams) -> Self {
        self.state_params = Some(params);
        self
    }

    pub fn with_store_params(mut self, params: Value) -> Self {
        self.store_params = Some(params);
        self
    }

    pub fn with_error(mut self, error: Value) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.retry_at = Some(at);
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }
}
