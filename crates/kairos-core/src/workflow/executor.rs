//! Workflow executor: attempt submission and the task dispatch loop.
//!
//! Submission expands a compiled workflow into task rows (root `Ready`, every
//! other task `Blocked`) inside one store transaction. Execution is a loop of
//! passes:
//!
//! 1. **Propagate**: for each running attempt, apply structural transitions
//!    until nothing changes. Blocked tasks whose upstreams all succeeded (and
//!    whose parent group is running) become ready; blocked tasks behind a
//!    failed upstream are canceled; ready groups start; running groups finish
//!    once all their children are terminal. A terminal root finishes the
//!    attempt.
//! 2. **Dispatch**: claim dispatchable leaf tasks with a compare-and-set
//!    (`lock_task_for_run`) and run their operators on a `JoinSet`, bounded by
//!    a semaphore of `max_concurrent_tasks` permits.
//! 3. **Apply**: write each operator outcome back with a compare-and-set on
//!    `Running`, so results of tasks canceled meanwhile are discarded.
//!
//! Every transition goes through the store's compare-and-set primitives, so
//! several executors may share one store.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use futures_util::FutureExt;
use kairos_types::config::{ExecutorConfig, RetryConfig};
use kairos_types::error::RepositoryError;
use kairos_types::session::{
    AttemptRequest, AttemptStatus, NewTask, StateParams, StoredSessionAttempt, StoredTask,
    TaskState, TaskUpdate,
};
use serde_json::Value;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::session::SessionStore;

use super::compiler::CompiledWorkflow;
use super::operator::{OperatorContext, TaskExecutionError, TaskRequest, TaskResult};
use super::registry::OperatorRegistry;
use super::retry::RetryHandler;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Outcome of one [`WorkflowExecutor::run_task_pass`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    /// Attempts that reached a terminal status during the pass.
    pub finished: Vec<Uuid>,
    /// Operators invoked during the pass.
    pub dispatched: usize,
    /// Attempts still running after the pass.
    pub running_attempts: usize,
    /// Earliest moment a retry-waiting task becomes dispatchable.
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Propagation result across all running attempts.
#[derive(Default)]
struct Propagation {
    attempts: HashMap<Uuid, StoredSessionAttempt>,
    dispatchable: Vec<StoredTask>,
    finished: Vec<Uuid>,
    next_retry_at: Option<DateTime<Utc>>,
}

enum AttemptProgress {
    Finished(AttemptStatus),
    Pending {
        dispatchable: Vec<StoredTask>,
        next_retry_at: Option<DateTime<Utc>>,
    },
}

/// An operator invocation that returned.
struct Completion {
    task: StoredTask,
    outcome: Result<TaskResult, TaskExecutionError>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Until {
    Idle,
    AnyFinished,
    Cancelled,
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

/// Submits attempts and drives their tasks to completion.
///
/// Generic over `S: SessionStore` for storage flexibility.
pub struct WorkflowExecutor<S: SessionStore> {
    store: S,
    operators: OperatorRegistry,
    config: ExecutorConfig,
    retry: RetryConfig,
    slots: Arc<Semaphore>,
    /// Cancellation tokens handed to operators, keyed by attempt id.
    cancellations: DashMap<Uuid, CancellationToken>,
    /// Signalled on new submissions so an idle loop wakes up early.
    wake: Notify,
}

impl<S: SessionStore> WorkflowExecutor<S> {
    pub fn new(
        store: S,
        operators: OperatorRegistry,
        config: ExecutorConfig,
        retry: RetryConfig,
    ) -> Self {
        let permits = config.max_concurrent_tasks.max(1);
        Self {
            store,
            operators,
            config,
            retry,
            slots: Arc::new(Semaphore::new(permits)),
            cancellations: DashMap::new(),
            wake: Notify::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Create an attempt running the whole workflow on behalf of `site_id`.
    ///
    /// Fails with `RepositoryError::SessionAttemptConflict` when the session
    /// already exists and the request is not a named retry.
    pub async fn submit_workflow(
        &self,
        site_id: i32,
        request: &AttemptRequest,
        workflow: &CompiledWorkflow,
    ) -> Result<StoredSessionAttempt, ExecutorError> {
        let tasks = expand_tasks(workflow);
        let attempt = self
            .store
            .create_attempt(site_id, request, &tasks, Utc::now())
            .await?;

        tracing::info!(
            attempt_id = %attempt.id,
            site_id,
            workflow = attempt.workflow_name.as_str(),
            session_time = %attempt.session_time,
            tasks = tasks.len(),
            "attempt submitted"
        );
        self.wake.notify_one();
        Ok(attempt)
    }

    /// Create an attempt running only the subtree at `subtask_path`.
    pub async fn submit_subworkflow(
        &self,
        site_id: i32,
        request: &AttemptRequest,
        workflow: &CompiledWorkflow,
        subtask_path: &str,
    ) -> Result<StoredSessionAttempt, ExecutorError> {
        let index = workflow
            .find_path(subtask_path)
            .ok_or_else(|| ExecutorError::UnknownSubtask {
                workflow: workflow.name.clone(),
                path: subtask_path.to_string(),
            })?;
        self.submit_workflow(site_id, request, &workflow.subtree(index)).await
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn find_attempt(
        &self,
        attempt_id: &Uuid,
    ) -> Result<Option<StoredSessionAttempt>, ExecutorError> {
        Ok(self.store.get_attempt(attempt_id).await?)
    }

    pub async fn list_tasks(&self, attempt_id: &Uuid) -> Result<Vec<StoredTask>, ExecutorError> {
        Ok(self.store.list_tasks(attempt_id).await?)
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Cancel a running attempt.
    ///
    /// Marks every non-terminal task canceled and signals the attempt's
    /// cancellation token. Operators already running are not interrupted;
    /// their results are discarded. Returns `false` if the attempt was done.
    pub async fn cancel_attempt(&self, attempt_id: &Uuid) -> Result<bool, ExecutorError> {
        let attempt = self
            .store
            .get_attempt(attempt_id)
            .await?
            .ok_or(ExecutorError::AttemptNotFound(*attempt_id))?;
        if attempt.status.is_done() {
            return Ok(false);
        }

        let now = Utc::now();
        self.cancel_token(attempt_id).cancel();
        let canceled = self.store.cancel_attempt_tasks(attempt_id, now).await?;
        tracing::info!(attempt_id = %attempt_id, canceled, "attempt canceled");
        self.finish(&attempt, AttemptStatus::Canceled, now).await
    }

    fn cancel_token(&self, attempt_id: &Uuid) -> CancellationToken {
        self.cancellations
            .entry(*attempt_id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    // -----------------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------------

    /// One deterministic pass at `now`: propagate, dispatch, wait for every
    /// dispatched operator, apply outcomes, propagate again.
    pub async fn run_task_pass(&self, now: DateTime<Utc>) -> Result<PassReport, ExecutorError> {
        let before = self.propagate(now).await?;
        let mut in_flight = JoinSet::new();
        let dispatched = self.dispatch(now, &before, &mut in_flight).await?;
        self.drain(&mut in_flight, Some(now)).await?;

        let after = self.propagate(now).await?;
        let mut finished = before.finished;
        finished.extend(after.finished);
        Ok(PassReport {
            finished,
            dispatched,
            running_attempts: after.attempts.len(),
            next_retry_at: after.next_retry_at,
        })
    }

    /// Run until no attempt is running. Returns the attempts that finished.
    pub async fn run(&self) -> Result<Vec<Uuid>, ExecutorError> {
        self.drive(Until::Idle, None).await
    }

    /// Run until at least one attempt finishes, or nothing is running.
    pub async fn run_until_any(&self) -> Result<Vec<Uuid>, ExecutorError> {
        self.drive(Until::AnyFinished, None).await
    }

    /// Server mode: loop until `cancel` fires, picking up new submissions.
    pub async fn run_forever(&self, cancel: CancellationToken) -> Result<(), ExecutorError> {
        tracing::info!(
            max_concurrent_tasks = self.config.max_concurrent_tasks,
            "workflow executor started"
        );
        self.drive(Until::Cancelled, Some(&cancel)).await?;
        tracing::info!("workflow executor stopped");
        Ok(())
    }

    async fn drive(
        &self,
        until: Until,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Uuid>, ExecutorError> {
        let idle = Duration::from_millis(self.config.idle_poll_interval_ms.max(1));
        let mut in_flight: JoinSet<Completion> = JoinSet::new();
        let mut finished = Vec::new();

        loop {
            let now = Utc::now();
            let propagation = self.propagate(now).await?;
            finished.extend(propagation.finished.iter().copied());

            let done = match until {
                Until::Idle => propagation.attempts.is_empty() && in_flight.is_empty(),
                Until::AnyFinished => {
                    !finished.is_empty() || (propagation.attempts.is_empty() && in_flight.is_empty())
                }
                Until::Cancelled => cancel.is_some_and(CancellationToken::is_cancelled),
            };
            if done {
                self.drain(&mut in_flight, None).await?;
                return Ok(finished);
            }

            self.dispatch(now, &propagation, &mut in_flight).await?;

            let wait = propagation
                .next_retry_at
                .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
                .map_or(idle, |until_retry| until_retry.min(idle));

            tokio::select! {
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    let completion = joined.map_err(|e| ExecutorError::Join(e.to_string()))?;
                    self.apply(completion, Utc::now()).await?;
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
                _ = cancelled(cancel) => {}
            }
        }
    }

    /// Wait for every in-flight operator and apply its outcome.
    async fn drain(
        &self,
        in_flight: &mut JoinSet<Completion>,
        fixed_now: Option<DateTime<Utc>>,
    ) -> Result<(), ExecutorError> {
        while let Some(joined) = in_flight.join_next().await {
            let completion = joined.map_err(|e| ExecutorError::Join(e.to_string()))?;
            self.apply(completion, fixed_now.unwrap_or_else(Utc::now)).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Propagation
    // -----------------------------------------------------------------------

    async fn propagate(&self, now: DateTime<Utc>) -> Result<Propagation, ExecutorError> {
        let mut out = Propagation::default();
        for attempt in self.store.list_running_attempts().await? {
            match self.propagate_attempt(&attempt, now).await? {
                AttemptProgress::Finished(status) => {
                    if self.finish(&attempt, status, now).await? {
                        out.finished.push(attempt.id);
                    }
                }
                AttemptProgress::Pending {
                    dispatchable,
                    next_retry_at,
                } => {
                    out.dispatchable.extend(dispatchable);
                    out.next_retry_at = earliest(out.next_retry_at, next_retry_at);
                    out.attempts.insert(attempt.id, attempt);
                }
            }
        }
        Ok(out)
    }

    async fn propagate_attempt(
        &self,
        attempt: &StoredSessionAttempt,
        now: DateTime<Utc>,
    ) -> Result<AttemptProgress, ExecutorError> {
        loop {
            let tasks = self.store.list_tasks(&attempt.id).await?;
            let root = tasks
                .iter()
                .find(|t| t.parent_id.is_none())
                .ok_or(ExecutorError::MissingRootTask(attempt.id))?;
            if root.state.is_terminal() {
                return Ok(AttemptProgress::Finished(attempt_status(root.state)));
            }

            let graph = TaskGraph::new(&tasks);
            let mut changed = false;
            for task in &tasks {
                let Some(next) = graph.next_state(task) else {
                    continue;
                };
                if self
                    .store
                    .update_task(&task.id, task.state, &TaskUpdate::to(next), now)
                    .await?
                {
                    tracing::debug!(
                        attempt_id = %attempt.id,
                        task = task.path.as_str(),
                        from = task.state.as_str(),
                        to = next.as_str(),
                        "task transition"
                    );
                    changed = true;
                }
            }
            if changed {
                continue;
            }

            let mut dispatchable = Vec::new();
            let mut next_retry_at = None;
            for task in tasks.into_iter().filter(|t| !t.is_group) {
                match (task.state, task.retry_at) {
                    (TaskState::Ready, _) => dispatchable.push(task),
                    (TaskState::RetryWaiting, Some(at)) if at > now => {
                        next_retry_at = earliest(next_retry_at, Some(at));
                    }
                    (TaskState::RetryWaiting, _) => dispatchable.push(task),
                    _ => {}
                }
            }
            return Ok(AttemptProgress::Pending {
                dispatchable,
                next_retry_at,
            });
        }
    }

    /// Finish an attempt and fail its parent chain when it did not succeed.
    async fn finish(
        &self,
        attempt: &StoredSessionAttempt,
        status: AttemptStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, ExecutorError> {
        let finished = self.store.finish_attempt(&attempt.id, status, now).await?;
        if let Some((_, token)) = self.cancellations.remove(&attempt.id) {
            if status != AttemptStatus::Success {
                token.cancel();
            }
        }
        if !finished {
            return Ok(false);
        }
        tracing::info!(
            attempt_id = %attempt.id,
            workflow = attempt.workflow_name.as_str(),
            status = ?status,
            "attempt finished"
        );

        let mut parent_id = match status {
            AttemptStatus::Error | AttemptStatus::Canceled => attempt.parent_attempt_id,
            _ => None,
        };
        while let Some(id) = parent_id {
            let Some(parent) = self.store.get_attempt(&id).await? else {
                break;
            };
            if parent.status.is_done() {
                break;
            }
            tracing::warn!(
                attempt_id = %parent.id,
                child_attempt_id = %attempt.id,
                "subworkflow failed, failing parent attempt"
            );
            if let Some((_, token)) = self.cancellations.remove(&parent.id) {
                token.cancel();
            }
            self.store.cancel_attempt_tasks(&parent.id, now).await?;
            if !self
                .store
                .finish_attempt(&parent.id, AttemptStatus::Error, now)
                .await?
            {
                break;
            }
            parent_id = parent.parent_attempt_id;
        }
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Dispatch and apply
    // -----------------------------------------------------------------------

    async fn dispatch(
        &self,
        now: DateTime<Utc>,
        propagation: &Propagation,
        in_flight: &mut JoinSet<Completion>,
    ) -> Result<usize, ExecutorError> {
        let mut dispatched = 0;
        for candidate in &propagation.dispatchable {
            let Some(attempt) = propagation.attempts.get(&candidate.attempt_id) else {
                continue;
            };
            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                tracing::debug!("all executor slots busy");
                break;
            };
            let Some(task) = self.store.lock_task_for_run(&candidate.id, now).await? else {
                continue;
            };

            let context = OperatorContext {
                request: task_request(attempt, &task),
                cancel: self.cancel_token(&attempt.id),
                retry: self.retry,
            };
            let task_type = context.request.task_type.clone();
            let operator = self.operators.new_operator(context);
            tracing::debug!(
                attempt_id = %attempt.id,
                task = task.path.as_str(),
                task_type = task_type.as_str(),
                "dispatching task"
            );

            in_flight.spawn(async move {
                let _permit = permit;
                let outcome = match operator {
                    Some(mut operator) => AssertUnwindSafe(operator.run_task())
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| Err(TaskExecutionError::deterministic("operator panicked"))),
                    None => Err(TaskExecutionError::deterministic(format!(
                        "unknown operator type '{task_type}'"
                    ))),
                };
                Completion { task, outcome }
            });
            dispatched += 1;
        }
        Ok(dispatched)
    }

    async fn apply(&self, completion: Completion, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        let Completion { task, outcome } = completion;
        let update = match outcome {
            Ok(result) => {
                let update = TaskUpdate::to(TaskState::Success)
                    .with_store_params(Value::Object(result.store_params));
                match result.state_params {
                    Some(state) => update.with_state_params(state),
                    None => update,
                }
            }
            Err(TaskExecutionError::Polling {
                interval_secs,
                state_params,
            }) => {
                tracing::debug!(
                    task_id = %task.id,
                    task = task.path.as_str(),
                    interval_secs,
                    "task polling"
                );
                TaskUpdate::to(TaskState::RetryWaiting)
                    .with_state_params(state_params)
                    .with_retry_at(after_secs(now, interval_secs))
            }
            Err(TaskExecutionError::Deterministic {
                message,
                error_config,
            }) => {
                if RetryHandler::should_retry(task.retry_limit, task.retry_count) {
                    let interval = RetryHandler::retry_interval_secs(&self.retry, task.retry_count);
                    tracing::warn!(
                        task_id = %task.id,
                        task = task.path.as_str(),
                        retry = task.retry_count + 1,
                        retry_limit = task.retry_limit,
                        interval_secs = interval,
                        error = message.as_str(),
                        "task failed, retrying"
                    );
                    TaskUpdate::to(TaskState::RetryWaiting)
                        .with_error(error_config)
                        .with_state_params(StateParams::new())
                        .with_retry_count(task.retry_count + 1)
                        .with_retry_at(after_secs(now, interval))
                } else {
                    tracing::warn!(
                        task_id = %task.id,
                        task = task.path.as_str(),
                        error = message.as_str(),
                        "task failed"
                    );
                    TaskUpdate::to(TaskState::Error).with_error(error_config)
                }
            }
        };

        if !self
            .store
            .update_task(&task.id, TaskState::Running, &update, now)
            .await?
        {
            tracing::debug!(
                task_id = %task.id,
                "task no longer running, discarding operator result"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Expand a compiled workflow into task rows with pre-assigned ids.
pub fn expand_tasks(workflow: &CompiledWorkflow) -> Vec<NewTask> {
    let ids: Vec<Uuid> = workflow.tasks.iter().map(|_| Uuid::now_v7()).collect();
    workflow
        .tasks
        .iter()
        .enumerate()
        .map(|(index, task)| NewTask {
            id: ids[index],
            parent_id: task.parent.map(|p| ids[p]),
            upstream_ids: task.upstreams.iter().map(|u| ids[*u]).collect(),
            path: task.path.clone(),
            is_group: task.is_group(),
            task_type: task.task_type.clone(),
            config: task.config.clone(),
            retry_limit: task.retry_limit,
            state: if index == 0 {
                TaskState::Ready
            } else {
                TaskState::Blocked
            },
        })
        .collect()
}

fn task_request(attempt: &StoredSessionAttempt, task: &StoredTask) -> TaskRequest {
    TaskRequest {
        attempt_id: attempt.id,
        task_id: task.id,
        workflow_name: attempt.workflow_name.clone(),
        task_path: task.path.clone(),
        task_type: task.task_type.clone().unwrap_or_default(),
        config: task.config.clone(),
        params: attempt.params.clone(),
        session_time: attempt.session_time,
        time_zone: attempt.time_zone.clone(),
        state_params: task.state_params.clone(),
        retry_count: task.retry_count,
    }
}

/// Structural view of an attempt's tasks for transition decisions.
struct TaskGraph<'a> {
    states: HashMap<Uuid, TaskState>,
    children: HashMap<Uuid, Vec<&'a StoredTask>>,
}

impl<'a> TaskGraph<'a> {
    fn new(tasks: &'a [StoredTask]) -> Self {
        let states = tasks.iter().map(|t| (t.id, t.state)).collect();
        let mut children: HashMap<Uuid, Vec<&StoredTask>> = HashMap::new();
        for task in tasks {
            if let Some(parent) = task.parent_id {
                children.entry(parent).or_default().push(task);
            }
        }
        Self { states, children }
    }

    fn state(&self, id: &Uuid) -> Option<TaskState> {
        self.states.get(id).copied()
    }

    /// Structural transition for `task`, if one applies.
    fn next_state(&self, task: &StoredTask) -> Option<TaskState> {
        match task.state {
            TaskState::Blocked => {
                let parent = task.parent_id.and_then(|p| self.state(&p));
                let upstream_failed = task
                    .upstream_ids
                    .iter()
                    .any(|u| self.state(u).is_some_and(TaskState::is_failure));
                if upstream_failed || parent.is_some_and(TaskState::is_failure) {
                    return Some(TaskState::Canceled);
                }
                let parent_running = parent.is_none_or(|p| p == TaskState::Running);
                let upstreams_done = task
                    .upstream_ids
                    .iter()
                    .all(|u| self.state(u) == Some(TaskState::Success));
                (parent_running && upstreams_done).then_some(TaskState::Ready)
            }
            TaskState::Ready if task.is_group => Some(TaskState::Running),
            TaskState::Running if task.is_group => {
                let children = self.children.get(&task.id).map(Vec::as_slice).unwrap_or(&[]);
                if !children.iter().all(|c| c.state.is_terminal()) {
                    return None;
                }
                if children.iter().any(|c| c.state == TaskState::Error) {
                    Some(TaskState::Error)
                } else if children.iter().any(|c| c.state == TaskState::Canceled) {
                    Some(TaskState::Canceled)
                } else {
                    Some(TaskState::Success)
                }
            }
            _ => None,
        }
    }
}

fn attempt_status(root: TaskState) -> AttemptStatus {
    match root {
        TaskState::Success => AttemptStatus::Success,
        TaskState::Canceled => AttemptStatus::Canceled,
        _ => AttemptStatus::Error,
    }
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn after_secs(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("workflow '{workflow}' has no task at '{path}'")]
    UnknownSubtask { workflow: String, path: String },

    #[error("attempt not found: {0}")]
    AttemptNotFound(Uuid),

    #[error("attempt {0} has no root task")]
    MissingRootTask(Uuid),

    #[error("task join error: {0}")]
    Join(String),
}

impl ExecutorError {
    /// Stable, machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutorError::Repository(e) => e.kind(),
            ExecutorError::UnknownSubtask { .. } => "no_match",
            ExecutorError::AttemptNotFound(_) => "resource_not_found",
            ExecutorError::MissingRootTask(_) => "corrupt_attempt",
            ExecutorError::Join(_) => "join",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::TimeZone;
    use serde_json::json;

    use kairos_types::session::DEFAULT_SITE_ID;
    use super::*;
    use crate::repository::memory::MemoryStore;
    use crate::workflow::compiler::compile;
    use crate::workflow::operator::{Operator, OperatorFactory};
    use crate::workflow::retry::{BackoffPolicy, ResumableProgress, StepFailure};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn secs(n: i64) -> TimeDelta {
        TimeDelta::try_seconds(n).unwrap()
    }

    fn executor(operators: OperatorRegistry) -> WorkflowExecutor<MemoryStore> {
        let config = ExecutorConfig {
            idle_poll_interval_ms: 20,
            ..ExecutorConfig::default()
        };
        WorkflowExecutor::new(MemoryStore::new(), operators, config, RetryConfig::default())
    }

    fn request(workflow: &str, session_time: DateTime<Utc>) -> AttemptRequest {
        AttemptRequest {
            repository_id: Uuid::nil(),
            revision_id: Uuid::now_v7(),
            workflow_definition_id: Uuid::now_v7(),
            workflow_name: workflow.to_string(),
            session_time,
            time_zone: "UTC".to_string(),
            params: Default::default(),
            parent_attempt_id: None,
            retry_attempt_name: None,
        }
    }

    async fn states(exec: &WorkflowExecutor<MemoryStore>, attempt_id: &Uuid) -> HashMap<String, TaskState> {
        exec.list_tasks(attempt_id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| (t.path, t.state))
            .collect()
    }

    // -- resumable test operator --------------------------------------------

    struct ResumableFactory {
        seen: Arc<Mutex<Vec<StateParams>>>,
        failed_once: Arc<AtomicBool>,
    }

    struct Resumable {
        state: StateParams,
        seen: Arc<Mutex<Vec<StateParams>>>,
        failed_once: Arc<AtomicBool>,
    }

    impl OperatorFactory for ResumableFactory {
        type Operator = Resumable;

        fn operator_type(&self) -> &str {
            "resumable"
        }

        fn new_operator(&self, context: OperatorContext) -> Resumable {
            Resumable {
                state: context.request.state_params,
                seen: Arc::clone(&self.seen),
                failed_once: Arc::clone(&self.failed_once),
            }
        }
    }

    impl Operator for Resumable {
        async fn run_task(&mut self) -> Result<TaskResult, TaskExecutionError> {
            self.seen.lock().unwrap().push(self.state.clone());
            let failed_once = Arc::clone(&self.failed_once);
            let progress = ResumableProgress::new(self.state.clone(), BackoffPolicy::new(4, 30));
            let state = progress
                .run(3, move |i| {
                    let fail = i == 2 && !failed_once.swap(true, Ordering::SeqCst);
                    async move {
                        if fail {
                            Err(StepFailure::transient("backend busy"))
                        } else {
                            Ok(())
                        }
                    }
                })
                .await?;
            Ok(TaskResult::empty().with_state_params(state))
        }
    }

    struct PollForeverFactory;
    struct PollForever;

    impl OperatorFactory for PollForeverFactory {
        type Operator = PollForever;

        fn operator_type(&self) -> &str {
            "poll_forever"
        }

        fn new_operator(&self, _context: OperatorContext) -> PollForever {
            PollForever
        }
    }

    impl Operator for PollForever {
        async fn run_task(&mut self) -> Result<TaskResult, TaskExecutionError> {
            Err(TaskExecutionError::next_polling(3600, StateParams::new()))
        }
    }

    fn registry_with_test_operators() -> (OperatorRegistry, Arc<Mutex<Vec<StateParams>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = OperatorRegistry::with_builtins();
        registry.register(ResumableFactory {
            seen: Arc::clone(&seen),
            failed_once: Arc::new(AtomicBool::new(false)),
        });
        registry.register(PollForeverFactory);
        (registry, seen)
    }

    // -- tests ----------------------------------------------------------------

    #[tokio::test]
    async fn test_linear_chain_runs_to_success() {
        let exec = executor(OperatorRegistry::with_builtins());
        let wf = compile(
            "chain",
            &json!({"tasks": [
                {"name": "a", "type": "echo", "config": {"message": "first"}},
                {"name": "b", "type": "echo", "config": {"message": "second"}, "depends_on": ["a"]},
            ]}),
        )
        .unwrap();
        let attempt = exec.submit_workflow(DEFAULT_SITE_ID, &request("chain", t0()), &wf).await.unwrap();

        let first = exec.run_task_pass(t0()).await.unwrap();
        assert_eq!(first.dispatched, 1);
        assert_eq!(states(&exec, &attempt.id).await["b"], TaskState::Ready);

        let second = exec.run_task_pass(t0()).await.unwrap();
        assert_eq!(second.dispatched, 1);
        assert_eq!(second.finished, vec![attempt.id]);
        assert_eq!(second.running_attempts, 0);

        let stored = exec.find_attempt(&attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::Success);
        let tasks = exec.list_tasks(&attempt.id).await.unwrap();
        assert!(tasks.iter().all(|t| t.state == TaskState::Success));
        assert_eq!(tasks[2].store_params["message"], "second");
    }

    #[tokio::test]
    async fn test_submission_records_site_id() {
        let exec = executor(OperatorRegistry::with_builtins());
        let wf = compile(
            "etl",
            &json!({"tasks": [{"name": "extract", "type": "noop"}, {"name": "load", "type": "noop"}]}),
        )
        .unwrap();

        let whole = exec.submit_workflow(7, &request("etl", t0()), &wf).await.unwrap();
        assert_eq!(whole.site_id, 7);
        let part = exec
            .submit_subworkflow(9, &request("etl", t0() + secs(1)), &wf, "load")
            .await
            .unwrap();

        let stored = exec.store().get_attempt(&whole.id).await.unwrap().unwrap();
        assert_eq!(stored.site_id, 7);
        let stored = exec.store().get_attempt(&part.id).await.unwrap().unwrap();
        assert_eq!(stored.site_id, 9);
    }

    #[tokio::test]
    async fn test_resubmitting_same_session_conflicts() {
        let exec = executor(OperatorRegistry::with_builtins());
        let wf = compile("wf", &json!({"tasks": [{"name": "a", "type": "noop"}]})).unwrap();
        let req = request("wf", t0());

        let first = exec.submit_workflow(DEFAULT_SITE_ID, &req, &wf).await.unwrap();
        let err = exec.submit_workflow(DEFAULT_SITE_ID, &req, &wf).await.unwrap_err();
        assert_eq!(err.kind(), "session_attempt_conflict");

        let session = exec
            .store()
            .find_session(&Uuid::nil(), "wf", t0())
            .await
            .unwrap()
            .unwrap();
        let attempts = exec.store().list_session_attempts(&session.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].id, first.id);
    }

    #[tokio::test]
    async fn test_polling_task_resumes_with_saved_state() {
        let (registry, seen) = registry_with_test_operators();
        let exec = executor(registry);
        let wf = compile("wf", &json!({"tasks": [{"name": "load", "type": "resumable"}]})).unwrap();
        let attempt = exec.submit_workflow(DEFAULT_SITE_ID, &request("wf", t0()), &wf).await.unwrap();

        let report = exec.run_task_pass(t0()).await.unwrap();
        assert_eq!(report.next_retry_at, Some(t0() + secs(4)));
        let task = exec.list_tasks(&attempt.id).await.unwrap().remove(1);
        assert_eq!(task.state, TaskState::RetryWaiting);
        assert_eq!(task.state_params.get_i64("operation"), Some(2));
        assert_eq!(task.state_params.get_i64("retry"), Some(1));

        let early = exec.run_task_pass(t0() + secs(3)).await.unwrap();
        assert_eq!(early.dispatched, 0);
        assert_eq!(seen.lock().unwrap().len(), 1);

        let due = exec.run_task_pass(t0() + secs(4)).await.unwrap();
        assert_eq!(due.dispatched, 1);
        assert_eq!(due.finished, vec![attempt.id]);

        let invocations = seen.lock().unwrap().clone();
        let mut expected = StateParams::new();
        expected.set("operation", 2).set("retry", 1);
        assert_eq!(invocations[1], expected);

        let task = exec.list_tasks(&attempt.id).await.unwrap().remove(1);
        assert_eq!(task.state, TaskState::Success);
        assert!(!task.state_params.contains("retry"));
        assert_eq!(task.state_params.get_i64("operation"), Some(2));
    }

    #[tokio::test]
    async fn test_deterministic_failure_cancels_downstream() {
        let exec = executor(OperatorRegistry::with_builtins());
        let wf = compile(
            "wf",
            &json!({"tasks": [
                {"name": "a", "type": "fail", "config": {"message": "bad input"}},
                {"name": "b", "type": "noop", "depends_on": ["a"]},
                {"name": "c", "type": "noop"},
            ]}),
        )
        .unwrap();
        let attempt = exec.submit_workflow(DEFAULT_SITE_ID, &request("wf", t0()), &wf).await.unwrap();

        let report = exec.run_task_pass(t0()).await.unwrap();
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.finished, vec![attempt.id]);

        let states = states(&exec, &attempt.id).await;
        assert_eq!(states["a"], TaskState::Error);
        assert_eq!(states["b"], TaskState::Canceled);
        assert_eq!(states["c"], TaskState::Success);
        assert_eq!(states[""], TaskState::Error);

        let tasks = exec.list_tasks(&attempt.id).await.unwrap();
        assert_eq!(tasks[1].error.as_ref().unwrap()["message"], "bad input");
        let stored = exec.find_attempt(&attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::Error);
    }

    #[tokio::test]
    async fn test_task_retry_budget() {
        let exec = executor(OperatorRegistry::with_builtins());
        let wf = compile("wf", &json!({"tasks": [{"name": "a", "type": "fail", "retry": 1}]})).unwrap();
        let attempt = exec.submit_workflow(DEFAULT_SITE_ID, &request("wf", t0()), &wf).await.unwrap();

        exec.run_task_pass(t0()).await.unwrap();
        let task = exec.list_tasks(&attempt.id).await.unwrap().remove(1);
        assert_eq!(task.state, TaskState::RetryWaiting);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.retry_at, Some(t0() + secs(1)));

        let report = exec.run_task_pass(t0() + secs(1)).await.unwrap();
        assert_eq!(report.finished, vec![attempt.id]);
        let task = exec.list_tasks(&attempt.id).await.unwrap().remove(1);
        assert_eq!(task.state, TaskState::Error);
    }

    #[tokio::test]
    async fn test_group_runs_children_before_dependents() {
        let exec = executor(OperatorRegistry::with_builtins());
        let wf = compile(
            "wf",
            &json!({"tasks": [
                {"name": "g", "tasks": [
                    {"name": "x", "type": "noop"},
                    {"name": "y", "type": "noop", "depends_on": ["x"]},
                ]},
                {"name": "z", "type": "noop", "depends_on": ["g"]},
            ]}),
        )
        .unwrap();
        let attempt = exec.submit_workflow(DEFAULT_SITE_ID, &request("wf", t0()), &wf).await.unwrap();

        exec.run_task_pass(t0()).await.unwrap();
        let s = states(&exec, &attempt.id).await;
        assert_eq!(s["g"], TaskState::Running);
        assert_eq!(s["g.x"], TaskState::Success);
        assert_eq!(s["g.y"], TaskState::Ready);
        assert_eq!(s["z"], TaskState::Blocked);

        exec.run_task_pass(t0()).await.unwrap();
        let s = states(&exec, &attempt.id).await;
        assert_eq!(s["g"], TaskState::Success);
        assert_eq!(s["z"], TaskState::Ready);

        let report = exec.run_task_pass(t0()).await.unwrap();
        assert_eq!(report.finished, vec![attempt.id]);
    }

    #[tokio::test]
    async fn test_cancel_attempt_stops_dispatch() {
        let (registry, _) = registry_with_test_operators();
        let exec = executor(registry);
        let wf = compile(
            "wf",
            &json!({"tasks": [
                {"name": "wait", "type": "poll_forever"},
                {"name": "after", "type": "noop", "depends_on": ["wait"]},
            ]}),
        )
        .unwrap();
        let attempt = exec.submit_workflow(DEFAULT_SITE_ID, &request("wf", t0()), &wf).await.unwrap();
        exec.run_task_pass(t0()).await.unwrap();

        assert!(exec.cancel_attempt(&attempt.id).await.unwrap());
        assert!(!exec.cancel_attempt(&attempt.id).await.unwrap());

        let s = states(&exec, &attempt.id).await;
        assert!(s.values().all(|state| *state == TaskState::Canceled));
        let stored = exec.find_attempt(&attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::Canceled);

        let report = exec.run_task_pass(t0() + secs(7200)).await.unwrap();
        assert_eq!(report.dispatched, 0);

        let err = exec.cancel_attempt(&Uuid::now_v7()).await.unwrap_err();
        assert_eq!(err.kind(), "resource_not_found");
    }

    #[tokio::test]
    async fn test_subworkflow_runs_only_subtree() {
        let exec = executor(OperatorRegistry::with_builtins());
        let wf = compile(
            "etl",
            &json!({"tasks": [
                {"name": "extract", "type": "fail"},
                {"name": "load", "depends_on": ["extract"], "tasks": [
                    {"name": "stage", "type": "noop"},
                    {"name": "swap", "type": "noop", "depends_on": ["stage"]},
                ]},
            ]}),
        )
        .unwrap();
        let attempt = exec
            .submit_subworkflow(DEFAULT_SITE_ID, &request("etl", t0()), &wf, "load")
            .await
            .unwrap();
        let tasks = exec.list_tasks(&attempt.id).await.unwrap();
        let paths: Vec<&str> = tasks.iter().map(|t| t.path.as_str()).collect();
        assert_eq!(paths, vec!["load", "load.stage", "load.swap"]);

        for _ in 0..3 {
            exec.run_task_pass(t0()).await.unwrap();
        }
        let stored = exec.find_attempt(&attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::Success);

        let err = exec
            .submit_subworkflow(DEFAULT_SITE_ID, &request("etl", t0() + secs(1)), &wf, "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::UnknownSubtask { .. }));
    }

    #[tokio::test]
    async fn test_failed_subworkflow_fails_parent() {
        let (registry, _) = registry_with_test_operators();
        let exec = executor(registry);
        let parent_wf = compile("parent", &json!({"tasks": [{"name": "wait", "type": "poll_forever"}]})).unwrap();
        let child_wf = compile("child", &json!({"tasks": [{"name": "boom", "type": "fail"}]})).unwrap();

        let parent = exec.submit_workflow(DEFAULT_SITE_ID, &request("parent", t0()), &parent_wf).await.unwrap();
        let mut child_request = request("child", t0());
        child_request.parent_attempt_id = Some(parent.id);
        let child = exec.submit_workflow(DEFAULT_SITE_ID, &child_request, &child_wf).await.unwrap();

        let report = exec.run_task_pass(t0()).await.unwrap();
        assert!(report.finished.contains(&child.id));

        let parent = exec.find_attempt(&parent.id).await.unwrap().unwrap();
        assert_eq!(parent.status, AttemptStatus::Error);
        let s = states(&exec, &parent.id).await;
        assert!(s.values().all(|state| *state == TaskState::Canceled));
    }

    #[tokio::test]
    async fn test_run_drives_all_attempts() {
        let exec = executor(OperatorRegistry::with_builtins());
        let wf = compile(
            "wf",
            &json!({"tasks": [
                {"name": "a", "type": "noop"},
                {"name": "b", "type": "echo", "depends_on": ["a"]},
            ]}),
        )
        .unwrap();
        let first = exec.submit_workflow(DEFAULT_SITE_ID, &request("wf", t0()), &wf).await.unwrap();
        let second = exec
            .submit_workflow(DEFAULT_SITE_ID, &request("wf", t0() + secs(86_400)), &wf)
            .await
            .unwrap();

        let mut finished = exec.run().await.unwrap();
        finished.sort();
        let mut expected = vec![first.id, second.id];
        expected.sort();
        assert_eq!(finished, expected);
        assert!(exec.store().list_running_attempts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_until_any_returns_after_first_finish() {
        let (registry, _) = registry_with_test_operators();
        let exec = executor(registry);
        let quick = compile("quick", &json!({"tasks": [{"name": "a", "type": "noop"}]})).unwrap();
        let slow = compile("slow", &json!({"tasks": [{"name": "a", "type": "poll_forever"}]})).unwrap();

        let quick_attempt = exec.submit_workflow(DEFAULT_SITE_ID, &request("quick", t0()), &quick).await.unwrap();
        exec.submit_workflow(DEFAULT_SITE_ID, &request("slow", t0()), &slow).await.unwrap();

        let finished = exec.run_until_any().await.unwrap();
        assert_eq!(finished, vec![quick_attempt.id]);
        assert_eq!(exec.store().list_running_attempts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_forever_stops_on_cancel() {
        let exec = Arc::new(executor(OperatorRegistry::with_builtins()));
        let cancel = CancellationToken::new();
        let handle = {
            let exec = Arc::clone(&exec);
            let cancel = cancel.clone();
            tokio::spawn(async move { exec.run_forever(cancel).await })
        };

        let wf = compile("wf", &json!({"tasks": [{"name": "a", "type": "noop"}]})).unwrap();
        let attempt = exec.submit_workflow(DEFAULT_SITE_ID, &request("wf", t0()), &wf).await.unwrap();
        for _ in 0..100 {
            let stored = exec.find_attempt(&attempt.id).await.unwrap().unwrap();
            if stored.status.is_done() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let stored = exec.find_attempt(&attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::Success);
    }

    #[test]
    fn test_expand_tasks_wires_ids() {
        let wf = compile(
            "wf",
            &json!({"tasks": [
                {"name": "a", "type": "noop"},
                {"name": "b", "type": "noop", "depends_on": ["a"], "retry": 2},
            ]}),
        )
        .unwrap();
        let tasks = expand_tasks(&wf);
        assert_eq!(tasks[0].state, TaskState::Ready);
        assert!(tasks[0].is_group);
        assert_eq!(tasks[1].state, TaskState::Blocked);
        assert_eq!(tasks[1].parent_id, Some(tasks[0].id));
        assert_eq!(tasks[2].upstream_ids, vec![tasks[1].id]);
        assert_eq!(tasks[2].retry_limit, 2);
    }
}
