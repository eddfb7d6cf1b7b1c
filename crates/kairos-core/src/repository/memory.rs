//! In-memory implementation of both store traits.
//!
//! All state sits behind one `tokio::sync::Mutex`, so every operation is a
//! serialized transaction. Used for embedded runs without a database and as
//! the default store in tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kairos_types::error::RepositoryError;
use kairos_types::session::{
    AttemptRequest, AttemptStatus, NewTask, StateParams, StoredSession, StoredSessionAttempt,
    StoredTask, TaskState, TaskUpdate,
};
use kairos_types::workflow::{
    NewRevision, NewSchedule, NewWorkflowDefinition, RepositoryMode, ScheduleTime,
    StoredRepository, StoredRevision, StoredSchedule, StoredWorkflowDefinition,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::revision::{PublishedRevision, RevisionStore};
use super::session::SessionStore;

#[derive(Default)]
struct MemoryState {
    repositories: Vec<StoredRepository>,
    revisions: Vec<StoredRevision>,
    definitions: Vec<StoredWorkflowDefinition>,
    schedules: Vec<StoredSchedule>,
    sessions: Vec<StoredSession>,
    attempts: Vec<StoredSessionAttempt>,
    tasks: Vec<StoredTask>,
}

/// Cloneable handle to a shared in-memory store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// RevisionStore impl
// ---------------------------------------------------------------------------

impl RevisionStore for MemoryStore {
    async fn publish(
        &self,
        repository_name: &str,
        mode: RepositoryMode,
        revision: &NewRevision,
        workflows: &[NewWorkflowDefinition],
        schedules: Option<&[NewSchedule]>,
        now: DateTime<Utc>,
    ) -> Result<PublishedRevision, RepositoryError> {
        let mut state = self.state.lock().await;

        let repository = match state
            .repositories
            .iter()
            .find(|r| r.name == repository_name)
            .cloned()
        {
            Some(repo) => repo,
            None if mode == RepositoryMode::MustExist => {
                return Err(RepositoryError::NotFound(format!(
                    "repository '{repository_name}'"
                )));
            }
            None => {
                let repo = StoredRepository {
                    id: Uuid::now_v7(),
                    name: repository_name.to_string(),
                    created_at: now,
                };
                state.repositories.push(repo.clone());
                repo
            }
        };

        if state
            .revisions
            .iter()
            .any(|r| r.repository_id == repository.id && r.name == revision.name)
        {
            return Err(RepositoryError::Conflict(format!(
                "revision '{}' already exists in repository '{repository_name}'",
                revision.name
            )));
        }

        let seq = state
            .revisions
            .iter()
            .filter(|r| r.repository_id == repository.id)
            .map(|r| r.seq)
            .max()
            .unwrap_or(0)
            + 1;

        let stored_revision = StoredRevision {
            id: Uuid::now_v7(),
            repository_id: repository.id,
            seq,
            name: revision.name.clone(),
            archive_type: revision.archive_type.clone(),
            archive_digest: revision.archive_digest.clone(),
            default_time_zone: revision.default_time_zone.clone(),
            created_at: now,
        };
        state.revisions.push(stored_revision.clone());

        let stored_workflows: Vec<StoredWorkflowDefinition> = workflows
            .iter()
            .map(|w| StoredWorkflowDefinition {
                id: Uuid::now_v7(),
                repository_id: repository.id,
                revision_id: stored_revision.id,
                name: w.name.clone(),
                config: w.config.clone(),
                time_zone: w.time_zone.clone(),
                created_at: now,
            })
            .collect();
        state.definitions.extend(stored_workflows.iter().cloned());

        if let Some(schedules) = schedules {
            apply_schedules(&mut state, repository.id, &stored_workflows, schedules, now);
        }

        Ok(PublishedRevision {
            repository,
            revision: stored_revision,
            workflows: stored_workflows,
        })
    }

    async fn get_repository_by_name(
        &self,
        name: &str,
    ) -> Result<Option<StoredRepository>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.repositories.iter().find(|r| r.name == name).cloned())
    }

    async fn get_revision(&self, id: &Uuid) -> Result<Option<StoredRevision>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.revisions.iter().find(|r| r.id == *id).cloned())
    }

    async fn get_revision_by_name(
        &self,
        repository_id: &Uuid,
        name: &str,
    ) -> Result<Option<StoredRevision>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .revisions
            .iter()
            .find(|r| r.repository_id == *repository_id && r.name == name)
            .cloned())
    }

    async fn get_latest_revision(
        &self,
        repository_id: &Uuid,
    ) -> Result<Option<StoredRevision>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .revisions
            .iter()
            .filter(|r| r.repository_id == *repository_id)
            .max_by_key(|r| r.seq)
            .cloned())
    }

    async fn list_workflow_definitions(
        &self,
        revision_id: &Uuid,
    ) -> Result<Vec<StoredWorkflowDefinition>, RepositoryError> {
        let state = self.state.lock().await;
        let mut defs: Vec<_> = state
            .definitions
            .iter()
            .filter(|d| d.revision_id == *revision_id)
            .cloned()
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs)
    }

    async fn get_workflow_definition(
        &self,
        id: &Uuid,
    ) -> Result<Option<StoredWorkflowDefinition>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.definitions.iter().find(|d| d.id == *id).cloned())
    }

    async fn find_workflow_definition(
        &self,
        revision_id: &Uuid,
        name: &str,
    ) -> Result<Option<StoredWorkflowDefinition>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .definitions
            .iter()
            .find(|d| d.revision_id == *revision_id && d.name == name)
            .cloned())
    }

    async fn list_schedules(
        &self,
        repository_id: &Uuid,
    ) -> Result<Vec<StoredSchedule>, RepositoryError> {
        let state = self.state.lock().await;
        let mut schedules: Vec<_> = state
            .schedules
            .iter()
            .filter(|s| s.repository_id == *repository_id)
            .cloned()
            .collect();
        schedules.sort_by(|a, b| a.workflow_name.cmp(&b.workflow_name));
        Ok(schedules)
    }

    async fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<StoredSchedule>, RepositoryError> {
        let state = self.state.lock().await;
        let mut due: Vec<_> = state
            .schedules
            .iter()
            .filter(|s| s.next.run_time <= now)
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next.run_time);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn advance_schedule(
        &self,
        schedule_id: &Uuid,
        expected_run_time: DateTime<Utc>,
        next: ScheduleTime,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().await;
        match state.schedules.iter_mut().find(|s| s.id == *schedule_id) {
            Some(schedule) if schedule.next.run_time == expected_run_time => {
                schedule.next = next;
                schedule.updated_at = now;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound(format!("schedule {schedule_id}"))),
        }
    }

    async fn remove_schedule(
        &self,
        schedule_id: &Uuid,
        expected_run_time: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().await;
        let before = state.schedules.len();
        state
            .schedules
            .retain(|s| !(s.id == *schedule_id && s.next.run_time == expected_run_time));
        Ok(state.schedules.len() < before)
    }
}

fn apply_schedules(
    state: &mut MemoryState,
    repository_id: Uuid,
    workflows: &[StoredWorkflowDefinition],
    schedules: &[NewSchedule],
    now: DateTime<Utc>,
) {
    state.schedules.retain(|s| {
        s.repository_id != repository_id
            || schedules.iter().any(|n| n.workflow_name == s.workflow_name)
    });

    for new in schedules {
        let Some(def) = workflows.iter().find(|w| w.name == new.workflow_name) else {
            continue;
        };
        let existing = state
            .schedules
            .iter_mut()
            .find(|s| s.repository_id == repository_id && s.workflow_name == new.workflow_name);
        match existing {
            Some(schedule) => {
                if schedule.spec != new.spec {
                    schedule.spec = new.spec.clone();
                    schedule.next = new.next;
                }
                schedule.workflow_definition_id = def.id;
                schedule.updated_at = now;
            }
            None => state.schedules.push(StoredSchedule {
                id: Uuid::now_v7(),
                repository_id,
                workflow_definition_id: def.id,
                workflow_name: new.workflow_name.clone(),
                spec: new.spec.clone(),
                next: new.next,
                created_at: now,
                updated_at: now,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionStore impl
// ---------------------------------------------------------------------------

impl SessionStore for MemoryStore {
    async fn create_attempt(
        &self,
        site_id: i32,
        request: &AttemptRequest,
        tasks: &[NewTask],
        now: DateTime<Utc>,
    ) -> Result<StoredSessionAttempt, RepositoryError> {
        let mut state = self.state.lock().await;

        let existing = state
            .sessions
            .iter()
            .find(|s| {
                s.repository_id == request.repository_id
                    && s.workflow_name == request.workflow_name
                    && s.session_time == request.session_time
            })
            .map(|s| s.id);

        let session_id = match existing {
            Some(session_id) => {
                let Some(name) = &request.retry_attempt_name else {
                    return Err(RepositoryError::SessionAttemptConflict {
                        workflow: request.workflow_name.clone(),
                        session_time: request.session_time,
                    });
                };
                let attempts = state.attempts.iter().filter(|a| a.session_id == session_id);
                for attempt in attempts {
                    if attempt.attempt_name.as_deref() == Some(name.as_str()) {
                        return Err(RepositoryError::Conflict(format!(
                            "attempt '{name}' already exists in session {session_id}"
                        )));
                    }
                    if !attempt.status.is_done() {
                        return Err(RepositoryError::Conflict(format!(
                            "session {session_id} has a running attempt {}",
                            attempt.id
                        )));
                    }
                }
                session_id
            }
            None => {
                let session = StoredSession {
                    id: Uuid::now_v7(),
                    repository_id: request.repository_id,
                    workflow_name: request.workflow_name.clone(),
                    session_time: request.session_time,
                    last_attempt_id: None,
                    created_at: now,
                };
                let id = session.id;
                state.sessions.push(session);
                id
            }
        };

        let attempt = StoredSessionAttempt {
            id: Uuid::now_v7(),
            site_id,
            session_id,
            repository_id: request.repository_id,
            workflow_name: request.workflow_name.clone(),
            session_time: request.session_time,
            attempt_name: request.retry_attempt_name.clone(),
            revision_id: request.revision_id,
            workflow_definition_id: request.workflow_definition_id,
            time_zone: request.time_zone.clone(),
            params: request.params.clone(),
            parent_attempt_id: request.parent_attempt_id,
            status: AttemptStatus::Running,
            created_at: now,
            finished_at: None,
        };

        if let Some(session) = state.sessions.iter_mut().find(|s| s.id == session_id) {
            session.last_attempt_id = Some(attempt.id);
        }
        state.attempts.push(attempt.clone());
        state.tasks.extend(tasks.iter().map(|t| StoredTask {
            id: t.id,
            attempt_id: attempt.id,
            parent_id: t.parent_id,
            upstream_ids: t.upstream_ids.clone(),
            path: t.path.clone(),
            is_group: t.is_group,
            task_type: t.task_type.clone(),
            config: t.config.clone(),
            state: t.state,
            state_params: StateParams::new(),
            store_params: serde_json::Value::Object(Default::default()),
            error: None,
            retry_count: 0,
            retry_limit: t.retry_limit,
            retry_at: None,
            updated_at: now,
        }));

        Ok(attempt)
    }

    async fn get_attempt(&self, id: &Uuid) -> Result<Option<StoredSessionAttempt>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.attempts.iter().find(|a| a.id == *id).cloned())
    }

    async fn find_session(
        &self,
        repository_id: &Uuid,
        workflow_name: &str,
        session_time: DateTime<Utc>,
    ) -> Result<Option<StoredSession>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .sessions
            .iter()
            .find(|s| {
                s.repository_id == *repository_id
                    && s.workflow_name == workflow_name
                    && s.session_time == session_time
            })
            .cloned())
    }

    async fn list_session_attempts(
        &self,
        session_id: &Uuid,
    ) -> Result<Vec<StoredSessionAttempt>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .attempts
            .iter()
            .filter(|a| a.session_id == *session_id)
            .cloned()
            .collect())
    }

    async fn list_running_attempts(&self) -> Result<Vec<StoredSessionAttempt>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .attempts
            .iter()
            .filter(|a| !a.status.is_done())
            .cloned()
            .collect())
    }

    async fn finish_attempt(
        &self,
        attempt_id: &Uuid,
        status: AttemptStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().await;
        match state.attempts.iter_mut().find(|a| a.id == *attempt_id) {
            Some(attempt) if !attempt.status.is_done() => {
                attempt.status = status;
                attempt.finished_at = Some(now);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound(format!("attempt {attempt_id}"))),
        }
    }

    async fn list_tasks(&self, attempt_id: &Uuid) -> Result<Vec<StoredTask>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.attempt_id == *attempt_id)
            .cloned()
            .collect())
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<StoredTask>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.tasks.iter().find(|t| t.id == *id).cloned())
    }

    async fn lock_task_for_run(
        &self,
        task_id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<StoredTask>, RepositoryError> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.iter_mut().find(|t| t.id == *task_id) else {
            return Err(RepositoryError::NotFound(format!("task {task_id}")));
        };
        let dispatchable = match task.state {
            TaskState::Ready => true,
            TaskState::RetryWaiting => task.retry_at.is_none_or(|at| at <= now),
            _ => false,
        };
        if !dispatchable {
            return Ok(None);
        }
        task.state = TaskState::Running;
        task.retry_at = None;
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn update_task(
        &self,
        task_id: &Uuid,
        expected: TaskState,
        update: &TaskUpdate,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.iter_mut().find(|t| t.id == *task_id) else {
            return Err(RepositoryError::NotFound(format!("task {task_id}")));
        };
        if task.state != expected {
            return Ok(false);
        }
        task.state = update.state;
        if let Some(params) = &update.state_params {
            task.state_params = params.clone();
        }
        if let Some(params) = &update.store_params {
            task.store_params = params.clone();
        }
        if let Some(error) = &update.error {
            task.error = Some(error.clone());
        }
        if let Some(count) = update.retry_count {
            task.retry_count = count;
        }
        task.retry_at = update.retry_at;
        task.updated_at = now;
        Ok(true)
    }

    async fn cancel_attempt_tasks(
        &self,
        attempt_id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for task in state
            .tasks
            .iter_mut()
            .filter(|t| t.attempt_id == *attempt_id && !t.state.is_terminal())
        {
            task.state = TaskState::Canceled;
            task.retry_at = None;
            task.updated_at = now;
            count += 1;
        }
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
