//! SQLite session store implementation.
//!
//! Implements `SessionStore` from `kairos-core`. Task transitions are
//! conditional `UPDATE ... WHERE state = ?` statements, so several executor
//! processes sharing one database file never apply two transitions from the
//! same state.

use chrono::{DateTime, Utc};
use kairos_core::repository::session::SessionStore;
use kairos_types::error::RepositoryError;
use kairos_types::session::{
    AttemptRequest, AttemptStatus, NewTask, StateParams, StoredSession, StoredSessionAttempt,
    StoredTask, TaskState, TaskUpdate,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use super::{
    SqliteStore, format_datetime, is_unique_violation, parse_datetime, parse_uuid, query_error,
};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

struct SessionRow {
    id: String,
    repository_id: String,
    workflow_name: String,
    session_time: String,
    last_attempt_id: Option<String>,
    created_at: String,
}

impl SessionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            repository_id: row.try_get("repository_id")?,
            workflow_name: row.try_get("workflow_name")?,
            session_time: row.try_get("session_time")?,
            last_attempt_id: row.try_get("last_attempt_id")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_session(self) -> Result<StoredSession, RepositoryError> {
        Ok(StoredSession {
            id: parse_uuid(&self.id)?,
            repository_id: parse_uuid(&self.repository_id)?,
            workflow_name: self.workflow_name,
            session_time: parse_datetime(&self.session_time)?,
            last_attempt_id: self.last_attempt_id.as_deref().map(parse_uuid).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct AttemptRow {
    id: String,
    site_id: i32,
    session_id: String,
    repository_id: String,
    workflow_name: String,
    session_time: String,
    attempt_name: Option<String>,
    revision_id: String,
    workflow_definition_id: String,
    time_zone: String,
    params: String,
    parent_attempt_id: Option<String>,
    status: String,
    created_at: String,
    finished_at: Option<String>,
}

impl AttemptRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            site_id: row.try_get("site_id")?,
            session_id: row.try_get("session_id")?,
            repository_id: row.try_get("repository_id")?,
            workflow_name: row.try_get("workflow_name")?,
            session_time: row.try_get("session_time")?,
            attempt_name: row.try_get("attempt_name")?,
            revision_id: row.try_get("revision_id")?,
            workflow_definition_id: row.try_get("workflow_definition_id")?,
            time_zone: row.try_get("time_zone")?,
            params: row.try_get("params")?,
            parent_attempt_id: row.try_get("parent_attempt_id")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_attempt(self) -> Result<StoredSessionAttempt, RepositoryError> {
        let params = serde_json::from_str(&self.params)
            .map_err(|e| RepositoryError::Query(format!("invalid attempt params: {e}")))?;
        Ok(StoredSessionAttempt {
            id: parse_uuid(&self.id)?,
            site_id: self.site_id,
            session_id: parse_uuid(&self.session_id)?,
            repository_id: parse_uuid(&self.repository_id)?,
            workflow_name: self.workflow_name,
            session_time: parse_datetime(&self.session_time)?,
            attempt_name: self.attempt_name,
            revision_id: parse_uuid(&self.revision_id)?,
            workflow_definition_id: parse_uuid(&self.workflow_definition_id)?,
            time_zone: self.time_zone,
            params,
            parent_attempt_id: self.parent_attempt_id.as_deref().map(parse_uuid).transpose()?,
            status: enum_from_str(&self.status, "attempt status")?,
            created_at: parse_datetime(&self.created_at)?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct TaskRow {
    id: String,
    attempt_id: String,
    parent_id: Option<String>,
    upstream_ids: String,
    path: String,
    is_group: bool,
    task_type: Option<String>,
    config: String,
    state: String,
    state_params: String,
    store_params: String,
    error: Option<String>,
    retry_count: i64,
    retry_limit: i64,
    retry_at: Option<String>,
    updated_at: String,
}

impl TaskRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            attempt_id: row.try_get("attempt_id")?,
            parent_id: row.try_get("parent_id")?,
            upstream_ids: row.try_get("upstream_ids")?,
            path: row.try_get("path")?,
            is_group: row.try_get("is_group")?,
            task_type: row.try_get("task_type")?,
            config: row.try_get("config")?,
            state: row.try_get("state")?,
            state_params: row.try_get("state_params")?,
            store_params: row.try_get("store_params")?,
            error: row.try_get("error")?,
            retry_count: row.try_get("retry_count")?,
            retry_limit: row.try_get("retry_limit")?,
            retry_at: row.try_get("retry_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_task(self) -> Result<StoredTask, RepositoryError> {
        let upstream_ids: Vec<Uuid> = serde_json::from_str(&self.upstream_ids)
            .map_err(|e| RepositoryError::Query(format!("invalid upstream ids: {e}")))?;
        let config = serde_json::from_str(&self.config)
            .map_err(|e| RepositoryError::Query(format!("invalid task config: {e}")))?;
        let state_params: StateParams = serde_json::from_str(&self.state_params)
            .map_err(|e| RepositoryError::Query(format!("invalid state params: {e}")))?;
        let store_params = serde_json::from_str(&self.store_params)
            .map_err(|e| RepositoryError::Query(format!("invalid store params: {e}")))?;
        let error = self
            .error
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid task error: {e}")))
            })
            .transpose()?;

        Ok(StoredTask {
            id: parse_uuid(&self.id)?,
            attempt_id: parse_uuid(&self.attempt_id)?,
            parent_id: self.parent_id.as_deref().map(parse_uuid).transpose()?,
            upstream_ids,
            path: self.path,
            is_group: self.is_group,
            task_type: self.task_type,
            config,
            state: enum_from_str(&self.state, "task state")?,
            state_params,
            store_params,
            error,
            retry_count: self.retry_count as u32,
            retry_limit: self.retry_limit as u32,
            retry_at: self.retry_at.as_deref().map(parse_datetime).transpose()?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

const ATTEMPT_COLUMNS: &str = "id, site_id, session_id, repository_id, workflow_name, session_time, attempt_name, revision_id, workflow_definition_id, time_zone, params, parent_attempt_id, status, created_at, finished_at";
const TASK_COLUMNS: &str = "id, attempt_id, parent_id, upstream_ids, path, is_group, task_type, config, state, state_params, store_params, error, retry_count, retry_limit, retry_at, updated_at";
const SESSION_COLUMNS: &str = "id, repository_id, workflow_name, session_time, last_attempt_id, created_at";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Snake-case tag of a unit enum (`TaskState`, `AttemptStatus`).
fn enum_to_str<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(RepositoryError::Query(format!("expected string tag, got {other}"))),
        Err(e) => Err(RepositoryError::Query(e.to_string())),
    }
}

fn enum_from_str<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {s}")))
}

fn to_json<T: Serialize>(value: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

fn rows_into_attempts(rows: &[SqliteRow]) -> Result<Vec<StoredSessionAttempt>, RepositoryError> {
    let mut attempts = Vec::with_capacity(rows.len());
    for row in rows {
        attempts.push(AttemptRow::from_row(row).map_err(query_error)?.into_attempt()?);
    }
    Ok(attempts)
}

impl SqliteStore {
    async fn task_exists(&self, task_id: &Uuid) -> Result<bool, RepositoryError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT id FROM tasks WHERE id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(row.is_some())
    }
}

// ---------------------------------------------------------------------------
// SessionStore impl
// ---------------------------------------------------------------------------

impl SessionStore for SqliteStore {
    async fn create_attempt(
        &self,
        site_id: i32,
        request: &AttemptRequest,
        tasks: &[NewTask],
        now: DateTime<Utc>,
    ) -> Result<StoredSessionAttempt, RepositoryError> {
        let session_time = format_datetime(&request.session_time);
        let conflict = || RepositoryError::SessionAttemptConflict {
            workflow: request.workflow_name.clone(),
            session_time: request.session_time,
        };

        let mut tx = self.begin_immediate().await?;

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM sessions WHERE repository_id = ? AND workflow_name = ? AND session_time = ?",
        )
        .bind(request.repository_id.to_string())
        .bind(&request.workflow_name)
        .bind(&session_time)
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_error)?;

        let session_id = match existing {
            Some((session_id,)) => {
                let Some(name) = &request.retry_attempt_name else {
                    return Err(conflict());
                };
                let rows = sqlx::query(&format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM session_attempts WHERE session_id = ?"
                ))
                .bind(&session_id)
                .fetch_all(&mut *tx)
                .await
                .map_err(query_error)?;
                for attempt in rows_into_attempts(&rows)? {
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
                parse_uuid(&session_id)?
            }
            None => {
                let session_id = Uuid::now_v7();
                let inserted = sqlx::query(
                    r#"INSERT INTO sessions (id, repository_id, workflow_name, session_time, created_at)
                       VALUES (?, ?, ?, ?, ?)"#,
                )
                .bind(session_id.to_string())
                .bind(request.repository_id.to_string())
                .bind(&request.workflow_name)
                .bind(&session_time)
                .bind(format_datetime(&now))
                .execute(&mut *tx)
                .await;
                match inserted {
                    Ok(_) => session_id,
                    Err(e) if is_unique_violation(&e) => return Err(conflict()),
                    Err(e) => return Err(query_error(e)),
                }
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

        sqlx::query(
            r#"INSERT INTO session_attempts
               (id, site_id, session_id, repository_id, workflow_name, session_time,
                attempt_name, revision_id, workflow_definition_id, time_zone, params,
                parent_attempt_id, status, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(attempt.id.to_string())
        .bind(attempt.site_id)
        .bind(session_id.to_string())
        .bind(attempt.repository_id.to_string())
        .bind(&attempt.workflow_name)
        .bind(&session_time)
        .bind(&attempt.attempt_name)
        .bind(attempt.revision_id.to_string())
        .bind(attempt.workflow_definition_id.to_string())
        .bind(&attempt.time_zone)
        .bind(to_json(&attempt.params, "attempt params")?)
        .bind(attempt.parent_attempt_id.map(|id| id.to_string()))
        .bind(enum_to_str(&attempt.status)?)
        .bind(format_datetime(&now))
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        sqlx::query("UPDATE sessions SET last_attempt_id = ? WHERE id = ?")
            .bind(attempt.id.to_string())
            .bind(session_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        let empty_state = to_json(&StateParams::new(), "state params")?;
        for (position, task) in tasks.iter().enumerate() {
            sqlx::query(
                r#"INSERT INTO tasks
                   (id, attempt_id, position, parent_id, upstream_ids, path, is_group, task_type,
                    config, state, state_params, store_params, retry_count, retry_limit, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, '{}', 0, ?, ?)"#,
            )
            .bind(task.id.to_string())
            .bind(attempt.id.to_string())
            .bind(position as i64)
            .bind(task.parent_id.map(|id| id.to_string()))
            .bind(to_json(&task.upstream_ids, "upstream ids")?)
            .bind(&task.path)
            .bind(task.is_group)
            .bind(&task.task_type)
            .bind(to_json(&task.config, "task config")?)
            .bind(task.state.as_str())
            .bind(&empty_state)
            .bind(i64::from(task.retry_limit))
            .bind(format_datetime(&now))
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        }

        tx.commit().await.map_err(query_error)?;
        Ok(attempt)
    }

    async fn get_attempt(&self, id: &Uuid) -> Result<Option<StoredSessionAttempt>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM session_attempts WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        row.map(|row| AttemptRow::from_row(&row).map_err(query_error)?.into_attempt())
            .transpose()
    }

    async fn find_session(
        &self,
        repository_id: &Uuid,
        workflow_name: &str,
        session_time: DateTime<Utc>,
    ) -> Result<Option<StoredSession>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE repository_id = ? AND workflow_name = ? AND session_time = ?"
        ))
        .bind(repository_id.to_string())
        .bind(workflow_name)
        .bind(format_datetime(&session_time))
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        row.map(|row| SessionRow::from_row(&row).map_err(query_error)?.into_session())
            .transpose()
    }

    async fn list_session_attempts(
        &self,
        session_id: &Uuid,
    ) -> Result<Vec<StoredSessionAttempt>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM session_attempts WHERE session_id = ? ORDER BY created_at ASC, id ASC"
        ))
        .bind(session_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows_into_attempts(&rows)
    }

    async fn list_running_attempts(&self) -> Result<Vec<StoredSessionAttempt>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM session_attempts WHERE status = 'running' ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows_into_attempts(&rows)
    }

    async fn finish_attempt(
        &self,
        attempt_id: &Uuid,
        status: AttemptStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE session_attempts SET status = ?, finished_at = ? WHERE id = ? AND status = 'running'",
        )
        .bind(enum_to_str(&status)?)
        .bind(format_datetime(&now))
        .bind(attempt_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM session_attempts WHERE id = ?")
            .bind(attempt_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_error)?;
        match exists {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound(format!("attempt {attempt_id}"))),
        }
    }

    async fn list_tasks(&self, attempt_id: &Uuid) -> Result<Vec<StoredTask>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE attempt_id = ? ORDER BY position ASC"
        ))
        .bind(attempt_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(TaskRow::from_row(row).map_err(query_error)?.into_task()?);
        }
        Ok(tasks)
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<StoredTask>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.map(|row| TaskRow::from_row(&row).map_err(query_error)?.into_task())
            .transpose()
    }

    async fn lock_task_for_run(
        &self,
        task_id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<StoredTask>, RepositoryError> {
        let now_str = format_datetime(&now);
        let row = sqlx::query(&format!(
            r#"UPDATE tasks SET state = 'running', retry_at = NULL, updated_at = ?
               WHERE id = ?
                 AND (state = 'ready'
                      OR (state = 'retry_waiting' AND (retry_at IS NULL OR retry_at <= ?)))
               RETURNING {TASK_COLUMNS}"#
        ))
        .bind(&now_str)
        .bind(task_id.to_string())
        .bind(&now_str)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => Ok(Some(TaskRow::from_row(&row).map_err(query_error)?.into_task()?)),
            None if self.task_exists(task_id).await? => Ok(None),
            None => Err(RepositoryError::NotFound(format!("task {task_id}"))),
        }
    }

    async fn update_task(
        &self,
        task_id: &Uuid,
        expected: TaskState,
        update: &TaskUpdate,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let state_params = update
            .state_params
            .as_ref()
            .map(|p| to_json(p, "state params"))
            .transpose()?;
        let store_params = update
            .store_params
            .as_ref()
            .map(|p| to_json(p, "store params"))
            .transpose()?;
        let error = update
            .error
            .as_ref()
            .map(|e| to_json(e, "task error"))
            .transpose()?;

        let result = sqlx::query(
            r#"UPDATE tasks SET
                 state = ?,
                 state_params = COALESCE(?, state_params),
                 store_params = COALESCE(?, store_params),
                 error = COALESCE(?, error),
                 retry_count = COALESCE(?, retry_count),
                 retry_at = ?,
                 updated_at = ?
               WHERE id = ? AND state = ?"#,
        )
        .bind(update.state.as_str())
        .bind(state_params)
        .bind(store_params)
        .bind(error)
        .bind(update.retry_count.map(i64::from))
        .bind(update.retry_at.as_ref().map(format_datetime))
        .bind(format_datetime(&now))
        .bind(task_id.to_string())
        .bind(expected.as_str())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() > 0 {
            tracing::debug!(task_id = %task_id, from = expected.as_str(), to = update.state.as_str(), "task updated");
            return Ok(true);
        }
        if self.task_exists(task_id).await? {
            Ok(false)
        } else {
            Err(RepositoryError::NotFound(format!("task {task_id}")))
        }
    }

    async fn cancel_attempt_tasks(
        &self,
        attempt_id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE tasks SET state = 'canceled', retry_at = NULL, updated_at = ?
               WHERE attempt_id = ? AND state NOT IN ('success', 'error', 'canceled')"#,
        )
        .bind(format_datetime(&now))
        .bind(attempt_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected())
    }
}
