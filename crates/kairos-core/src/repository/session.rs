//! Session store trait definition.
//!
//! Defines the storage interface for sessions, attempts and tasks. Every
//! task transition is a compare-and-set on the task's current state so that
//! several executor processes can share one store.

use chrono::{DateTime, Utc};
use kairos_types::error::RepositoryError;
use kairos_types::session::{
    AttemptRequest, AttemptStatus, NewTask, StoredSession, StoredSessionAttempt, StoredTask,
    TaskState, TaskUpdate,
};
use uuid::Uuid;

/// Store trait for sessions, attempts and tasks.
pub trait SessionStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Attempts
    // -----------------------------------------------------------------------

    /// Create an attempt and its tasks in one transaction, recording the
    /// submitting `site_id` on the attempt.
    ///
    /// The session is keyed by `(repository, workflow name, session time)`
    /// and created on first use. If it already exists:
    /// - without `retry_attempt_name`, fails with
    ///   `RepositoryError::SessionAttemptConflict`;
    /// - with a name, fails with `RepositoryError::Conflict` if that name is
    ///   taken or another attempt of the session is still running; otherwise
    ///   a new attempt is added to the session.
    fn create_attempt(
        &self,
        site_id: i32,
        request: &AttemptRequest,
        tasks: &[NewTask],
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<StoredSessionAttempt, RepositoryError>> + Send;

    fn get_attempt(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<StoredSessionAttempt>, RepositoryError>> + Send;

    fn find_session(
        &self,
        repository_id: &Uuid,
        workflow_name: &str,
        session_time: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Option<StoredSession>, RepositoryError>> + Send;

    /// Attempts of a session, oldest first.
    fn list_session_attempts(
        &self,
        session_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StoredSessionAttempt>, RepositoryError>> + Send;

    fn list_running_attempts(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<StoredSessionAttempt>, RepositoryError>> + Send;

    /// Move a running attempt to a terminal status. `false` if already done.
    fn finish_attempt(
        &self,
        attempt_id: &Uuid,
        status: AttemptStatus,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Tasks of an attempt in expansion (pre-)order; the root comes first.
    fn list_tasks(
        &self,
        attempt_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StoredTask>, RepositoryError>> + Send;

    fn get_task(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<StoredTask>, RepositoryError>> + Send;

    /// Claim a task for execution.
    ///
    /// Atomically moves a `Ready` task, or a `RetryWaiting` task whose
    /// `retry_at <= now`, to `Running` and returns it. Returns `None` when
    /// another dispatcher won the race or the task is not dispatchable.
    fn lock_task_for_run(
        &self,
        task_id: &Uuid,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Option<StoredTask>, RepositoryError>> + Send;

    /// Apply `update` if the task is still in `expected` state.
    fn update_task(
        &self,
        task_id: &Uuid,
        expected: TaskState,
        update: &TaskUpdate,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Mark every non-terminal task of an attempt `Canceled`. Returns the count.
    fn cancel_attempt_tasks(
        &self,
        attempt_id: &Uuid,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
