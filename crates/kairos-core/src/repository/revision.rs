//! Revision store trait definition.
//!
//! Defines the storage interface for repositories, revisions, stored workflow
//! definitions and schedules. Publishing is a single transactional operation
//! serialized per repository by the backing store.

use chrono::{DateTime, Utc};
use kairos_types::error::RepositoryError;
use kairos_types::workflow::{
    NewRevision, NewSchedule, NewWorkflowDefinition, RepositoryMode, ScheduleTime,
    StoredRepository, StoredRevision, StoredSchedule, StoredWorkflowDefinition,
};
use uuid::Uuid;

/// Result of a successful publish.
#[derive(Debug, Clone)]
pub struct PublishedRevision {
    pub repository: StoredRepository,
    pub revision: StoredRevision,
    pub workflows: Vec<StoredWorkflowDefinition>,
}

impl PublishedRevision {
    pub fn find_workflow(&self, name: &str) -> Option<&StoredWorkflowDefinition> {
        self.workflows.iter().find(|w| w.name == name)
    }
}

/// Store trait for versioned workflow definitions.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RevisionStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Publish
    // -----------------------------------------------------------------------

    /// Store a revision and its workflow definitions under the repository lock.
    ///
    /// Two publishes to the same repository are strictly serialized: the
    /// second observes the first's committed sequence number. The revision
    /// gets `max(seq) + 1` atomically with the insert.
    ///
    /// - `RepositoryMode::CreateIfAbsent` creates the repository on first use;
    ///   `MustExist` fails with `RepositoryError::NotFound` instead.
    /// - A revision name already present in the repository fails with
    ///   `RepositoryError::Conflict`.
    /// - `schedules: Some(..)` replaces the repository's schedules: listed
    ///   workflows are upserted (an unchanged spec keeps its next time),
    ///   others are removed. `None` leaves schedules untouched.
    fn publish(
        &self,
        repository_name: &str,
        mode: RepositoryMode,
        revision: &NewRevision,
        workflows: &[NewWorkflowDefinition],
        schedules: Option<&[NewSchedule]>,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<PublishedRevision, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    fn get_repository_by_name(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<StoredRepository>, RepositoryError>> + Send;

    fn get_revision(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<StoredRevision>, RepositoryError>> + Send;

    fn get_revision_by_name(
        &self,
        repository_id: &Uuid,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<StoredRevision>, RepositoryError>> + Send;

    /// The revision with the highest sequence number in a repository.
    fn get_latest_revision(
        &self,
        repository_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<StoredRevision>, RepositoryError>> + Send;

    /// Workflow definitions of a revision, ordered by name.
    fn list_workflow_definitions(
        &self,
        revision_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StoredWorkflowDefinition>, RepositoryError>> + Send;

    fn get_workflow_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<StoredWorkflowDefinition>, RepositoryError>> + Send;

    fn find_workflow_definition(
        &self,
        revision_id: &Uuid,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<StoredWorkflowDefinition>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Schedules
    // -----------------------------------------------------------------------

    fn list_schedules(
        &self,
        repository_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StoredSchedule>, RepositoryError>> + Send;

    /// Schedules whose `next.run_time <= now`, oldest first.
    fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<StoredSchedule>, RepositoryError>> + Send;

    /// Compare-and-set the next schedule time.
    ///
    /// Returns `false` when the stored `next.run_time` no longer equals
    /// `expected_run_time` (another executor already advanced it).
    fn advance_schedule(
        &self,
        schedule_id: &Uuid,
        expected_run_time: DateTime<Utc>,
        next: ScheduleTime,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Delete a schedule that has no further sessions.
    ///
    /// Same compare-and-set as `advance_schedule`. Returns `false` when the
    /// schedule is gone or its `next.run_time` moved past `expected_run_time`.
    fn remove_schedule(
        &self,
        schedule_id: &Uuid,
        expected_run_time: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
