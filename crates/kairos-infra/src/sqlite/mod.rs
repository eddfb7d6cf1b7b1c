//! SQLite storage layer.
//!
//! Store implementations backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod pool;
pub mod revision;
pub mod session;

use chrono::{DateTime, Utc};
use kairos_types::error::RepositoryError;
use sqlx::{Sqlite, Transaction};
use uuid::Uuid;

use self::pool::DatabasePool;

/// Both SQLite stores over one pool.
///
/// Implements `RevisionStore` and `SessionStore` so it can back a
/// `LocalSite` the same way `MemoryStore` does.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DatabasePool,
}

impl SqliteStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Open (and migrate) the database at `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, RepositoryError> {
        let pool = DatabasePool::new(database_url).await.map_err(|e| {
            tracing::error!(error = %e, "failed to open database");
            RepositoryError::Connection
        })?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// Writer transaction holding the database write lock from its first
    /// statement.
    ///
    /// Writers in other processes wait on the busy timeout for it. A deferred
    /// `BEGIN` would read first and fail with `SQLITE_BUSY` on the upgrade.
    pub(crate) async fn begin_immediate(
        &self,
    ) -> Result<Transaction<'static, Sqlite>, RepositoryError> {
        self.pool
            .writer
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(query_error)
    }
}

// ---------------------------------------------------------------------------
// Helpers shared by the store impls
// ---------------------------------------------------------------------------

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

pub(crate) fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::load_project;
    use chrono::TimeZone;
    use kairos_core::repository::revision::RevisionStore;
    use kairos_core::repository::session::SessionStore;
    use kairos_core::site::{FixedSessionTime, LOCAL_REPOSITORY, LocalSite};
    use kairos_core::workflow::registry::OperatorRegistry;
    use kairos_core::workflow::schedule_executor::ScheduleExecutor;
    use kairos_core::workflow::task_match::TaskMatchPattern;
    use kairos_types::config::{ScheduleExecutorConfig, SiteConfig};
    use kairos_types::session::{AttemptStatus, TaskState};
    use std::sync::Arc;

    const DAILY_JOB: &str = r#"
tasks:
  - name: extract
    type: echo
    config:
      message: extracting
  - name: load
    type: noop
    depends_on: [extract]
"#;

    const HOURLY_JOB: &str = r#"
schedule:
  cron: hourly
tasks:
  - name: ping
    type: noop
"#;

    fn jan_first(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap()
    }

    async fn site_in(dir: &tempfile::TempDir) -> LocalSite<SqliteStore> {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("kairos.db").display());
        let store = SqliteStore::connect(&url).await.unwrap();
        let mut config = SiteConfig::default();
        config.executor.idle_poll_interval_ms = 20;
        LocalSite::new(store, OperatorRegistry::with_builtins(), &config)
    }

    #[test]
    fn test_datetime_format_is_fixed_width() {
        let a = format_datetime(&jan_first(0));
        let b = format_datetime(&(jan_first(0) + chrono::TimeDelta::nanoseconds(1500)));
        assert_eq!(a, "2024-01-01T00:00:00.000000000Z");
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_datetime(&b).unwrap(), jan_first(0) + chrono::TimeDelta::nanoseconds(1500));
    }

    #[tokio::test]
    async fn test_local_project_runs_to_success() {
        let project = tempfile::tempdir().unwrap();
        tokio::fs::write(project.path().join("daily_job.kairos.yml"), DAILY_JOB)
            .await
            .unwrap();
        let archive = load_project(project.path(), "UTC").await.unwrap();

        let data = tempfile::tempdir().unwrap();
        let site = site_in(&data).await;
        let pattern = TaskMatchPattern::parse("daily_job").unwrap();
        let supplier = FixedSessionTime(jan_first(0));

        let attempt = site
            .store_and_start_local_workflows(&archive, &pattern, &Default::default(), &supplier)
            .await
            .unwrap();
        assert_eq!(site.run().await.unwrap(), vec![attempt.id]);

        let stored = site.store().get_attempt(&attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::Success);
        let tasks = site.store().list_tasks(&attempt.id).await.unwrap();
        assert!(tasks.iter().all(|t| t.state == TaskState::Success));
        let extract = tasks.iter().find(|t| t.path == "extract").unwrap();
        assert_eq!(extract.store_params["message"], "extracting");

        let err = site
            .store_and_start_local_workflows(&archive, &pattern, &Default::default(), &supplier)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "session_attempt_conflict");

        // The second start reused the digest-named revision.
        let repo = site
            .store()
            .get_repository_by_name(LOCAL_REPOSITORY)
            .await
            .unwrap()
            .unwrap();
        let latest = site.store().get_latest_revision(&repo.id).await.unwrap().unwrap();
        assert_eq!(latest.seq, 1);
        assert_eq!(latest.archive_digest, archive.digest);
    }

    #[tokio::test]
    async fn test_failed_task_fails_attempt() {
        let data = tempfile::tempdir().unwrap();
        let site = site_in(&data).await;
        let archive = kairos_types::workflow::ArchiveMetadata {
            archive_type: "inline".to_string(),
            digest: "feedfacefeedface".to_string(),
            default_time_zone: "UTC".to_string(),
            workflows: vec![kairos_types::workflow::WorkflowSource {
                name: "broken".to_string(),
                config: serde_json::json!({"tasks": [
                    {"name": "boom", "type": "fail", "config": {"message": "nope"}},
                    {"name": "after", "type": "noop", "depends_on": ["boom"]},
                ]}),
            }],
        };
        let attempt = site
            .store_and_start_local_workflows(
                &archive,
                &TaskMatchPattern::parse("broken").unwrap(),
                &Default::default(),
                &FixedSessionTime(jan_first(0)),
            )
            .await
            .unwrap();
        site.run().await.unwrap();

        let stored = site.store().get_attempt(&attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::Error);
        let tasks = site.store().list_tasks(&attempt.id).await.unwrap();
        let boom = tasks.iter().find(|t| t.path == "boom").unwrap();
        assert_eq!(boom.state, TaskState::Error);
        assert_eq!(boom.error.as_ref().unwrap()["message"], "nope");
        let after = tasks.iter().find(|t| t.path == "after").unwrap();
        assert_eq!(after.state, TaskState::Canceled);
    }

    #[tokio::test]
    async fn test_schedule_executor_over_sqlite() {
        let project = tempfile::tempdir().unwrap();
        tokio::fs::write(project.path().join("hourly_job.kairos.yml"), HOURLY_JOB)
            .await
            .unwrap();
        let archive = load_project(project.path(), "UTC").await.unwrap();

        let data = tempfile::tempdir().unwrap();
        let site = site_in(&data).await;
        site.store_workflows("v1", &archive, jan_first(0)).await.unwrap();

        let schedules = ScheduleExecutor::new(
            site.store().clone(),
            Arc::clone(site.executor()),
            ScheduleExecutorConfig::default(),
        );
        let fired = schedules.tick(jan_first(0)).await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].session_time, jan_first(0));
        assert!(schedules.tick(jan_first(0)).await.unwrap().is_empty());

        let next = schedules.tick(jan_first(1)).await.unwrap();
        assert_eq!(next[0].session_time, jan_first(1));

        let mut finished = site.run().await.unwrap();
        finished.sort();
        let mut expected = vec![fired[0].id, next[0].id];
        expected.sort();
        assert_eq!(finished, expected);
        let stored = site.store().get_attempt(&fired[0].id).await.unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::Success);
    }
}
