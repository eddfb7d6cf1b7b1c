//! Background loop firing stored schedules.
//!
//! Each tick lists schedules whose `next.run_time` has passed, submits an
//! attempt for the scheduled session time, then advances the schedule with a
//! compare-and-set on the run time it observed. A session that another
//! executor already submitted surfaces as a session conflict and only the
//! advance is performed, so concurrent schedule executors never double-fire.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kairos_types::config::ScheduleExecutorConfig;
use kairos_types::error::RepositoryError;
use kairos_types::session::{DEFAULT_SITE_ID, StoredSessionAttempt};
use kairos_types::workflow::StoredSchedule;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::revision::RevisionStore;
use crate::repository::session::SessionStore;

use super::attempt::AttemptBuilder;
use super::compiler::{CompileError, compile};
use super::executor::{ExecutorError, WorkflowExecutor};
use super::scheduler::next_schedule_time;

pub struct ScheduleExecutor<R: RevisionStore, S: SessionStore> {
    revisions: R,
    executor: Arc<WorkflowExecutor<S>>,
    config: ScheduleExecutorConfig,
    site_id: i32,
}

impl<R: RevisionStore, S: SessionStore> ScheduleExecutor<R, S> {
    pub fn new(
        revisions: R,
        executor: Arc<WorkflowExecutor<S>>,
        config: ScheduleExecutorConfig,
    ) -> Self {
        Self {
            revisions,
            executor,
            config,
            site_id: DEFAULT_SITE_ID,
        }
    }

    /// Submit fired sessions on behalf of `site_id` instead of the default site.
    pub fn with_site_id(mut self, site_id: i32) -> Self {
        self.site_id = site_id;
        self
    }

    /// Fire every schedule due at `now`. Returns the attempts created.
    ///
    /// Failures of individual schedules are logged and skipped; only a
    /// failure to list due schedules is returned.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<StoredSessionAttempt>, RepositoryError> {
        let due = self
            .revisions
            .list_due_schedules(now, self.config.batch_size)
            .await?;

        let mut fired = Vec::new();
        for schedule in due {
            match self.fire(&schedule, now).await {
                Ok(Some(attempt)) => fired.push(attempt),
                Ok(None) => {}
                Err(e) => tracing::error!(
                    schedule_id = %schedule.id,
                    workflow = schedule.workflow_name.as_str(),
                    error = %e,
                    kind = e.kind(),
                    "failed to fire schedule"
                ),
            }
        }
        Ok(fired)
    }

    async fn fire(
        &self,
        schedule: &StoredSchedule,
        now: DateTime<Utc>,
    ) -> Result<Option<StoredSessionAttempt>, ScheduleFireError> {
        let next = match next_schedule_time(&schedule.spec, schedule.next.session_time) {
            Ok(next) => Some(next),
            Err(e) => {
                tracing::warn!(
                    schedule_id = %schedule.id,
                    workflow = schedule.workflow_name.as_str(),
                    error = %e,
                    kind = e.kind(),
                    "schedule has no further sessions"
                );
                None
            }
        };

        let attempt = match self.submit(schedule).await {
            Ok(attempt) => Some(attempt),
            Err(ScheduleFireError::Executor(ExecutorError::Repository(
                RepositoryError::SessionAttemptConflict { .. },
            ))) => {
                tracing::debug!(
                    workflow = schedule.workflow_name.as_str(),
                    session_time = %schedule.next.session_time,
                    "scheduled session already submitted"
                );
                None
            }
            Err(e) => return Err(e),
        };

        let Some(next) = next else {
            if self
                .revisions
                .remove_schedule(&schedule.id, schedule.next.run_time)
                .await?
            {
                tracing::info!(
                    schedule_id = %schedule.id,
                    workflow = schedule.workflow_name.as_str(),
                    "exhausted schedule removed"
                );
            }
            return Ok(attempt);
        };

        let advanced = self
            .revisions
            .advance_schedule(&schedule.id, schedule.next.run_time, next, now)
            .await?;
        if !advanced {
            tracing::debug!(schedule_id = %schedule.id, "schedule already advanced");
        }
        if let Some(attempt) = &attempt {
            tracing::info!(
                attempt_id = %attempt.id,
                workflow = schedule.workflow_name.as_str(),
                session_time = %schedule.next.session_time,
                next_session_time = %next.session_time,
                "schedule fired"
            );
        }
        Ok(attempt)
    }

    async fn submit(&self, schedule: &StoredSchedule) -> Result<StoredSessionAttempt, ScheduleFireError> {
        let definition = self
            .revisions
            .get_workflow_definition(&schedule.workflow_definition_id)
            .await?
            .ok_or(ScheduleFireError::MissingDefinition(schedule.workflow_definition_id))?;
        let revision = self
            .revisions
            .get_revision(&definition.revision_id)
            .await?
            .ok_or(ScheduleFireError::MissingDefinition(definition.id))?;
        let workflow = compile(&definition.name, &definition.config)?;

        let request = AttemptBuilder::build(
            None,
            &revision,
            &definition,
            &workflow,
            &Default::default(),
            schedule.next.session_time,
        );
        Ok(self
            .executor
            .submit_workflow(self.site_id, &request, &workflow)
            .await?)
    }

    /// Tick every `poll_interval_secs` until `cancel` fires.
    pub async fn run_forever(&self, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
        tracing::info!(poll_interval_secs = interval.as_secs(), "schedule executor started");
        loop {
            if let Err(e) = self.tick(Utc::now()).await {
                tracing::error!(error = %e, "schedule tick failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!("schedule executor stopped");
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ScheduleFireError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("stored workflow definition {0} is missing")]
    MissingDefinition(Uuid),
}

impl ScheduleFireError {
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleFireError::Repository(e) => e.kind(),
            ScheduleFireError::Compile(e) => e.kind(),
            ScheduleFireError::Executor(e) => e.kind(),
            ScheduleFireError::MissingDefinition(_) => "resource_not_found",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryStore;
    use crate::workflow::registry::OperatorRegistry;
    use crate::workflow::scheduler::{first_schedule_time, schedule_spec};
    use chrono::TimeZone;
    use kairos_types::config::{ExecutorConfig, RetryConfig};
    use kairos_types::workflow::{
        NewRevision, NewSchedule, NewWorkflowDefinition, RepositoryMode, ScheduleConfig,
        ScheduleSpec, ScheduleTime,
    };
    use serde_json::json;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap()
    }

    async fn setup() -> (MemoryStore, ScheduleExecutor<MemoryStore, MemoryStore>) {
        let store = MemoryStore::new();
        let spec = schedule_spec(
            &ScheduleConfig {
                cron: "hourly".to_string(),
                timezone: None,
                delay_secs: 0,
            },
            "UTC",
        )
        .unwrap();
        let schedules = vec![NewSchedule {
            workflow_name: "hourly_job".to_string(),
            next: first_schedule_time(&spec, at(0)).unwrap(),
            spec,
        }];
        store
            .publish(
                "default",
                RepositoryMode::CreateIfAbsent,
                &NewRevision {
                    name: "r1".to_string(),
                    archive_type: "inline".to_string(),
                    archive_digest: "d".to_string(),
                    default_time_zone: "UTC".to_string(),
                },
                &[NewWorkflowDefinition {
                    name: "hourly_job".to_string(),
                    config: json!({"tasks": [{"name": "a", "type": "noop"}]}),
                    time_zone: "UTC".to_string(),
                }],
                Some(&schedules),
                at(0),
            )
            .await
            .unwrap();

        let executor = Arc::new(WorkflowExecutor::new(
            store.clone(),
            OperatorRegistry::with_builtins(),
            ExecutorConfig::default(),
            RetryConfig::default(),
        ));
        let schedule_executor =
            ScheduleExecutor::new(store.clone(), executor, ScheduleExecutorConfig::default());
        (store, schedule_executor)
    }

    #[tokio::test]
    async fn test_tick_fires_due_schedule_once() {
        let (store, schedules) = setup().await;

        let fired = schedules.tick(at(0)).await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].session_time, at(0));
        assert_eq!(fired[0].workflow_name, "hourly_job");

        assert!(schedules.tick(at(0)).await.unwrap().is_empty());

        let repo = store.get_repository_by_name("default").await.unwrap().unwrap();
        let stored = store.list_schedules(&repo.id).await.unwrap();
        assert_eq!(stored[0].next.session_time, at(1));
    }

    #[tokio::test]
    async fn test_fired_attempts_carry_site_id() {
        let (_store, schedules) = setup().await;
        let fired = schedules.tick(at(0)).await.unwrap();
        assert_eq!(fired[0].site_id, DEFAULT_SITE_ID);

        let schedules = schedules.with_site_id(5);
        let fired = schedules.tick(at(1)).await.unwrap();
        assert_eq!(fired[0].site_id, 5);
    }

    #[tokio::test]
    async fn test_tick_catches_up_one_session_per_tick() {
        let (_store, schedules) = setup().await;
        let first = schedules.tick(at(2)).await.unwrap();
        let second = schedules.tick(at(2)).await.unwrap();
        assert_eq!(first[0].session_time, at(0));
        assert_eq!(second[0].session_time, at(1));
    }

    #[tokio::test]
    async fn test_tick_skips_already_submitted_session() {
        let (store, schedules) = setup().await;
        let other = ScheduleExecutor::new(
            store.clone(),
            Arc::clone(&schedules.executor),
            ScheduleExecutorConfig::default(),
        );

        // Another executor listed the same due schedule before this one advanced it.
        let due = store.list_due_schedules(at(0), 10).await.unwrap();
        assert_eq!(schedules.tick(at(0)).await.unwrap().len(), 1);
        let again = other.fire(&due[0], at(0)).await.unwrap();
        assert!(again.is_none());

        let session = store
            .find_session(&due[0].repository_id, "hourly_job", at(0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.list_session_attempts(&session.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_schedule_without_next_session_fires_once_then_is_removed() {
        let (store, schedules) = setup().await;
        let stranded = vec![NewSchedule {
            workflow_name: "hourly_job".to_string(),
            spec: ScheduleSpec {
                cron: "0 0 * * * *".to_string(),
                time_zone: "Mars/Olympus".to_string(),
                delay_secs: 0,
            },
            next: ScheduleTime {
                session_time: at(3),
                run_time: at(3),
            },
        }];
        let published = store
            .publish(
                "default",
                RepositoryMode::MustExist,
                &NewRevision {
                    name: "r2".to_string(),
                    archive_type: "inline".to_string(),
                    archive_digest: "d2".to_string(),
                    default_time_zone: "UTC".to_string(),
                },
                &[NewWorkflowDefinition {
                    name: "hourly_job".to_string(),
                    config: json!({"tasks": [{"name": "a", "type": "noop"}]}),
                    time_zone: "UTC".to_string(),
                }],
                Some(&stranded),
                at(0),
            )
            .await
            .unwrap();
        let repo_id = published.repository.id;
        assert_eq!(store.list_schedules(&repo_id).await.unwrap()[0].spec.time_zone, "Mars/Olympus");

        let fired = schedules.tick(at(3)).await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].session_time, at(3));
        assert!(store.list_schedules(&repo_id).await.unwrap().is_empty());
        assert!(schedules.tick(at(10)).await.unwrap().is_empty());
    }
}
