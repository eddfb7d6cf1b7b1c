//! Local site: publishing archives and starting workflows in one process.
//!
//! Ties the pieces together in the order a submission flows through them:
//! compile every workflow of the archive, publish the revision, resolve the
//! task match pattern, pick the session time, build the attempt request and
//! hand it to the executor.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kairos_types::config::SiteConfig;
use kairos_types::error::RepositoryError;
use kairos_types::session::{DEFAULT_SITE_ID, StoredSessionAttempt};
use kairos_types::workflow::{
    ArchiveMetadata, NewRevision, NewSchedule, NewWorkflowDefinition, RepositoryMode, ScheduleSpec,
    ScheduleTime,
};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::repository::revision::{PublishedRevision, RevisionStore};
use crate::repository::session::SessionStore;
use crate::workflow::attempt::AttemptBuilder;
use crate::workflow::compiler::{CompileError, CompiledWorkflow, compile};
use crate::workflow::executor::{ExecutorError, WorkflowExecutor};
use crate::workflow::registry::OperatorRegistry;
use crate::workflow::scheduler::{
    SchedulerError, first_schedule_time, next_schedule_time, parse_time_zone, schedule_spec,
};
use crate::workflow::task_match::{TaskMatchError, TaskMatchPattern};

/// Repository that local runs publish into.
pub const LOCAL_REPOSITORY: &str = "default";

// ---------------------------------------------------------------------------
// Session time suppliers
// ---------------------------------------------------------------------------

/// Decides the session time of an ad-hoc submission.
///
/// Receives the workflow's schedule, if it has one, and its time zone.
pub trait SessionTimeSupplier: Send + Sync {
    fn session_time(
        &self,
        schedule: Option<&ScheduleSpec>,
        time_zone: &str,
    ) -> Result<ScheduleTime, SchedulerError>;
}

impl<F> SessionTimeSupplier for F
where
    F: Fn(Option<&ScheduleSpec>, &str) -> Result<ScheduleTime, SchedulerError> + Send + Sync,
{
    fn session_time(
        &self,
        schedule: Option<&ScheduleSpec>,
        time_zone: &str,
    ) -> Result<ScheduleTime, SchedulerError> {
        self(schedule, time_zone)
    }
}

/// Always the given instant, due immediately.
#[derive(Debug, Clone, Copy)]
pub struct FixedSessionTime(pub DateTime<Utc>);

impl SessionTimeSupplier for FixedSessionTime {
    fn session_time(
        &self,
        _schedule: Option<&ScheduleSpec>,
        _time_zone: &str,
    ) -> Result<ScheduleTime, SchedulerError> {
        Ok(ScheduleTime::at(self.0))
    }
}

/// The next scheduled session after `now`, or `now` for unscheduled workflows.
#[derive(Debug, Clone, Copy)]
pub struct NextScheduledTime(pub DateTime<Utc>);

impl SessionTimeSupplier for NextScheduledTime {
    fn session_time(
        &self,
        schedule: Option<&ScheduleSpec>,
        _time_zone: &str,
    ) -> Result<ScheduleTime, SchedulerError> {
        match schedule {
            Some(spec) => next_schedule_time(spec, self.0),
            None => Ok(ScheduleTime::at(self.0)),
        }
    }
}

// ---------------------------------------------------------------------------
// LocalSite
// ---------------------------------------------------------------------------

/// Revision stored from an archive, with its compiled workflows.
#[derive(Debug, Clone)]
pub struct StoredWorkflows {
    pub published: PublishedRevision,
    pub compiled: Vec<CompiledWorkflow>,
}

/// Embedded site over a single store.
pub struct LocalSite<S: RevisionStore + SessionStore + Clone> {
    store: S,
    executor: Arc<WorkflowExecutor<S>>,
}

impl<S: RevisionStore + SessionStore + Clone> LocalSite<S> {
    pub fn new(store: S, operators: OperatorRegistry, config: &SiteConfig) -> Self {
        let executor = WorkflowExecutor::new(
            store.clone(),
            operators,
            config.executor.clone(),
            config.retry,
        );
        Self {
            store,
            executor: Arc::new(executor),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn executor(&self) -> &Arc<WorkflowExecutor<S>> {
        &self.executor
    }

    /// Compile and publish an archive as `revision_name`, replacing schedules.
    pub async fn store_workflows(
        &self,
        revision_name: &str,
        archive: &ArchiveMetadata,
        now: DateTime<Utc>,
    ) -> Result<StoredWorkflows, SiteError> {
        let prepared = prepare(archive)?;

        let mut schedules = Vec::new();
        for (compiled, definition) in prepared.compiled.iter().zip(&prepared.definitions) {
            if let Some(schedule) = &compiled.schedule {
                let spec = schedule_spec(schedule, &definition.time_zone)?;
                schedules.push(NewSchedule {
                    workflow_name: compiled.name.clone(),
                    next: first_schedule_time(&spec, now)?,
                    spec,
                });
            }
        }

        let published = self
            .store
            .publish(
                LOCAL_REPOSITORY,
                RepositoryMode::CreateIfAbsent,
                &new_revision(revision_name, archive),
                &prepared.definitions,
                Some(&schedules),
                now,
            )
            .await?;

        tracing::info!(
            repository = LOCAL_REPOSITORY,
            revision = revision_name,
            seq = published.revision.seq,
            workflows = published.workflows.len(),
            schedules = schedules.len(),
            "revision stored"
        );
        Ok(StoredWorkflows {
            published,
            compiled: prepared.compiled,
        })
    }

    /// Publish an archive without touching schedules and start the workflow
    /// (or subtask) selected by `pattern`.
    ///
    /// The revision is named after the archive digest; starting the same
    /// archive again reuses the stored revision.
    pub async fn store_and_start_local_workflows(
        &self,
        archive: &ArchiveMetadata,
        pattern: &TaskMatchPattern,
        overrides: &Map<String, Value>,
        session_time: &dyn SessionTimeSupplier,
    ) -> Result<StoredSessionAttempt, SiteError> {
        let prepared = prepare(archive)?;
        let matched = pattern.resolve(&prepared.compiled)?;

        let revision_name = local_revision_name(&archive.digest);
        let published = self
            .publish_or_reuse(&revision_name, archive, &prepared.definitions)
            .await?;

        let workflow = matched.workflow;
        let definition = published
            .find_workflow(&workflow.name)
            .ok_or_else(|| TaskMatchError::NoMatch(pattern.to_string()))?;
        let spec = workflow
            .schedule
            .as_ref()
            .map(|s| schedule_spec(s, &definition.time_zone))
            .transpose()?;
        let time = session_time.session_time(spec.as_ref(), &definition.time_zone)?;

        let request = AttemptBuilder::build(
            None,
            &published.revision,
            definition,
            workflow,
            overrides,
            time.session_time,
        );

        let attempt = match matched.subtask {
            Some(index) => {
                let path = &workflow.tasks[index].path;
                self.executor
                    .submit_subworkflow(DEFAULT_SITE_ID, &request, workflow, path)
                    .await?
            }
            None => {
                self.executor
                    .submit_workflow(DEFAULT_SITE_ID, &request, workflow)
                    .await?
            }
        };
        Ok(attempt)
    }

    async fn publish_or_reuse(
        &self,
        revision_name: &str,
        archive: &ArchiveMetadata,
        definitions: &[NewWorkflowDefinition],
    ) -> Result<PublishedRevision, SiteError> {
        let result = self
            .store
            .publish(
                LOCAL_REPOSITORY,
                RepositoryMode::CreateIfAbsent,
                &new_revision(revision_name, archive),
                definitions,
                None,
                Utc::now(),
            )
            .await;

        match result {
            Ok(published) => Ok(published),
            Err(RepositoryError::Conflict(_)) => {
                let not_found = || {
                    RepositoryError::NotFound(format!(
                        "revision '{revision_name}' in repository '{LOCAL_REPOSITORY}'"
                    ))
                };
                let repository = self
                    .store
                    .get_repository_by_name(LOCAL_REPOSITORY)
                    .await?
                    .ok_or_else(not_found)?;
                let revision = self
                    .store
                    .get_revision_by_name(&repository.id, revision_name)
                    .await?
                    .ok_or_else(not_found)?;
                let workflows = self.store.list_workflow_definitions(&revision.id).await?;
                tracing::debug!(revision = revision_name, "reusing stored revision");
                Ok(PublishedRevision {
                    repository,
                    revision,
                    workflows,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run until every attempt finished.
    pub async fn run(&self) -> Result<Vec<Uuid>, SiteError> {
        Ok(self.executor.run().await?)
    }

    /// Run until at least one attempt finished.
    pub async fn run_until_any(&self) -> Result<Vec<Uuid>, SiteError> {
        Ok(self.executor.run_until_any().await?)
    }
}

// ---------------------------------------------------------------------------
// Archive preparation
// ---------------------------------------------------------------------------

struct Prepared {
    compiled: Vec<CompiledWorkflow>,
    definitions: Vec<NewWorkflowDefinition>,
}

/// Compile every workflow and resolve its time zone. Nothing is stored.
fn prepare(archive: &ArchiveMetadata) -> Result<Prepared, SiteError> {
    parse_time_zone(&archive.default_time_zone)?;

    let mut seen = HashSet::new();
    let mut compiled = Vec::with_capacity(archive.workflows.len());
    let mut definitions = Vec::with_capacity(archive.workflows.len());
    for source in &archive.workflows {
        if !seen.insert(source.name.as_str()) {
            return Err(SiteError::DuplicateWorkflow(source.name.clone()));
        }
        let workflow = compile(&source.name, &source.config)?;
        let time_zone = workflow
            .time_zone
            .clone()
            .unwrap_or_else(|| archive.default_time_zone.clone());
        parse_time_zone(&time_zone)?;

        definitions.push(NewWorkflowDefinition {
            name: source.name.clone(),
            config: source.config.clone(),
            time_zone,
        });
        compiled.push(workflow);
    }
    Ok(Prepared {
        compiled,
        definitions,
    })
}

fn new_revision(name: &str, archive: &ArchiveMetadata) -> NewRevision {
    NewRevision {
        name: name.to_string(),
        archive_type: archive.archive_type.clone(),
        archive_digest: archive.digest.clone(),
        default_time_zone: archive.default_time_zone.clone(),
    }
}

fn local_revision_name(digest: &str) -> String {
    let short: String = digest.chars().take(16).collect();
    format!("local-{short}")
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SiteError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    TaskMatch(#[from] TaskMatchError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("archive contains workflow '{0}' more than once")]
    DuplicateWorkflow(String),
}

impl SiteError {
    /// Stable, machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SiteError::Compile(e) => e.kind(),
            SiteError::TaskMatch(e) => e.kind(),
            SiteError::Scheduler(e) => e.kind(),
            SiteError::Repository(e) => e.kind(),
            SiteError::Executor(e) => e.kind(),
            SiteError::DuplicateWorkflow(_) => "compile",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryStore;
    use chrono::TimeZone;
    use kairos_types::session::{AttemptStatus, TaskState};
    use kairos_types::workflow::WorkflowSource;
    use serde_json::json;

    fn site() -> LocalSite<MemoryStore> {
        let mut config = SiteConfig::default();
        config.executor.idle_poll_interval_ms = 20;
        LocalSite::new(MemoryStore::new(), OperatorRegistry::with_builtins(), &config)
    }

    fn archive(workflows: Vec<(&str, Value)>) -> ArchiveMetadata {
        ArchiveMetadata {
            archive_type: "inline".to_string(),
            digest: "0123456789abcdef0123".to_string(),
            default_time_zone: "UTC".to_string(),
            workflows: workflows
                .into_iter()
                .map(|(name, config)| WorkflowSource {
                    name: name.to_string(),
                    config,
                })
                .collect(),
        }
    }

    fn daily_job() -> ArchiveMetadata {
        archive(vec![(
            "daily_job",
            json!({"tasks": [
                {"name": "extract", "type": "echo", "config": {"message": "extracting"}},
                {"name": "load", "type": "noop", "depends_on": ["extract"]},
            ]}),
        )])
    }

    fn jan_first() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_local_run_end_to_end() {
        let site = site();
        let archive = daily_job();
        let pattern = TaskMatchPattern::parse("daily_job").unwrap();
        let supplier = FixedSessionTime(jan_first());

        let attempt = site
            .store_and_start_local_workflows(&archive, &pattern, &Map::new(), &supplier)
            .await
            .unwrap();
        assert_eq!(attempt.session_time, jan_first());

        let finished = site.run().await.unwrap();
        assert_eq!(finished, vec![attempt.id]);

        let stored = site.executor().find_attempt(&attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::Success);
        let tasks = site.executor().list_tasks(&attempt.id).await.unwrap();
        assert_eq!(tasks[0].state, TaskState::Success);

        let repository = site
            .store()
            .get_repository_by_name(LOCAL_REPOSITORY)
            .await
            .unwrap()
            .unwrap();
        let session = site
            .store()
            .find_session(&repository.id, "daily_job", jan_first())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.workflow_name, "daily_job");
        assert_eq!(session.session_time, jan_first());
        assert_eq!(session.last_attempt_id, Some(attempt.id));

        let err = site
            .store_and_start_local_workflows(&archive, &pattern, &Map::new(), &supplier)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "session_attempt_conflict");

        let revision = site.store().get_latest_revision(&repository.id).await.unwrap().unwrap();
        assert_eq!(revision.seq, 1);
        assert_eq!(revision.name, "local-0123456789abcdef");
    }

    #[tokio::test]
    async fn test_start_subtask_with_overrides() {
        let site = site();
        let archive = archive(vec![(
            "etl",
            json!({
                "params": {"target": "staging"},
                "tasks": [
                    {"name": "extract", "type": "fail"},
                    {"name": "load", "depends_on": ["extract"], "tasks": [
                        {"name": "stage", "type": "noop"},
                    ]},
                ]
            }),
        )]);
        let pattern = TaskMatchPattern::parse("etl+stage").unwrap();
        let overrides = json!({"target": "prod"});
        let supplier =
            |_: Option<&ScheduleSpec>, _: &str| Ok::<_, SchedulerError>(ScheduleTime::at(jan_first()));

        let attempt = site
            .store_and_start_local_workflows(&archive, &pattern, overrides.as_object().unwrap(), &supplier)
            .await
            .unwrap();
        assert_eq!(attempt.params["target"], "prod");

        let tasks = site.executor().list_tasks(&attempt.id).await.unwrap();
        let paths: Vec<&str> = tasks.iter().map(|t| t.path.as_str()).collect();
        assert_eq!(paths, vec!["load.stage"]);

        site.run().await.unwrap();
        let stored = site.executor().find_attempt(&attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AttemptStatus::Success);
    }

    #[tokio::test]
    async fn test_pattern_errors_have_distinct_kinds() {
        let site = site();
        let supplier = FixedSessionTime(jan_first());

        let missing = TaskMatchPattern::parse("daily_job+nope").unwrap();
        let err = site
            .store_and_start_local_workflows(&daily_job(), &missing, &Map::new(), &supplier)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "no_match");

        let ambiguous = archive(vec![(
            "wf",
            json!({"tasks": [
                {"name": "a", "tasks": [{"name": "x", "type": "noop"}]},
                {"name": "b", "tasks": [{"name": "x", "type": "noop"}]},
            ]}),
        )]);
        let err = site
            .store_and_start_local_workflows(
                &ambiguous,
                &TaskMatchPattern::parse("wf+x").unwrap(),
                &Map::new(),
                &supplier,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "multiple_task_match");
    }

    #[tokio::test]
    async fn test_invalid_workflow_is_never_stored() {
        let site = site();
        let archive = archive(vec![
            ("good", json!({"tasks": [{"name": "a", "type": "noop"}]})),
            (
                "bad",
                json!({"tasks": [
                    {"name": "a", "type": "noop", "depends_on": ["b"]},
                    {"name": "b", "type": "noop", "depends_on": ["a"]},
                ]}),
            ),
        ]);
        let err = site.store_workflows("r1", &archive, jan_first()).await.unwrap_err();
        assert_eq!(err.kind(), "compile");
        assert!(
            site.store()
                .get_repository_by_name(LOCAL_REPOSITORY)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_store_workflows_registers_schedules() {
        let site = site();
        let archive = archive(vec![
            (
                "nightly",
                json!({
                    "timezone": "Asia/Tokyo",
                    "schedule": {"cron": "0 2 * * *"},
                    "tasks": [{"name": "a", "type": "noop"}]
                }),
            ),
            ("adhoc", json!({"tasks": [{"name": "a", "type": "noop"}]})),
        ]);
        let stored = site.store_workflows("r1", &archive, jan_first()).await.unwrap();
        assert_eq!(stored.published.revision.seq, 1);
        assert_eq!(stored.compiled.len(), 2);
        assert_eq!(
            stored.published.find_workflow("nightly").unwrap().time_zone,
            "Asia/Tokyo"
        );

        let schedules = site
            .store()
            .list_schedules(&stored.published.repository.id)
            .await
            .unwrap();
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].workflow_name, "nightly");
        // 02:00 Asia/Tokyo is 17:00 UTC on the previous day.
        assert_eq!(
            schedules[0].next.session_time,
            Utc.with_ymd_and_hms(2024, 1, 1, 17, 0, 0).unwrap()
        );

        let err = site.store_workflows("r1", &archive, jan_first()).await.unwrap_err();
        assert_eq!(err.kind(), "resource_conflict");
    }

    #[test]
    fn test_next_scheduled_time_supplier() {
        let spec = ScheduleSpec {
            cron: "0 0 0 * * *".to_string(),
            time_zone: "UTC".to_string(),
            delay_secs: 0,
        };
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let supplier = NextScheduledTime(now);
        let next = supplier.session_time(Some(&spec), "UTC").unwrap();
        assert_eq!(next.session_time, Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
        assert_eq!(supplier.session_time(None, "UTC").unwrap(), ScheduleTime::at(now));
    }
}
