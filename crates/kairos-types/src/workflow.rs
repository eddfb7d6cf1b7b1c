//! Workflow domain types for Kairos.
//!
//! Covers the declarative workflow format (`WorkflowConfig` / `TaskConfig`),
//! the archive a caller publishes, and the stored records that publishing
//! produces: repositories, revisions, workflow definitions and schedules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Declarative workflow format
// ---------------------------------------------------------------------------

/// A workflow as written by its author (YAML or JSON).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Time zone for session times; overrides the archive default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleConfig>,
    /// Default params, overridable per attempt.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    pub tasks: Vec<TaskConfig>,
}

/// One task, either a leaf with an operator `type` or a group of `tasks`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    /// Operator type tag. Absent for groups.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Names of sibling tasks that must succeed first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Task-level retry budget for deterministic failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskConfig>,
}

/// Schedule block of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// 5/6-field cron or a human-readable form such as "daily".
    pub cron: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Seconds between the session time and the moment the run is due.
    #[serde(default)]
    pub delay_secs: i64,
}

// ---------------------------------------------------------------------------
// Archive input
// ---------------------------------------------------------------------------

/// A named, unvalidated workflow config as found in an archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSource {
    pub name: String,
    pub config: serde_json::Value,
}

/// Bundle of workflow sources published together as one revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    /// How the archive was produced (e.g. "project_dir", "inline").
    pub archive_type: String,
    /// Hex SHA-256 over the archive content.
    pub digest: String,
    pub default_time_zone: String,
    pub workflows: Vec<WorkflowSource>,
}

// ---------------------------------------------------------------------------
// Stored records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRepository {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// How `publish` treats a repository that does not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryMode {
    CreateIfAbsent,
    MustExist,
}

/// Revision fields supplied by the caller; id and sequence are assigned on publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRevision {
    pub name: String,
    pub archive_type: String,
    pub archive_digest: String,
    pub default_time_zone: String,
}

/// An immutable snapshot of a repository's workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRevision {
    pub id: Uuid,
    pub repository_id: Uuid,
    /// Monotonic within the repository, starting at 1.
    pub seq: i64,
    pub name: String,
    pub archive_type: String,
    pub archive_digest: String,
    pub default_time_zone: String,
    pub created_at: DateTime<Utc>,
}

/// A validated workflow ready to be stored in a revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkflowDefinition {
    pub name: String,
    pub config: serde_json::Value,
    pub time_zone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredWorkflowDefinition {
    pub id: Uuid,
    pub repository_id: Uuid,
    pub revision_id: Uuid,
    pub name: String,
    pub config: serde_json::Value,
    pub time_zone: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

/// Normalized schedule: 6-field cron, IANA zone, due delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub cron: String,
    pub time_zone: String,
    pub delay_secs: i64,
}

/// A logical session time and the wall-clock time it becomes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTime {
    pub session_time: DateTime<Utc>,
    pub run_time: DateTime<Utc>,
}

impl ScheduleTime {
    /// A session that is due immediately.
    pub fn at(session_time: DateTime<Utc>) -> Self {
        Self {
            session_time,
            run_time: session_time,
        }
    }
}

/// Schedule row written alongside a revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub workflow_name: String,
    pub spec: ScheduleSpec,
    pub next: ScheduleTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSchedule {
    pub id: Uuid,
    pub repository_id: Uuid,
    pub workflow_definition_id: Uuid,
    pub workflow_name: String,
    pub spec: ScheduleSpec,
    pub next: ScheduleTime,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_config_yaml_parse() {
        let yaml = r#"
timezone: Asia/Tokyo
schedule:
  cron: "0 9 * * *"
params:
  target: prod
tasks:
  - name: extract
    type: echo
    config:
      message: hello
  - name: load
    depends_on: [extract]
    retry: 2
    tasks:
      - name: stage
        type: noop
"#;
        let config: WorkflowConfig = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.timezone.as_deref(), Some("Asia/Tokyo"));
        let schedule = config.schedule.unwrap();
        assert_eq!(schedule.cron, "0 9 * * *");
        assert_eq!(schedule.delay_secs, 0);
        assert_eq!(config.params["target"], "prod");
        assert_eq!(config.tasks.len(), 2);
        assert_eq!(config.tasks[0].task_type.as_deref(), Some("echo"));
        assert_eq!(config.tasks[1].depends_on, vec!["extract".to_string()]);
        assert_eq!(config.tasks[1].retry, Some(2));
        assert_eq!(config.tasks[1].tasks[0].name, "stage");
    }

    #[test]
    fn test_schedule_time_at_is_due_immediately() {
        let now = Utc::now();
        let time = ScheduleTime::at(now);
        assert_eq!(time.session_time, time.run_time);
    }
}
