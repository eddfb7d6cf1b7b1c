//! Attempt request assembly.
//!
//! Pure: no I/O, no locking. Combines a stored revision, a stored workflow
//! definition, the workflow's default params and caller overrides into an
//! immutable `AttemptRequest`.

use chrono::{DateTime, Utc};
use kairos_types::session::AttemptRequest;
use kairos_types::workflow::{StoredRevision, StoredWorkflowDefinition};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::compiler::CompiledWorkflow;

/// Stateless builder for attempt requests.
pub struct AttemptBuilder;

impl AttemptBuilder {
    /// Assemble an attempt request.
    ///
    /// `overrides` take precedence over the workflow's default params on key
    /// collision; nested mappings are merged key by key.
    pub fn build(
        parent_attempt_id: Option<Uuid>,
        revision: &StoredRevision,
        definition: &StoredWorkflowDefinition,
        workflow: &CompiledWorkflow,
        overrides: &Map<String, Value>,
        session_time: DateTime<Utc>,
    ) -> AttemptRequest {
        let mut params = workflow.params.clone();
        merge_params(&mut params, overrides);

        AttemptRequest {
            repository_id: revision.repository_id,
            revision_id: revision.id,
            workflow_definition_id: definition.id,
            workflow_name: definition.name.clone(),
            session_time,
            time_zone: definition.time_zone.clone(),
            params,
            parent_attempt_id,
            retry_attempt_name: None,
        }
    }

    /// Same as [`build`](Self::build), for a named retry of an existing session.
    pub fn build_retry(
        retry_attempt_name: impl Into<String>,
        revision: &StoredRevision,
        definition: &StoredWorkflowDefinition,
        workflow: &CompiledWorkflow,
        overrides: &Map<String, Value>,
        session_time: DateTime<Utc>,
    ) -> AttemptRequest {
        let mut request = Self::build(None, revision, definition, workflow, overrides, session_time);
        request.retry_attempt_name = Some(retry_attempt_name.into());
        request
    }
}

/// Deep-merge `overrides` into `base`. Non-object values replace.
pub fn merge_params(base: &mut Map<String, Value>, overrides: &Map<String, Value>) {
    for (key, value) in overrides {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_params(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::compiler::compile;
    use chrono::TimeZone;
    use serde_json::json;

    fn fixtures() -> (StoredRevision, StoredWorkflowDefinition, CompiledWorkflow) {
        let now = Utc::now();
        let repository_id = Uuid::now_v7();
        let revision = StoredRevision {
            id: Uuid::now_v7(),
            repository_id,
            seq: 1,
            name: "r1".to_string(),
            archive_type: "inline".to_string(),
            archive_digest: "abc".to_string(),
            default_time_zone: "UTC".to_string(),
            created_at: now,
        };
        let config = json!({
            "params": {"env": "dev", "db": {"host": "localhost", "port": 5432}},
            "tasks": [{"name": "a", "type": "noop"}]
        });
        let definition = StoredWorkflowDefinition {
            id: Uuid::now_v7(),
            repository_id,
            revision_id: revision.id,
            name: "daily_job".to_string(),
            config: config.clone(),
            time_zone: "Asia/Tokyo".to_string(),
            created_at: now,
        };
        let compiled = compile("daily_job", &config).unwrap();
        (revision, definition, compiled)
    }

    #[test]
    fn test_build_binds_revision_and_definition() {
        let (revision, definition, compiled) = fixtures();
        let session_time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let request =
            AttemptBuilder::build(None, &revision, &definition, &compiled, &Map::new(), session_time);

        assert_eq!(request.repository_id, revision.repository_id);
        assert_eq!(request.revision_id, revision.id);
        assert_eq!(request.workflow_definition_id, definition.id);
        assert_eq!(request.workflow_name, "daily_job");
        assert_eq!(request.session_time, session_time);
        assert_eq!(request.time_zone, "Asia/Tokyo");
        assert_eq!(request.params["env"], "dev");
        assert!(request.parent_attempt_id.is_none());
        assert!(request.retry_attempt_name.is_none());
    }

    #[test]
    fn test_overrides_win_on_collision() {
        let (revision, definition, compiled) = fixtures();
        let overrides = json!({"env": "prod", "db": {"host": "db.internal"}, "extra": true});
        let request = AttemptBuilder::build(
            Some(Uuid::nil()),
            &revision,
            &definition,
            &compiled,
            overrides.as_object().unwrap(),
            Utc::now(),
        );
        assert_eq!(request.params["env"], "prod");
        assert_eq!(request.params["db"]["host"], "db.internal");
        assert_eq!(request.params["db"]["port"], 5432);
        assert_eq!(request.params["extra"], true);
        assert_eq!(request.parent_attempt_id, Some(Uuid::nil()));
    }

    #[test]
    fn test_build_retry_sets_name() {
        let (revision, definition, compiled) = fixtures();
        let request =
            AttemptBuilder::build_retry("retry-1", &revision, &definition, &compiled, &Map::new(), Utc::now());
        assert_eq!(request.retry_attempt_name.as_deref(), Some("retry-1"));
    }

    #[test]
    fn test_build_is_pure() {
        let (revision, definition, compiled) = fixtures();
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let a = AttemptBuilder::build(None, &revision, &definition, &compiled, &Map::new(), t);
        let b = AttemptBuilder::build(None, &revision, &definition, &compiled, &Map::new(), t);
        assert_eq!(a, b);
    }

    #[test]
    fn test_merge_replaces_non_objects() {
        let mut base = json!({"a": {"b": 1}, "c": [1, 2]}).as_object().unwrap().clone();
        let overrides = json!({"a": 5, "c": [3]}).as_object().unwrap().clone();
        merge_params(&mut base, &overrides);
        assert_eq!(Value::Object(base), json!({"a": 5, "c": [3]}));
    }
}
