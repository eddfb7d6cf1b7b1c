//! SQLite revision store implementation.
//!
//! Implements `RevisionStore` from `kairos-core`. A publish runs as one
//! `BEGIN IMMEDIATE` transaction on the writer pool, so the sequence number
//! it reads and the revision it inserts can never interleave with another
//! publish, in this process or another one sharing the database file.

use chrono::{DateTime, Utc};
use kairos_core::repository::revision::{PublishedRevision, RevisionStore};
use kairos_types::error::RepositoryError;
use kairos_types::workflow::{
    NewRevision, NewSchedule, NewWorkflowDefinition, RepositoryMode, ScheduleSpec, ScheduleTime,
    StoredRepository, StoredRevision, StoredSchedule, StoredWorkflowDefinition,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use uuid::Uuid;

use super::{
    SqliteStore, format_datetime, is_unique_violation, parse_datetime, parse_uuid, query_error,
};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

struct RepositoryRow {
    id: String,
    name: String,
    created_at: String,
}

impl RepositoryRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_repository(self) -> Result<StoredRepository, RepositoryError> {
        Ok(StoredRepository {
            id: parse_uuid(&self.id)?,
            name: self.name,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct RevisionRow {
    id: String,
    repository_id: String,
    seq: i64,
    name: String,
    archive_type: String,
    archive_digest: String,
    default_time_zone: String,
    created_at: String,
}

impl RevisionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            repository_id: row.try_get("repository_id")?,
            seq: row.try_get("seq")?,
            name: row.try_get("name")?,
            archive_type: row.try_get("archive_type")?,
            archive_digest: row.try_get("archive_digest")?,
            default_time_zone: row.try_get("default_time_zone")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_revision(self) -> Result<StoredRevision, RepositoryError> {
        Ok(StoredRevision {
            id: parse_uuid(&self.id)?,
            repository_id: parse_uuid(&self.repository_id)?,
            seq: self.seq,
            name: self.name,
            archive_type: self.archive_type,
            archive_digest: self.archive_digest,
            default_time_zone: self.default_time_zone,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct DefinitionRow {
    id: String,
    repository_id: String,
    revision_id: String,
    name: String,
    config: String,
    time_zone: String,
    created_at: String,
}

impl DefinitionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            repository_id: row.try_get("repository_id")?,
            revision_id: row.try_get("revision_id")?,
            name: row.try_get("name")?,
            config: row.try_get("config")?,
            time_zone: row.try_get("time_zone")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_definition(self) -> Result<StoredWorkflowDefinition, RepositoryError> {
        let config = serde_json::from_str(&self.config)
            .map_err(|e| RepositoryError::Query(format!("invalid workflow config: {e}")))?;
        Ok(StoredWorkflowDefinition {
            id: parse_uuid(&self.id)?,
            repository_id: parse_uuid(&self.repository_id)?,
            revision_id: parse_uuid(&self.revision_id)?,
            name: self.name,
            config,
            time_zone: self.time_zone,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct ScheduleRow {
    id: String,
    repository_id: String,
    workflow_definition_id: String,
    workflow_name: String,
    cron: String,
    time_zone: String,
    delay_secs: i64,
    next_session_time: String,
    next_run_time: String,
    created_at: String,
    updated_at: String,
}

impl ScheduleRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            repository_id: row.try_get("repository_id")?,
            workflow_definition_id: row.try_get("workflow_definition_id")?,
            workflow_name: row.try_get("workflow_name")?,
            cron: row.try_get("cron")?,
            time_zone: row.try_get("time_zone")?,
            delay_secs: row.try_get("delay_secs")?,
            next_session_time: row.try_get("next_session_time")?,
            next_run_time: row.try_get("next_run_time")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_schedule(self) -> Result<StoredSchedule, RepositoryError> {
        Ok(StoredSchedule {
            id: parse_uuid(&self.id)?,
            repository_id: parse_uuid(&self.repository_id)?,
            workflow_definition_id: parse_uuid(&self.workflow_definition_id)?,
            workflow_name: self.workflow_name,
            spec: ScheduleSpec {
                cron: self.cron,
                time_zone: self.time_zone,
                delay_secs: self.delay_secs,
            },
            next: ScheduleTime {
                session_time: parse_datetime(&self.next_session_time)?,
                run_time: parse_datetime(&self.next_run_time)?,
            },
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

fn collect<T, R>(
    rows: &[SqliteRow],
    from_row: fn(&SqliteRow) -> Result<R, sqlx::Error>,
    convert: fn(R) -> Result<T, RepositoryError>,
) -> Result<Vec<T>, RepositoryError> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(convert(from_row(row).map_err(query_error)?)?);
    }
    Ok(out)
}

const REVISION_COLUMNS: &str = "id, repository_id, seq, name, archive_type, archive_digest, default_time_zone, created_at";
const DEFINITION_COLUMNS: &str = "id, repository_id, revision_id, name, config, time_zone, created_at";
const SCHEDULE_COLUMNS: &str = "id, repository_id, workflow_definition_id, workflow_name, cron, time_zone, delay_secs, next_session_time, next_run_time, created_at, updated_at";

// ---------------------------------------------------------------------------
// Publish steps (inside the writer transaction)
// ---------------------------------------------------------------------------

async fn lock_repository(
    tx: &mut Transaction<'_, Sqlite>,
    name: &str,
    mode: RepositoryMode,
    now: DateTime<Utc>,
) -> Result<StoredRepository, RepositoryError> {
    let row = sqlx::query("SELECT id, name, created_at FROM repositories WHERE name = ?")
        .bind(name)
        .fetch_optional(&mut **tx)
        .await
        .map_err(query_error)?;

    if let Some(row) = row {
        return RepositoryRow::from_row(&row)
            .map_err(query_error)?
            .into_repository();
    }
    if mode == RepositoryMode::MustExist {
        return Err(RepositoryError::NotFound(format!("repository '{name}'")));
    }

    let repository = StoredRepository {
        id: Uuid::now_v7(),
        name: name.to_string(),
        created_at: now,
    };
    sqlx::query("INSERT INTO repositories (id, name, created_at) VALUES (?, ?, ?)")
        .bind(repository.id.to_string())
        .bind(&repository.name)
        .bind(format_datetime(&now))
        .execute(&mut **tx)
        .await
        .map_err(query_error)?;
    tracing::info!(repository = name, repository_id = %repository.id, "repository created");
    Ok(repository)
}

async fn replace_schedules(
    tx: &mut Transaction<'_, Sqlite>,
    repository_id: Uuid,
    workflows: &[StoredWorkflowDefinition],
    schedules: &[NewSchedule],
    now: DateTime<Utc>,
) -> Result<(), RepositoryError> {
    let rows = sqlx::query(&format!(
        "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE repository_id = ?"
    ))
    .bind(repository_id.to_string())
    .fetch_all(&mut **tx)
    .await
    .map_err(query_error)?;
    let existing = collect(&rows, ScheduleRow::from_row, ScheduleRow::into_schedule)?;

    for stale in existing
        .iter()
        .filter(|s| !schedules.iter().any(|n| n.workflow_name == s.workflow_name))
    {
        sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(stale.id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(query_error)?;
        tracing::debug!(workflow = stale.workflow_name.as_str(), "schedule removed");
    }

    for new in schedules {
        let Some(definition) = workflows.iter().find(|w| w.name == new.workflow_name) else {
            continue;
        };
        match existing.iter().find(|s| s.workflow_name == new.workflow_name) {
            // An unchanged spec keeps its pending next time.
            Some(current) if current.spec == new.spec => {
                sqlx::query(
                    "UPDATE schedules SET workflow_definition_id = ?, updated_at = ? WHERE id = ?",
                )
                .bind(definition.id.to_string())
                .bind(format_datetime(&now))
                .bind(current.id.to_string())
                .execute(&mut **tx)
                .await
                .map_err(query_error)?;
            }
            Some(current) => {
                sqlx::query(
                    r#"UPDATE schedules SET workflow_definition_id = ?, cron = ?, time_zone = ?,
                         delay_secs = ?, next_session_time = ?, next_run_time = ?, updated_at = ?
                       WHERE id = ?"#,
                )
                .bind(definition.id.to_string())
                .bind(&new.spec.cron)
                .bind(&new.spec.time_zone)
                .bind(new.spec.delay_secs)
                .bind(format_datetime(&new.next.session_time))
                .bind(format_datetime(&new.next.run_time))
                .bind(format_datetime(&now))
                .bind(current.id.to_string())
                .execute(&mut **tx)
                .await
                .map_err(query_error)?;
            }
            None => {
                sqlx::query(
                    r#"INSERT INTO schedules
                       (id, repository_id, workflow_definition_id, workflow_name, cron, time_zone,
                        delay_secs, next_session_time, next_run_time, created_at, updated_at)
                       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
                )
                .bind(Uuid::now_v7().to_string())
                .bind(repository_id.to_string())
                .bind(definition.id.to_string())
                .bind(&new.workflow_name)
                .bind(&new.spec.cron)
                .bind(&new.spec.time_zone)
                .bind(new.spec.delay_secs)
                .bind(format_datetime(&new.next.session_time))
                .bind(format_datetime(&new.next.run_time))
                .bind(format_datetime(&now))
                .bind(format_datetime(&now))
                .execute(&mut **tx)
                .await
                .map_err(query_error)?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// RevisionStore impl
// ---------------------------------------------------------------------------

impl RevisionStore for SqliteStore {
    async fn publish(
        &self,
        repository_name: &str,
        mode: RepositoryMode,
        revision: &NewRevision,
        workflows: &[NewWorkflowDefinition],
        schedules: Option<&[NewSchedule]>,
        now: DateTime<Utc>,
    ) -> Result<PublishedRevision, RepositoryError> {
        let mut tx = self.begin_immediate().await?;

        let repository = lock_repository(&mut tx, repository_name, mode, now).await?;

        let taken: Option<(String,)> =
            sqlx::query_as("SELECT id FROM revisions WHERE repository_id = ? AND name = ?")
                .bind(repository.id.to_string())
                .bind(&revision.name)
                .fetch_optional(&mut *tx)
                .await
                .map_err(query_error)?;
        if taken.is_some() {
            return Err(RepositoryError::Conflict(format!(
                "revision '{}' already exists in repository '{repository_name}'",
                revision.name
            )));
        }

        let (max_seq,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(seq), 0) FROM revisions WHERE repository_id = ?")
                .bind(repository.id.to_string())
                .fetch_one(&mut *tx)
                .await
                .map_err(query_error)?;

        let stored_revision = StoredRevision {
            id: Uuid::now_v7(),
            repository_id: repository.id,
            seq: max_seq + 1,
            name: revision.name.clone(),
            archive_type: revision.archive_type.clone(),
            archive_digest: revision.archive_digest.clone(),
            default_time_zone: revision.default_time_zone.clone(),
            created_at: now,
        };

        let inserted = sqlx::query(
            r#"INSERT INTO revisions
               (id, repository_id, seq, name, archive_type, archive_digest, default_time_zone, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(stored_revision.id.to_string())
        .bind(repository.id.to_string())
        .bind(stored_revision.seq)
        .bind(&stored_revision.name)
        .bind(&stored_revision.archive_type)
        .bind(&stored_revision.archive_digest)
        .bind(&stored_revision.default_time_zone)
        .bind(format_datetime(&now))
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(RepositoryError::Conflict(format!(
                    "revision '{}' already exists in repository '{repository_name}'",
                    revision.name
                )));
            }
            Err(e) => return Err(query_error(e)),
        }

        let mut stored_workflows = Vec::with_capacity(workflows.len());
        for workflow in workflows {
            let definition = StoredWorkflowDefinition {
                id: Uuid::now_v7(),
                repository_id: repository.id,
                revision_id: stored_revision.id,
                name: workflow.name.clone(),
                config: workflow.config.clone(),
                time_zone: workflow.time_zone.clone(),
                created_at: now,
            };
            let config = serde_json::to_string(&definition.config)
                .map_err(|e| RepositoryError::Query(format!("serialize workflow config: {e}")))?;
            sqlx::query(
                r#"INSERT INTO workflow_definitions
                   (id, repository_id, revision_id, name, config, time_zone, created_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(definition.id.to_string())
            .bind(repository.id.to_string())
            .bind(stored_revision.id.to_string())
            .bind(&definition.name)
            .bind(&config)
            .bind(&definition.time_zone)
            .bind(format_datetime(&now))
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
            stored_workflows.push(definition);
        }

        if let Some(schedules) = schedules {
            replace_schedules(&mut tx, repository.id, &stored_workflows, schedules, now).await?;
        }

        tx.commit().await.map_err(query_error)?;

        tracing::debug!(
            repository = repository_name,
            revision = stored_revision.name.as_str(),
            seq = stored_revision.seq,
            workflows = stored_workflows.len(),
            "revision committed"
        );
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
        let row = sqlx::query("SELECT id, name, created_at FROM repositories WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => Ok(Some(
                RepositoryRow::from_row(&row)
                    .map_err(query_error)?
                    .into_repository()?,
            )),
            None => Ok(None),
        }
    }

    async fn get_revision(&self, id: &Uuid) -> Result<Option<StoredRevision>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {REVISION_COLUMNS} FROM revisions WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.map(|row| RevisionRow::from_row(&row).map_err(query_error)?.into_revision())
            .transpose()
    }

    async fn get_revision_by_name(
        &self,
        repository_id: &Uuid,
        name: &str,
    ) -> Result<Option<StoredRevision>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {REVISION_COLUMNS} FROM revisions WHERE repository_id = ? AND name = ?"
        ))
        .bind(repository_id.to_string())
        .bind(name)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        row.map(|row| RevisionRow::from_row(&row).map_err(query_error)?.into_revision())
            .transpose()
    }

    async fn get_latest_revision(
        &self,
        repository_id: &Uuid,
    ) -> Result<Option<StoredRevision>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {REVISION_COLUMNS} FROM revisions WHERE repository_id = ? ORDER BY seq DESC LIMIT 1"
        ))
        .bind(repository_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        row.map(|row| RevisionRow::from_row(&row).map_err(query_error)?.into_revision())
            .transpose()
    }

    async fn list_workflow_definitions(
        &self,
        revision_id: &Uuid,
    ) -> Result<Vec<StoredWorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM workflow_definitions WHERE revision_id = ? ORDER BY name ASC"
        ))
        .bind(revision_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        collect(&rows, DefinitionRow::from_row, DefinitionRow::into_definition)
    }

    async fn get_workflow_definition(
        &self,
        id: &Uuid,
    ) -> Result<Option<StoredWorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM workflow_definitions WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        row.map(|row| DefinitionRow::from_row(&row).map_err(query_error)?.into_definition())
            .transpose()
    }

    async fn find_workflow_definition(
        &self,
        revision_id: &Uuid,
        name: &str,
    ) -> Result<Option<StoredWorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM workflow_definitions WHERE revision_id = ? AND name = ?"
        ))
        .bind(revision_id.to_string())
        .bind(name)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        row.map(|row| DefinitionRow::from_row(&row).map_err(query_error)?.into_definition())
            .transpose()
    }

    async fn list_schedules(
        &self,
        repository_id: &Uuid,
    ) -> Result<Vec<StoredSchedule>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE repository_id = ? ORDER BY workflow_name ASC"
        ))
        .bind(repository_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        collect(&rows, ScheduleRow::from_row, ScheduleRow::into_schedule)
    }

    async fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<StoredSchedule>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE next_run_time <= ? ORDER BY next_run_time ASC LIMIT ?"
        ))
        .bind(format_datetime(&now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        collect(&rows, ScheduleRow::from_row, ScheduleRow::into_schedule)
    }

    async fn advance_schedule(
        &self,
        schedule_id: &Uuid,
        expected_run_time: DateTime<Utc>,
        next: ScheduleTime,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE schedules SET next_session_time = ?, next_run_time = ?, updated_at = ?
               WHERE id = ? AND next_run_time = ?"#,
        )
        .bind(format_datetime(&next.session_time))
        .bind(format_datetime(&next.run_time))
        .bind(format_datetime(&now))
        .bind(schedule_id.to_string())
        .bind(format_datetime(&expected_run_time))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM schedules WHERE id = ?")
            .bind(schedule_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_error)?;
        match exists {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound(format!("schedule {schedule_id}"))),
        }
    }

    async fn remove_schedule(
        &self,
        schedule_id: &Uuid,
        expected_run_time: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ? AND next_run_time = ?")
            .bind(schedule_id.to_string())
            .bind(format_datetime(&expected_run_time))
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }
}
