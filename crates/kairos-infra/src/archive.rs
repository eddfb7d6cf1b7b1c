//! Project directory loader.
//!
//! A project is a directory of `<name>.kairos.yml` (or `.kairos.yaml`)
//! workflow files plus an optional `project.yml` carrying project-wide
//! settings. Loading it produces the [`ArchiveMetadata`] a site publishes as
//! one revision. The digest covers every file read, in name order, so an
//! unchanged project always maps to the same revision name.

use std::path::{Path, PathBuf};

use kairos_types::workflow::{ArchiveMetadata, WorkflowSource};
use serde::Deserialize;
use sha2::{Digest, Sha256};

pub const ARCHIVE_TYPE: &str = "project_dir";
pub const PROJECT_FILE: &str = "project.yml";
const WORKFLOW_SUFFIXES: [&str; 2] = [".kairos.yml", ".kairos.yaml"];

#[derive(Debug, Default, Deserialize)]
struct ProjectFile {
    #[serde(default)]
    default_timezone: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("workflow '{0}' is defined more than once")]
    DuplicateWorkflow(String),

    #[error("no workflow files found in {0}")]
    Empty(PathBuf),
}

impl ArchiveError {
    pub fn kind(&self) -> &'static str {
        match self {
            ArchiveError::Io { .. } => "io",
            ArchiveError::Parse { .. } => "parse",
            ArchiveError::DuplicateWorkflow(_) => "duplicate_workflow",
            ArchiveError::Empty(_) => "empty_archive",
        }
    }
}

/// Workflow name for a file name, `None` if it is not a workflow file.
fn workflow_name(file_name: &str) -> Option<&str> {
    WORKFLOW_SUFFIXES
        .iter()
        .find_map(|suffix| file_name.strip_suffix(suffix))
        .filter(|name| !name.is_empty())
}

/// Load every workflow file in `dir` into an archive.
///
/// `fallback_time_zone` applies when `project.yml` is absent or does not
/// set `default_timezone`. Workflow files are parsed as YAML but not
/// validated; compilation happens when the archive is stored.
pub async fn load_project(
    dir: &Path,
    fallback_time_zone: &str,
) -> Result<ArchiveMetadata, ArchiveError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| ArchiveError::Io { path, source }
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err(dir))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_err(dir))? {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name == PROJECT_FILE || workflow_name(&file_name).is_some() {
            files.push(file_name);
        }
    }
    files.sort();

    let mut hasher = Sha256::new();
    let mut project = ProjectFile::default();
    let mut workflows: Vec<WorkflowSource> = Vec::new();

    for file_name in &files {
        let path = dir.join(file_name);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(io_err(&path))?;
        hasher.update(file_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(content.as_bytes());
        hasher.update([0u8]);

        if file_name == PROJECT_FILE {
            project = serde_yaml_ng::from_str::<Option<ProjectFile>>(&content)
                .map_err(|e| ArchiveError::Parse {
                    path: path.clone(),
                    message: e.to_string(),
                })?
                .unwrap_or_default();
            continue;
        }

        let Some(name) = workflow_name(file_name) else {
            continue;
        };
        if workflows.iter().any(|w| w.name == name) {
            return Err(ArchiveError::DuplicateWorkflow(name.to_string()));
        }
        let config: serde_json::Value =
            serde_yaml_ng::from_str(&content).map_err(|e| ArchiveError::Parse {
                path: path.clone(),
                message: e.to_string(),
            })?;
        tracing::debug!(workflow = name, path = %path.display(), "workflow file loaded");
        workflows.push(WorkflowSource {
            name: name.to_string(),
            config,
        });
    }

    if workflows.is_empty() {
        return Err(ArchiveError::Empty(dir.to_path_buf()));
    }

    let archive = ArchiveMetadata {
        archive_type: ARCHIVE_TYPE.to_string(),
        digest: format!("{:x}", hasher.finalize()),
        default_time_zone: project
            .default_timezone
            .unwrap_or_else(|| fallback_time_zone.to_string()),
        workflows,
    };
    tracing::info!(
        dir = %dir.display(),
        workflows = archive.workflows.len(),
        digest = archive.digest.as_str(),
        "project loaded"
    );
    Ok(archive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn write(dir: &Path, name: &str, content: &str) {
        tokio::fs::write(dir.join(name), content).await.unwrap();
    }

    const DAILY: &str = r#"
schedule:
  cron: daily
tasks:
  - name: hello
    type: echo
    config:
      message: hi
"#;

    #[test]
    fn test_workflow_name_from_file_name() {
        assert_eq!(workflow_name("daily_job.kairos.yml"), Some("daily_job"));
        assert_eq!(workflow_name("etl.kairos.yaml"), Some("etl"));
        assert_eq!(workflow_name("notes.yml"), None);
        assert_eq!(workflow_name(".kairos.yml"), None);
    }

    #[tokio::test]
    async fn test_load_project_reads_workflows_sorted() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "daily_job.kairos.yml", DAILY).await;
        write(tmp.path(), "adhoc.kairos.yaml", "tasks:\n  - name: a\n    type: noop\n").await;
        write(tmp.path(), "README.md", "ignored").await;

        let archive = load_project(tmp.path(), "UTC").await.unwrap();
        assert_eq!(archive.archive_type, "project_dir");
        assert_eq!(archive.default_time_zone, "UTC");
        let names: Vec<&str> = archive.workflows.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["adhoc", "daily_job"]);
        assert_eq!(archive.workflows[1].config["schedule"]["cron"], "daily");
        assert_eq!(archive.workflows[1].config["tasks"][0]["config"]["message"], "hi");
        assert_eq!(archive.digest.len(), 64);
    }

    #[tokio::test]
    async fn test_project_file_sets_default_time_zone() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "daily_job.kairos.yml", DAILY).await;
        write(tmp.path(), "project.yml", "default_timezone: Asia/Tokyo\n").await;

        let archive = load_project(tmp.path(), "UTC").await.unwrap();
        assert_eq!(archive.default_time_zone, "Asia/Tokyo");
    }

    #[tokio::test]
    async fn test_digest_tracks_content() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "daily_job.kairos.yml", DAILY).await;
        let first = load_project(tmp.path(), "UTC").await.unwrap().digest;
        let again = load_project(tmp.path(), "UTC").await.unwrap().digest;
        assert_eq!(first, again);

        write(tmp.path(), "daily_job.kairos.yml", &DAILY.replace("hi", "bye")).await;
        let changed = load_project(tmp.path(), "UTC").await.unwrap().digest;
        assert_ne!(first, changed);
    }

    #[tokio::test]
    async fn test_load_project_errors() {
        let tmp = TempDir::new().unwrap();
        let err = load_project(tmp.path(), "UTC").await.unwrap_err();
        assert_eq!(err.kind(), "empty_archive");

        write(tmp.path(), "a.kairos.yml", "tasks: [").await;
        let err = load_project(tmp.path(), "UTC").await.unwrap_err();
        assert_eq!(err.kind(), "parse");

        write(tmp.path(), "a.kairos.yml", DAILY).await;
        write(tmp.path(), "a.kairos.yaml", DAILY).await;
        let err = load_project(tmp.path(), "UTC").await.unwrap_err();
        assert!(matches!(err, ArchiveError::DuplicateWorkflow(ref name) if name == "a"));

        let err = load_project(&tmp.path().join("missing"), "UTC").await.unwrap_err();
        assert_eq!(err.kind(), "io");
    }
}
