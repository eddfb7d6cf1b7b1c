use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors from store operations (used by the store traits in kairos-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("resource conflict: {0}")]
    Conflict(String),

    /// A session for this workflow and session time already has an attempt.
    #[error("session attempt already exists for workflow '{workflow}' at {session_time}")]
    SessionAttemptConflict {
        workflow: String,
        session_time: DateTime<Utc>,
    },
}

impl RepositoryError {
    /// Stable, machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RepositoryError::Connection => "connection",
            RepositoryError::Query(_) => "query",
            RepositoryError::NotFound(_) => "resource_not_found",
            RepositoryError::Conflict(_) => "resource_conflict",
            RepositoryError::SessionAttemptConflict { .. } => "session_attempt_conflict",
        }
    }

    /// True for the conflict family (`Conflict` and `SessionAttemptConflict`).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            RepositoryError::Conflict(_) | RepositoryError::SessionAttemptConflict { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_session_conflict_display_and_kind() {
        let err = RepositoryError::SessionAttemptConflict {
            workflow: "daily_job".to_string(),
            session_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        };
        assert!(err.to_string().contains("daily_job"));
        assert!(err.to_string().contains("2024-01-01"));
        assert_eq!(err.kind(), "session_attempt_conflict");
        assert!(err.is_conflict());
    }

    #[test]
    fn test_not_found_is_not_conflict() {
        let err = RepositoryError::NotFound("repository 'default'".to_string());
        assert_eq!(err.kind(), "resource_not_found");
        assert!(!err.is_conflict());
    }
}
