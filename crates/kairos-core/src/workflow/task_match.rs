//! Task match pattern parsing and resolution.
//!
//! Pattern syntax: `<workflow>[+<subtask.path>]`. The workflow name must match
//! exactly. A subtask path is first looked up as an exact path from the
//! workflow root; failing that, a unique task whose path ends with the given
//! dot-separated suffix is accepted.

use std::fmt;

use super::compiler::{CompiledWorkflow, PATH_SEPARATOR};

/// Separator between the workflow name and the subtask path.
pub const SUBTASK_SEPARATOR: char = '+';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMatchPattern {
    workflow_name: String,
    subtask_path: Option<String>,
}

impl TaskMatchPattern {
    /// Parse `wf` or `wf+a.b`.
    pub fn parse(pattern: &str) -> Result<Self, TaskMatchError> {
        let invalid = || TaskMatchError::InvalidPattern(pattern.to_string());
        let trimmed = pattern.trim();
        let (workflow, subtask) = match trimmed.split_once(SUBTASK_SEPARATOR) {
            Some((workflow, subtask)) => (workflow, Some(subtask)),
            None => (trimmed, None),
        };
        if workflow.is_empty() || workflow.contains(PATH_SEPARATOR) {
            return Err(invalid());
        }
        if let Some(subtask) = subtask {
            let bad_segment = subtask
                .split(PATH_SEPARATOR)
                .any(|s| s.is_empty() || s.contains(SUBTASK_SEPARATOR));
            if bad_segment {
                return Err(invalid());
            }
        }
        Ok(Self {
            workflow_name: workflow.to_string(),
            subtask_path: subtask.map(str::to_string),
        })
    }

    /// Pattern selecting a whole workflow.
    pub fn of_workflow(name: impl Into<String>) -> Self {
        Self {
            workflow_name: name.into(),
            subtask_path: None,
        }
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    pub fn subtask_path(&self) -> Option<&str> {
        self.subtask_path.as_deref()
    }

    /// Find the single workflow (and subtask) this pattern selects.
    pub fn resolve<'a>(
        &self,
        workflows: &'a [CompiledWorkflow],
    ) -> Result<TaskMatch<'a>, TaskMatchError> {
        let mut candidates = workflows
            .iter()
            .enumerate()
            .filter(|(_, w)| w.name == self.workflow_name);

        let (workflow_index, workflow) = candidates
            .next()
            .ok_or_else(|| TaskMatchError::NoMatch(self.to_string()))?;
        if candidates.next().is_some() {
            return Err(TaskMatchError::MultipleTaskMatch {
                pattern: self.to_string(),
                matches: workflows
                    .iter()
                    .filter(|w| w.name == self.workflow_name)
                    .map(|w| w.name.clone())
                    .collect(),
            });
        }

        let subtask = match &self.subtask_path {
            None => None,
            Some(path) => Some(self.resolve_subtask(workflow, path)?),
        };

        Ok(TaskMatch {
            workflow_index,
            workflow,
            subtask,
        })
    }

    fn resolve_subtask(
        &self,
        workflow: &CompiledWorkflow,
        path: &str,
    ) -> Result<usize, TaskMatchError> {
        if let Some(index) = workflow.find_path(path) {
            return Ok(index);
        }

        let suffix = format!("{PATH_SEPARATOR}{path}");
        let matches: Vec<usize> = workflow
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.path.ends_with(&suffix))
            .map(|(i, _)| i)
            .collect();

        match matches.as_slice() {
            [] => Err(TaskMatchError::NoMatch(self.to_string())),
            [single] => Ok(*single),
            many => Err(TaskMatchError::MultipleTaskMatch {
                pattern: self.to_string(),
                matches: many.iter().map(|i| workflow.tasks[*i].path.clone()).collect(),
            }),
        }
    }
}

impl fmt::Display for TaskMatchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subtask_path {
            Some(path) => write!(f, "{}{SUBTASK_SEPARATOR}{path}", self.workflow_name),
            None => f.write_str(&self.workflow_name),
        }
    }
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone, Copy)]
pub struct TaskMatch<'a> {
    /// Position of the workflow in the slice passed to `resolve`.
    pub workflow_index: usize,
    pub workflow: &'a CompiledWorkflow,
    /// Task index of the selected subtask, if the pattern named one.
    pub subtask: Option<usize>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Caller errors from pattern parsing and resolution. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskMatchError {
    #[error("invalid task match pattern '{0}'")]
    InvalidPattern(String),

    #[error("no workflow or task matches '{0}'")]
    NoMatch(String),

    #[error("pattern '{pattern}' matches multiple tasks: {}", .matches.join(", "))]
    MultipleTaskMatch {
        pattern: String,
        matches: Vec<String>,
    },
}

impl TaskMatchError {
    /// Stable, machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskMatchError::InvalidPattern(_) => "invalid_pattern",
            TaskMatchError::NoMatch(_) => "no_match",
            TaskMatchError::MultipleTaskMatch { .. } => "multiple_task_match",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
