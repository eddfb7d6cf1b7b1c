//! Workflow compiler: config validation, cycle detection and task graph layout.
//!
//! Uses `petgraph` to model sibling dependencies inside every task group as a
//! directed graph. Topological sort detects cycles. The result is a flat
//! `CompiledWorkflow` whose first task is the synthetic root group; every
//! other task records its parent, its upstream siblings and its children.
//!
//! Compilation is a pure function of `(name, config)` and runs before a
//! revision is stored, so an invalid workflow never becomes part of one.

use std::collections::{HashMap, HashSet};

use kairos_types::workflow::{ScheduleConfig, TaskConfig, WorkflowConfig};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde_json::Value;

/// Separator between task names in a path (`load.stage`).
pub const PATH_SEPARATOR: char = '.';

// ---------------------------------------------------------------------------
// Compiled graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledTask {
    /// Local name; the workflow name for the root.
    pub name: String,
    /// Dot path from the workflow root; empty for the root.
    pub path: String,
    pub parent: Option<usize>,
    /// Sibling tasks that must succeed before this one becomes ready.
    pub upstreams: Vec<usize>,
    pub children: Vec<usize>,
    /// Operator type tag; `None` for groups.
    pub task_type: Option<String>,
    pub config: Value,
    pub retry_limit: u32,
}

impl CompiledTask {
    pub fn is_group(&self) -> bool {
        self.task_type.is_none()
    }
}

/// Validated task graph of one workflow. `tasks[0]` is the root.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledWorkflow {
    pub name: String,
    pub tasks: Vec<CompiledTask>,
    pub params: serde_json::Map<String, Value>,
    pub time_zone: Option<String>,
    pub schedule: Option<ScheduleConfig>,
}

impl CompiledWorkflow {
    pub fn root(&self) -> &CompiledTask {
        &self.tasks[0]
    }

    /// Index of the task at `path` (exact match from the root).
    pub fn find_path(&self, path: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.path == path)
    }

    /// Extract the subtree rooted at `index` as a standalone workflow.
    ///
    /// The subtask becomes the root: its parent and upstream links are
    /// dropped, descendants keep their relative structure and their paths.
    pub fn subtree(&self, index: usize) -> CompiledWorkflow {
        let mut keep = Vec::new();
        let mut stack = vec![index];
        while let Some(i) = stack.pop() {
            keep.push(i);
            stack.extend(self.tasks[i].children.iter().rev().copied());
        }
        keep.sort_unstable();

        let remap: HashMap<usize, usize> =
            keep.iter().enumerate().map(|(new, old)| (*old, new)).collect();

        let tasks = keep
            .iter()
            .map(|old| {
                let task = &self.tasks[*old];
                let is_root = *old == index;
                CompiledTask {
                    name: task.name.clone(),
                    path: task.path.clone(),
                    parent: if is_root {
                        None
                    } else {
                        task.parent.and_then(|p| remap.get(&p).copied())
                    },
                    upstreams: if is_root {
                        Vec::new()
                    } else {
                        task.upstreams.iter().filter_map(|u| remap.get(u).copied()).collect()
                    },
                    children: task.children.iter().filter_map(|c| remap.get(c).copied()).collect(),
                    task_type: task.task_type.clone(),
                    config: task.config.clone(),
                    retry_limit: task.retry_limit,
                }
            })
            .collect();

        CompiledWorkflow {
            name: self.name.clone(),
            tasks,
            params: self.params.clone(),
            time_zone: self.time_zone.clone(),
            schedule: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Parse and compile a workflow from its JSON config value.
pub fn compile(name: &str, config: &Value) -> Result<CompiledWorkflow, CompileError> {
    let parsed: WorkflowConfig =
        serde_json::from_value(config.clone()).map_err(|e| CompileError::InvalidConfig {
            workflow: name.to_string(),
            message: e.to_string(),
        })?;
    compile_config(name, &parsed)
}

/// Compile an already-deserialized workflow config.
pub fn compile_config(name: &str, config: &WorkflowConfig) -> Result<CompiledWorkflow, CompileError> {
    if name.is_empty() || name.contains('+') || name.contains(PATH_SEPARATOR) {
        return Err(CompileError::InvalidConfig {
            workflow: name.to_string(),
            message: format!("invalid workflow name '{name}'"),
        });
    }
    if config.tasks.is_empty() {
        return Err(CompileError::NoTasks {
            workflow: name.to_string(),
        });
    }

    let mut tasks = vec![CompiledTask {
        name: name.to_string(),
        path: String::new(),
        parent: None,
        upstreams: Vec::new(),
        children: Vec::new(),
        task_type: None,
        config: Value::Object(Default::default()),
        retry_limit: 0,
    }];
    compile_group(name, 0, &config.tasks, &mut tasks)?;

    Ok(CompiledWorkflow {
        name: name.to_string(),
        tasks,
        params: config.params.clone(),
        time_zone: config.timezone.clone(),
        schedule: config.schedule.clone(),
    })
}

fn compile_group(
    workflow: &str,
    parent: usize,
    group: &[TaskConfig],
    out: &mut Vec<CompiledTask>,
) -> Result<(), CompileError> {
    validate_group(workflow, group)?;

    let parent_path = out[parent].path.clone();
    let first = out.len();
    let name_to_idx: HashMap<&str, usize> = group
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.as_str(), first + i))
        .collect();

    for task in group {
        let path = if parent_path.is_empty() {
            task.name.clone()
        } else {
            format!("{parent_path}{PATH_SEPARATOR}{}", task.name)
        };
        out.push(CompiledTask {
            name: task.name.clone(),
            path,
            parent: Some(parent),
            upstreams: task.depends_on.iter().map(|d| name_to_idx[d.as_str()]).collect(),
            children: Vec::new(),
            task_type: task.task_type.clone(),
            config: task.config.clone(),
            retry_limit: task.retry.unwrap_or(0),
        });
    }
    out[parent].children = (first..first + group.len()).collect();

    for (offset, task) in group.iter().enumerate() {
        if !task.tasks.is_empty() {
            compile_group(workflow, first + offset, &task.tasks, out)?;
        }
    }
    Ok(())
}

/// Validate one group of sibling tasks: names, shape, references, acyclicity.
fn validate_group(workflow: &str, group: &[TaskConfig]) -> Result<(), CompileError> {
    let mut seen = HashSet::new();
    for task in group {
        let invalid = |message: &str| CompileError::InvalidTask {
            workflow: workflow.to_string(),
            task: task.name.clone(),
            message: message.to_string(),
        };
        if task.name.is_empty() {
            return Err(invalid("task name must not be empty"));
        }
        if task.name.contains(PATH_SEPARATOR) || task.name.contains('+') {
            return Err(invalid("task name must not contain '.' or '+'"));
        }
        if !seen.insert(task.name.as_str()) {
            return Err(CompileError::DuplicateTask {
                workflow: workflow.to_string(),
                task: task.name.clone(),
            });
        }
        match (&task.task_type, task.tasks.is_empty()) {
            (Some(_), false) => return Err(invalid("a task cannot have both a type and subtasks")),
            (None, true) => return Err(invalid("a task needs either a type or subtasks")),
            (Some(t), true) if t.is_empty() => return Err(invalid("task type must not be empty")),
            _ => {}
        }
    }

    let id_to_idx: HashMap<&str, usize> = group
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.as_str(), i))
        .collect();

    // Edge from dependency -> dependent
    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = group.iter().map(|t| graph.add_node(t.name.as_str())).collect();

    for (to_idx, task) in group.iter().enumerate() {
        for dep in &task.depends_on {
            let from_idx = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                CompileError::UnknownDependency {
                    workflow: workflow.to_string(),
                    task: task.name.clone(),
                    dependency: dep.clone(),
                }
            })?;
            graph.add_edge(node_indices[*from_idx], node_indices[to_idx], ());
        }
    }

    toposort(&graph, None).map_err(|cycle| CompileError::CycleDetected {
        workflow: workflow.to_string(),
        task: graph[cycle.node_id()].to_string(),
    })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Workflow validation failures. Every variant names the workflow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("workflow '{workflow}': invalid config: {message}")]
    InvalidConfig { workflow: String, message: String },

    #[error("workflow '{workflow}' has no tasks")]
    NoTasks { workflow: String },

    #[error("workflow '{workflow}': task '{task}' is invalid: {message}")]
    InvalidTask {
        workflow: String,
        task: String,
        message: String,
    },

    #[error("workflow '{workflow}': duplicate task name '{task}'")]
    DuplicateTask { workflow: String, task: String },

    #[error("workflow '{workflow}': task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency {
        workflow: String,
        task: String,
        dependency: String,
    },

    #[error("workflow '{workflow}': cycle detected involving task '{task}'")]
    CycleDetected { workflow: String, task: String },
}

impl CompileError {
    pub fn kind(&self) -> &'static str {
        "compile"
    }

    pub fn workflow(&self) -> &str {
        match self {
            CompileError::InvalidConfig { workflow, .. }
            | CompileError::NoTasks { workflow }
            | CompileError::InvalidTask { workflow, .. }
            | CompileError::DuplicateTask { workflow, .. }
            | CompileError::UnknownDependency { workflow, .. }
            | CompileError::CycleDetected { workflow, .. } => workflow,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
