//! Workflow compilation, scheduling and execution.

pub mod attempt;
pub mod builtin;
pub mod compiler;
pub mod executor;
pub mod operator;
pub mod registry;
pub mod retry;
pub mod schedule_executor;
pub mod scheduler;
pub mod task_match;
