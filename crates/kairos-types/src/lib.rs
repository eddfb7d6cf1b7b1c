//! Shared domain types for Kairos.
//!
//! This crate contains the domain types used across the engine: repositories,
//! revisions, stored workflow definitions, schedules, sessions, attempts and
//! tasks, plus site configuration and the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod session;
pub mod workflow;
