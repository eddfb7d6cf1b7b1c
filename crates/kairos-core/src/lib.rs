//! Workflow engine logic and store trait definitions for Kairos.
//!
//! This crate defines the "ports" (store traits) that the infrastructure
//! layer implements, together with the compiler, task match resolver,
//! scheduler evaluator, attempt builder, operator contract and executor.
//! It depends only on `kairos-types` -- never on `kairos-infra` or any
//! database/IO crate.

pub mod repository;
pub mod site;
pub mod workflow;
