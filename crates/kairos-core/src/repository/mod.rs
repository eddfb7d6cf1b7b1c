//! Store trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (kairos-infra) implements. The core crate never depends on any specific
//! storage technology; [`memory::MemoryStore`] backs embedded runs and tests.

pub mod memory;
pub mod revision;
pub mod session;
