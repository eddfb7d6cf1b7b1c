//! Logging and trace export setup shared by Kairos binaries and embedders.

pub mod tracing_setup;
