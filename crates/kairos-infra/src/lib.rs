//! Infrastructure layer for Kairos.
//!
//! Contains implementations of the store traits defined in `kairos-core`:
//! SQLite storage, the site config loader, and the project directory loader
//! that turns workflow files into an archive.

pub mod archive;
pub mod config;
pub mod sqlite;
