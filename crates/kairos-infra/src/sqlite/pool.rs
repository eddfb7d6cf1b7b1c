//! Database pool with split reader/writer connections in WAL mode.
//!
//! SQLite allows only one writer at a time. `DatabasePool` pairs a
//! multi-connection reader pool with a single-connection writer pool; every
//! store mutation goes through the writer. Multi-statement writes open
//! `BEGIN IMMEDIATE` transactions, so writers in other processes sharing the
//! file queue on the busy timeout.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Split read/write pool for SQLite with WAL mode.
///
/// - `reader`: up to 8 read-only connections.
/// - `writer`: one connection; transactions on it never interleave.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open both pools and run migrations on the writer.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let read_opts = base_opts.clone().read_only(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(base_opts)
            .await?;

        // The reader pool is read-only, so the schema must exist first.
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(read_opts)
            .await?;

        tracing::debug!(database_url, "database pool ready");
        Ok(Self { reader, writer })
    }
}

/// Database URL for the `kairos.db` file inside `data_dir`.
pub fn database_url_in(data_dir: &Path) -> String {
    format!("sqlite://{}", data_dir.join("kairos.db").display())
}

/// Returns the default database URL based on `KAIROS_DATA_DIR`,
/// falling back to `~/.kairos/kairos.db`.
pub fn default_database_url() -> String {
    database_url_in(&crate::config::default_data_dir())
}
