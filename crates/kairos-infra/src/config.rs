//! Site configuration loader for Kairos.
//!
//! Reads `config.toml` from the data directory (`~/.kairos/` by default)
//! and deserializes it into [`SiteConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use kairos_types::config::SiteConfig;

use crate::sqlite::pool::database_url_in;

/// Resolve the data directory.
///
/// Priority:
/// 1. `KAIROS_DATA_DIR` environment variable
/// 2. `~/.kairos`
/// 3. `./.kairos` when no home directory is known
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("KAIROS_DATA_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".kairos");
    }
    PathBuf::from(".kairos")
}

/// Load site configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`SiteConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
pub async fn load_site_config(data_dir: &Path) -> SiteConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %config_path.display(), "no config.toml found, using defaults");
            return SiteConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to read config, using defaults");
            return SiteConfig::default();
        }
    };

    match toml::from_str::<SiteConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to parse config, using defaults");
            SiteConfig::default()
        }
    }
}

/// The configured database URL, or `kairos.db` inside `data_dir`.
pub fn resolve_database_url(config: &SiteConfig, data_dir: &Path) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(|| database_url_in(data_dir))
}
