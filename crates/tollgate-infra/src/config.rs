//! Configuration loader for Tollgate.
//!
//! Reads `config.toml` from the data directory (`~/.tollgate/` unless
//! `TOLLGATE_DATA_DIR` says otherwise) into [`TollgateConfig`]. A missing or
//! malformed file yields the defaults.

use std::path::{Path, PathBuf};

use tollgate_types::config::TollgateConfig;

use crate::sqlite::default_database_url;

/// Data directory from `TOLLGATE_DATA_DIR`, falling back to `~/.tollgate`.
pub fn default_data_dir() -> PathBuf {
    match std::env::var("TOLLGATE_DATA_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tollgate"),
    }
}

/// Load configuration from `{data_dir}/config.toml`.
///
/// - Missing file: defaults.
/// - Unreadable or unparsable file: a warning, then defaults.
pub async fn load_config(data_dir: &Path) -> TollgateConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return TollgateConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return TollgateConfig::default();
        }
    };

    match toml::from_str::<TollgateConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            TollgateConfig::default()
        }
    }
}

/// The configured checkpoint database, or `tollgate.db` inside `data_dir`.
pub fn resolve_database_url(config: &TollgateConfig, data_dir: &Path) -> String {
    config
        .store
        .database_url
        .clone()
        .unwrap_or_else(|| default_database_url(data_dir))
}
