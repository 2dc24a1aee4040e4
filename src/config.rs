//! Engine configuration.
//!
//! Loaded from a TOML file with environment-variable overrides. The `init`
//! subcommand writes a commented default file next to the cache directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_worker_count() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_fetch_limit() -> usize {
    100
}

fn default_cache_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".logsift")
        .join("logs")
}

/// Scan engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the CI provider; build metadata lives at `<base>/<build_num>`.
    pub ci_base_url: String,

    /// PostgreSQL DSN.
    pub database_url: String,

    /// Root of the on-disk log cache.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Bounded worker pool size for the per-build loop.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Per-request timeout for CI metadata and log downloads, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Default cap on unvisited builds per batch.
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,
}

impl Config {
    /// Load configuration from a TOML file, then apply env overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.apply_env();
        Ok(config)
    }

    /// Environment variables win over file values so deployments can keep
    /// credentials out of the config file.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("LOGSIFT_DATABASE_URL") {
            self.database_url = url;
        }
        if let Ok(url) = std::env::var("LOGSIFT_CI_BASE_URL") {
            self.ci_base_url = url;
        }
        if let Ok(dir) = std::env::var("LOGSIFT_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
    }

    /// Write a commented default configuration if none exists yet.
    pub fn write_default(path: &Path) -> Result<()> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let default_config = r#"# logsift configuration

# Base URL of the CI provider. Build metadata is fetched from
# <ci_base_url>/<build_num>.
ci_base_url = "https://circleci.com/api/v1.1/project/github/org/repo"

# PostgreSQL DSN. Overridden by LOGSIFT_DATABASE_URL.
database_url = "postgres://logsift@localhost/logsift"

# Root directory for cached console logs.
# cache_dir = "/var/lib/logsift/logs"

# Workers for the per-build loop (each holds at most one DB connection).
worker_count = 4

# Per-request timeout for metadata and log downloads.
request_timeout_secs = 30

# Default cap on unvisited builds processed per batch.
fetch_limit = 100
"#;
        std::fs::write(path, default_config)
            .with_context(|| format!("failed to write default config {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config: Config = toml::from_str(
            r#"
            ci_base_url = "http://ci.example.com"
            database_url = "postgres://localhost/test"
            "#,
        )
        .unwrap();

        assert_eq!(config.worker_count, 4);
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.fetch_limit, 100);
    }

    #[test]
    fn test_default_file_round_trips() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("config.toml");

        Config::write_default(&path).unwrap();
        let config = Config::load(&path).unwrap();

        assert!(config.ci_base_url.starts_with("https://"));
        assert_eq!(config.worker_count, 4);
    }

    #[test]
    fn test_write_default_keeps_existing() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("config.toml");

        std::fs::write(&path, "ci_base_url = \"x\"\ndatabase_url = \"y\"\n").unwrap();
        Config::write_default(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw, "ci_base_url = \"x\"\ndatabase_url = \"y\"\n");
    }
}
