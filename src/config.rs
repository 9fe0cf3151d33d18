//! Configuration for shapes-memory

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for the memory system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for snapshot storage
    pub data_dir: PathBuf,

    /// Maximum short-term entries kept per personality (<= 0 keeps none)
    pub short_term_limit: i64,

    /// Maximum long-term entries kept per personality (<= 0 keeps none)
    pub long_term_limit: i64,

    /// Retention window in days for recency decay and the age sweep
    pub retention_days: i64,

    /// Seconds between periodic retention sweeps
    pub sweep_interval_secs: u64,

    /// Number of results returned by a query when the caller does not say
    pub default_max_results: usize,

    /// Snapshot ledgers to SQLite on shutdown and restore them on startup
    pub persistence_enabled: bool,

    /// HTTP server port
    pub server_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("shapes-memory");

        Self {
            data_dir,
            short_term_limit: 50,
            long_term_limit: 200,
            retention_days: 30,
            sweep_interval_secs: 3600, // hourly
            default_max_results: 5,
            persistence_enabled: false,
            server_port: 8430,
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load a config from a JSON file. A missing file yields the defaults;
    /// missing fields fall back to their defaults individually.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))
    }

    /// Load from `SHAPES_MEMORY_CONFIG` (if set) and then apply
    /// `SHAPES_MEMORY_*` environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("SHAPES_MEMORY_CONFIG") {
            Ok(path) => Self::load(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = get("SHAPES_MEMORY_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = get("SHAPES_MEMORY_SHORT_TERM_LIMIT") {
            self.short_term_limit = parse_var("SHAPES_MEMORY_SHORT_TERM_LIMIT", &v)?;
        }
        if let Some(v) = get("SHAPES_MEMORY_LONG_TERM_LIMIT") {
            self.long_term_limit = parse_var("SHAPES_MEMORY_LONG_TERM_LIMIT", &v)?;
        }
        if let Some(v) = get("SHAPES_MEMORY_RETENTION_DAYS") {
            self.retention_days = parse_var("SHAPES_MEMORY_RETENTION_DAYS", &v)?;
        }
        if let Some(v) = get("SHAPES_MEMORY_SWEEP_INTERVAL_SECS") {
            self.sweep_interval_secs = parse_var("SHAPES_MEMORY_SWEEP_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("SHAPES_MEMORY_PERSISTENCE") {
            self.persistence_enabled = parse_var("SHAPES_MEMORY_PERSISTENCE", &v)?;
        }
        if let Some(v) = get("SHAPES_MEMORY_PORT") {
            self.server_port = parse_var("SHAPES_MEMORY_PORT", &v)?;
        }
        Ok(())
    }

    /// Interval between retention sweeps
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Get the path to the SQLite snapshot database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("memory.db")
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::config(format!("{}={:?}: {}", key, value, e)))
}
