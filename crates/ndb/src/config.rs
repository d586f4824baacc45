//! Configuration file support for ndb
//!
//! Loads and validates ndb configuration from TOML files.
//! Default location: /etc/sonic/ndb.toml

use crate::error::{NdbError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sonic/ndb.toml";

/// Relational store implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Embedded SQLite, file-backed or `:memory:`
    #[default]
    Sqlite,
    /// Client-server PostgreSQL (requires the `postgres` feature)
    Postgres,
}

/// Store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Backend-specific connection spec: a path or `:memory:` for SQLite,
    /// a connection URL for PostgreSQL
    #[serde(default = "default_store_location")]
    pub location: String,
}

/// How to reach one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetSpec {
    /// The stack of the ndb process itself
    Local,
    /// A named network namespace
    Netns { path: String },
}

/// Complete ndb configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NdbConfig {
    /// Append every applied protocol message to the `rtnl_log` table
    #[serde(default)]
    pub verbose_protocol_log: bool,

    /// Interval between stale handle collections, in seconds
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,

    /// Upper bound on a single channel read, in milliseconds
    #[serde(default = "default_recv_timeout")]
    pub recv_timeout_ms: u64,

    #[serde(default)]
    pub store: StoreConfig,

    /// Named targets; empty means one local target named `localhost`
    #[serde(default)]
    pub targets: BTreeMap<String, TargetSpec>,
}

// Default functions
fn default_store_location() -> String {
    ":memory:".to_string()
}

fn default_gc_interval() -> u64 {
    60
}

fn default_recv_timeout() -> u64 {
    300
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            location: default_store_location(),
        }
    }
}

impl Default for NdbConfig {
    fn default() -> Self {
        Self {
            targets: BTreeMap::new(),
            store: StoreConfig::default(),
            verbose_protocol_log: false,
            gc_interval_secs: default_gc_interval(),
            recv_timeout_ms: default_recv_timeout(),
        }
    }
}

impl NdbConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content).map_err(|e| {
                NdbError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(NdbError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| NdbError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| NdbError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Use a SQLite store at `location` (a path or `:memory:`)
    pub fn with_sqlite(mut self, location: impl Into<String>) -> Self {
        self.store = StoreConfig {
            backend: StoreBackend::Sqlite,
            location: location.into(),
        };
        self
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.store.location.is_empty() {
            return Err(NdbError::Config("store.location must not be empty".to_string()));
        }

        if self.recv_timeout_ms == 0 {
            return Err(NdbError::Config("recv_timeout_ms must be > 0".to_string()));
        }

        for (name, spec) in &self.targets {
            if name.is_empty() {
                return Err(NdbError::Config("target names must not be empty".to_string()));
            }
            if let TargetSpec::Netns { path } = spec {
                if path.is_empty() {
                    return Err(NdbError::Config(format!(
                        "target {} has an empty netns path",
                        name
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = NdbConfig::default();
        assert!(config.targets.is_empty());
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.store.location, ":memory:");
        assert_eq!(config.gc_interval(), Duration::from_secs(60));
        assert_eq!(config.recv_timeout(), Duration::from_millis(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_str = r#"
verbose_protocol_log = true

[store]
backend = "postgres"
location = "postgres://ndb@localhost/ndb"

[targets.localhost]
kind = "local"

[targets.ns0]
kind = "netns"
path = "/var/run/netns/ns0"
"#;
        let config = NdbConfig::from_toml(toml_str).unwrap();
        assert!(config.verbose_protocol_log);
        assert_eq!(config.store.backend, StoreBackend::Postgres);
        assert_eq!(config.targets.len(), 2);
        assert_eq!(
            config.targets["ns0"],
            TargetSpec::Netns {
                path: "/var/run/netns/ns0".to_string()
            }
        );
        // Unspecified values should use defaults
        assert_eq!(config.gc_interval_secs, 60);
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = NdbConfig::default();
        config.recv_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_netns_path() {
        let mut config = NdbConfig::default();
        config.targets.insert(
            "ns0".to_string(),
            TargetSpec::Netns {
                path: String::new(),
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_nonexistent_file_defaults() {
        let config = NdbConfig::load_or_default("/nonexistent/ndb.toml").unwrap();
        assert_eq!(config, NdbConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ndb.toml");
        let config = NdbConfig::default().with_sqlite("/tmp/ndb.db");
        config.save(&path).unwrap();
        let loaded = NdbConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
