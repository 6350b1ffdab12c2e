//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via TXNSVC_CONFIG or --config)
//! 3. Environment variables, including those read from a `.env` file by
//!    [`load_dotenv`]
//!
//! | Variable | Field |
//! |---|---|
//! | `TXNSVC_BIND` | `network.bind_addr` |
//! | `PORT` | port of `network.bind_addr` |
//! | `TXNSVC_IDLE_TIMEOUT` | `network.idle_timeout_secs` |
//! | `TXNSVC_MAX_CONNECTIONS` | `network.max_connections` |
//! | `TXNSVC_MAX_IN_FLIGHT` | `network.max_in_flight` |
//! | `DATABASE_URL` | `database.url` |
//! | `TXNSVC_DB_MAX_CONNECTIONS` | `database.max_connections` |
//! | `TXNSVC_DB_CONNECT_TIMEOUT` | `database.connect_timeout_secs` |
//! | `TXNSVC_SCHEMA_MODE` | `database.schema_mode` |
//! | `TXNSVC_METRICS_ENABLED` | `metrics.enabled` |
//! | `TXNSVC_METRICS_BIND` | `metrics.bind_addr` |

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use txnsvc_protocol::DEFAULT_PORT;
use txnsvc_store::{PgStoreConfig, SchemaMode};

/// Reads a `.env` file into the process environment. Variables that are
/// already set keep their values.
///
/// With no `path`, `.env` is looked up from the working directory upward.
/// Returns the loaded file, or `None` when there is none.
pub fn load_dotenv(path: Option<&Path>) -> Result<Option<PathBuf>, ConfigError> {
    let loaded = match path {
        Some(path) => dotenvy::from_path(path).map(|()| path.to_path_buf()),
        None => dotenvy::dotenv(),
    };
    match loaded {
        Ok(path) => Ok(Some(path)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(ConfigError::DotenvError(e)),
    }
}

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from the file named by `TXNSVC_CONFIG`, if any,
    /// then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var("TXNSVC_CONFIG") {
            Ok(path) => Self::load_from(path),
            Err(_) => {
                let config = Self::from_env();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Loads configuration from a YAML file, then applies environment
    /// variable overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary variable source.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        self.network.apply_overrides(&lookup);
        self.database.apply_overrides(&lookup);
        self.metrics.apply_overrides(&lookup);
    }

    /// Checks values that cannot be represented as invalid by their types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "network.max_connections must be at least 1".to_string(),
            ));
        }
        if self.network.max_in_flight == 0 {
            return Err(ConfigError::ValidationError(
                "network.max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "database.url must not be empty".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Parses `raw` into `target`, keeping the old value when it does not parse.
fn override_parsed<T: std::str::FromStr>(target: &mut T, key: &str, raw: Option<String>) {
    if let Some(raw) = raw {
        match raw.trim().parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!("Ignoring {}={:?}: not a valid value", key, raw),
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Idle connection timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum calls in progress on one connection.
    pub max_in_flight: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            idle_timeout_secs: 300,
            max_connections: 1000,
            max_in_flight: 64,
        }
    }
}

impl NetworkConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        override_parsed(&mut self.bind_addr, "TXNSVC_BIND", lookup("TXNSVC_BIND"));

        let mut port = self.bind_addr.port();
        override_parsed(&mut port, "PORT", lookup("PORT"));
        self.bind_addr.set_port(port);

        override_parsed(
            &mut self.idle_timeout_secs,
            "TXNSVC_IDLE_TIMEOUT",
            lookup("TXNSVC_IDLE_TIMEOUT"),
        );
        override_parsed(
            &mut self.max_connections,
            "TXNSVC_MAX_CONNECTIONS",
            lookup("TXNSVC_MAX_CONNECTIONS"),
        );
        override_parsed(
            &mut self.max_in_flight,
            "TXNSVC_MAX_IN_FLIGHT",
            lookup("TXNSVC_MAX_IN_FLIGHT"),
        );
    }

    /// Returns idle timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    pub url: String,
    /// Pool size. The default of one keeps a single persistent connection.
    pub max_connections: u32,
    /// Seconds to wait for a connection before failing a call.
    pub connect_timeout_secs: u64,
    /// What to do with the table at startup.
    pub schema_mode: SchemaMode,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/postgres".to_string(),
            max_connections: 1,
            connect_timeout_secs: 30,
            schema_mode: SchemaMode::default(),
        }
    }
}

impl DatabaseConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL") {
            if !url.trim().is_empty() {
                self.url = url;
            }
        }
        override_parsed(
            &mut self.max_connections,
            "TXNSVC_DB_MAX_CONNECTIONS",
            lookup("TXNSVC_DB_MAX_CONNECTIONS"),
        );
        override_parsed(
            &mut self.connect_timeout_secs,
            "TXNSVC_DB_CONNECT_TIMEOUT",
            lookup("TXNSVC_DB_CONNECT_TIMEOUT"),
        );
        override_parsed(
            &mut self.schema_mode,
            "TXNSVC_SCHEMA_MODE",
            lookup("TXNSVC_SCHEMA_MODE"),
        );
    }

    /// Returns the connect timeout as Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Builds the store settings for this configuration.
    pub fn store_config(&self) -> PgStoreConfig {
        PgStoreConfig::new(self.url.clone())
            .with_max_connections(self.max_connections)
            .with_acquire_timeout(self.connect_timeout())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether the metrics endpoint is served.
    pub enabled: bool,
    /// Address for the metrics HTTP server.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(enabled) = lookup("TXNSVC_METRICS_ENABLED") {
            self.enabled = parse_flag(&enabled);
        }
        override_parsed(
            &mut self.bind_addr,
            "TXNSVC_METRICS_BIND",
            lookup("TXNSVC_METRICS_BIND"),
        );
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {1}", path = .0.display())]
    IoError(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{path}': {1}", path = .0.display())]
    ParseError(PathBuf, String),

    #[error("failed to load .env file: {0}")]
    DotenvError(#[source] dotenvy::Error),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
