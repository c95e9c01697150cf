//! Configuration management for tradeflow
//!
//! Layers, lowest to highest precedence: built-in defaults, an optional YAML
//! file, `TRADEFLOW_` prefixed environment variables (`__` separates nested
//! keys, e.g. `TRADEFLOW_SOURCE__TOPIC`), and finally the legacy deployment
//! variables `KAFKA_SERVER`, `KAFKA_PORT`, `TOPIC` and `APP_NAME`.

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use processor::{ProcessorConfig, SourceConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Prefix of structured environment overrides
pub const ENV_PREFIX: &str = "TRADEFLOW_";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Service identity and schema
    #[serde(default)]
    pub service: ServiceConfig,

    /// Log connection
    #[serde(default)]
    pub source: SourceConfig,

    /// Engine settings
    #[serde(default)]
    pub processor: ProcessorConfig,

    /// Table storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Dead-letter output
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,

    /// Logging settings
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        Self::load_with(config_path.as_deref(), |name| std::env::var(name).ok())
    }

    /// Load configuration, resolving legacy variables through `lookup`
    pub fn load_with<F>(config_path: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

        if let Some(path) = config_path {
            if !path.exists() {
                return Err(ConfigError::LoadError(format!(
                    "configuration file {} not found",
                    path.display()
                )));
            }
            figment = figment.merge(Yaml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        for (key, value) in legacy_overrides(lookup) {
            figment = figment.merge(Serialized::default(key, value));
        }

        figment
            .extract()
            .map_err(|e| ConfigError::LoadError(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.service.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "service name must not be empty".to_string(),
            ));
        }

        self.source
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        self.processor
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        if self.storage.keyspace.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage keyspace must not be empty".to_string(),
            ));
        }

        if self.storage.backend == StorageBackend::Sled
            && self.storage.path.as_os_str().is_empty()
        {
            return Err(ConfigError::ValidationError(
                "sled storage requires a path".to_string(),
            ));
        }

        if self.dead_letter.max_file_size_mb == 0 {
            return Err(ConfigError::ValidationError(
                "dead_letter max_file_size_mb must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Legacy deployment variables mapped onto configuration keys
///
/// `KAFKA_SERVER` is only used together with `KAFKA_PORT`; `APP_NAME` names
/// both the service and the consumer identity.
pub fn legacy_overrides<F>(lookup: F) -> Vec<(&'static str, String)>
where
    F: Fn(&str) -> Option<String>,
{
    let mut overrides = Vec::new();

    if let (Some(server), Some(port)) = (lookup("KAFKA_SERVER"), lookup("KAFKA_PORT")) {
        overrides.push(("source.brokers", format!("{}:{}", server, port)));
    }
    if let Some(topic) = lookup("TOPIC") {
        overrides.push(("source.topic", topic));
    }
    if let Some(name) = lookup("APP_NAME") {
        overrides.push(("service.name", name.clone()));
        overrides.push(("source.group_id", name));
    }

    overrides
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Avro schema of the trade envelope; the bundled schema when unset
    #[serde(default)]
    pub schema_path: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            schema_path: None,
        }
    }
}

/// Table storage backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Sled,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend holding both tables
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,

    /// Database directory of durable backends
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// Namespace of the `trades` and `minute_trades` tables
    #[serde(default = "default_keyspace")]
    pub keyspace: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: default_storage_path(),
            keyspace: default_keyspace(),
        }
    }
}

/// Dead-letter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// Directory of JSON-lines files
    #[serde(default = "default_dead_letter_path")]
    pub path: PathBuf,

    /// Rotation size of a dead-letter file in megabytes
    #[serde(default = "default_dead_letter_file_size")]
    pub max_file_size_mb: u64,
}

impl DeadLetterConfig {
    /// Rotation size in bytes
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            path: default_dead_letter_path(),
            max_file_size_mb: default_dead_letter_file_size(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable structured JSON logging
    #[serde(default)]
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: false,
        }
    }
}

fn default_service_name() -> String {
    "tradeflow".to_string()
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Sled
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/tmp/tradeflow_store")
}

fn default_keyspace() -> String {
    "market".to_string()
}

fn default_dead_letter_path() -> PathBuf {
    PathBuf::from("/tmp/tradeflow_dead_letters")
}

fn default_dead_letter_file_size() -> u64 {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use processor::StartingOffsets;
    use std::collections::HashMap;
    use std::io::Write;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.source.topic, "market");
        assert_eq!(config.storage.keyspace, "market");
        assert_eq!(config.processor.window.size_ms, 60_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.storage.keyspace = String::new();
        assert!(config.validate().is_err());

        config.storage.keyspace = "market".to_string();
        config.dead_letter.max_file_size_mb = 0;
        assert!(config.validate().is_err());

        config.dead_letter.max_file_size_mb = 1;
        config.processor.max_batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "source:\n  brokers: \"kafka:9092\"\n  starting_offsets: latest\n\
             processor:\n  window:\n    allowed_lateness_ms: 5000\n\
             storage:\n  backend: memory"
        )
        .unwrap();

        let config = AppConfig::load_with(Some(file.path()), no_env).unwrap();
        assert_eq!(config.source.brokers, "kafka:9092");
        assert_eq!(config.source.starting_offsets, StartingOffsets::Latest);
        assert_eq!(config.processor.window.allowed_lateness_ms, 5000);
        assert_eq!(config.processor.window.size_ms, 60_000);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.service.name, "tradeflow");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = AppConfig::load_with(Some(Path::new("/nonexistent/tradeflow.yaml")), no_env);
        assert!(matches!(result, Err(ConfigError::LoadError(_))));
    }

    #[test]
    fn test_legacy_variables() {
        let vars: HashMap<&str, &str> = [
            ("KAFKA_SERVER", "broker"),
            ("KAFKA_PORT", "29092"),
            ("TOPIC", "trades"),
            ("APP_NAME", "minute-bars"),
        ]
        .into_iter()
        .collect();

        let config =
            AppConfig::load_with(None, |name| vars.get(name).map(|v| v.to_string())).unwrap();
        assert_eq!(config.source.brokers, "broker:29092");
        assert_eq!(config.source.topic, "trades");
        assert_eq!(config.source.group_id, "minute-bars");
        assert_eq!(config.service.name, "minute-bars");
    }

    #[test]
    fn test_server_without_port_is_ignored() {
        let overrides = legacy_overrides(|name| (name == "KAFKA_SERVER").then(|| "broker".to_string()));
        assert!(overrides.is_empty());
    }

    #[test]
    fn test_legacy_variables_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "source:\n  topic: from-file").unwrap();

        let config = AppConfig::load_with(Some(file.path()), |name| {
            (name == "TOPIC").then(|| "from-env".to_string())
        })
        .unwrap();
        assert_eq!(config.source.topic, "from-env");
    }
}
