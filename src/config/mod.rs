//! Node configuration.
//!
//! Aggregates the configuration of every module into a single [`Config`]
//! loaded from YAML files and environment variables.

use serde::Deserialize;

use crate::dispatcher::{DispatcherConfig, DispatcherMode};
use crate::node::NodeConfig;
use crate::stream::ProcessingConfig;
use crate::transport::MessagingConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "KEEL_CONFIG";
/// Prefix for configuration environment variables, e.g.
/// `KEEL__MESSAGING__PORT=26502`.
pub const CONFIG_ENV_PREFIX: &str = "KEEL";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "KEEL_LOG";

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main node configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log buffer and dispatcher.
    pub dispatcher: DispatcherConfig,
    /// Stream processor.
    pub processing: ProcessingConfig,
    /// Cluster messaging transport.
    pub messaging: MessagingConfig,
    /// Node wiring.
    pub node: NodeConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `KEEL_CONFIG` environment variable (if set)
    /// 4. Environment variables with `KEEL__` prefix and `__` separators
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("messaging.interfaces")
                    .with_list_parse_key("node.peers")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-section checks the individual sections cannot make.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.export_records && self.dispatcher.mode != DispatcherMode::Pipeline {
            return Err(ConfigError::Invalid(
                "node.export_records requires dispatcher.mode = pipeline".to_string(),
            ));
        }
        if self.messaging.connection_pool_size == 0 {
            return Err(ConfigError::Invalid(
                "messaging.connection_pool_size must be at least 1".to_string(),
            ));
        }
        if self.messaging.cluster_id.is_empty() {
            return Err(ConfigError::Invalid(
                "messaging.cluster_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Create config for testing: ephemeral port, small log.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.messaging.port = 0;
        config.dispatcher.partition_size = 64 * 1024;
        config
    }
}
