//! Service configuration

use anyhow::{Context, Result};
use matcher_lib::config::EngineConfig;
use serde::Deserialize;
use std::path::PathBuf;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "MATCHER_CONFIG";

/// Matcher service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MatcherConfig {
    /// Instance name used in structured logs
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// API server port for intents, offers, health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Directory for persisted scoring parameters; learning is not persisted when unset
    #[serde(default)]
    pub parameter_dir: Option<PathBuf>,

    #[serde(default = "default_parameter_versions_to_keep")]
    pub parameter_versions_to_keep: usize,
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "intent-matcher".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_parameter_versions_to_keep() -> usize {
    10
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            api_port: default_api_port(),
            engine: EngineConfig::default(),
            parameter_dir: None,
            parameter_versions_to_keep: default_parameter_versions_to_keep(),
        }
    }
}

impl MatcherConfig {
    /// Load configuration from an optional file, then the environment
    ///
    /// Nested keys use `__`, e.g. `MATCHER_ENGINE__FEEDBACK__BATCH_SIZE=32`.
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from);
        Self::load_from(file)
    }

    pub fn load_from(file: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = &file {
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("MATCHER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| match &file {
                Some(path) => format!("failed to read configuration from {}", path.display()),
                None => "failed to read configuration from the environment".to_string(),
            })?;

        config
            .try_deserialize()
            .context("invalid matcher configuration")
    }
}
