//! Configuration System
//!
//! Layered configuration for the data layer: defaults, an optional config
//! file, and `BRAID_` environment overrides, in that priority order
//! (lowest to highest). Validated before use.

use crate::cid::CidConfig;
use crate::error::ConfigError;
use crate::logging::LoggingConfig;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BraidConfig {
    /// Backend that receives writes when no explicit target is given
    pub default_backend: String,

    /// Path of the sled-backed local cache
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,

    /// Identity stamped on created perspectives and commits
    #[serde(default = "default_creator_id")]
    pub creator_id: String,

    /// Backend adapter configurations, keyed by backend id
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Per-backend adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Adapter kind ("memory", "eth", "ipfs", "rest", ...); selecting and
    /// constructing the adapter is the composition root's job
    pub kind: String,

    /// Transport endpoint, when the adapter kind needs one
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Id configuration native to this backend
    #[serde(default)]
    pub cid_config: CidConfig,
}

fn default_cache_path() -> PathBuf {
    PathBuf::from(".braid/cache")
}

fn default_creator_id() -> String {
    "anonymous".to_string()
}

impl Default for BraidConfig {
    fn default() -> Self {
        Self {
            default_backend: "local".to_string(),
            cache_path: default_cache_path(),
            creator_id: default_creator_id(),
            backends: HashMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl BraidConfig {
    /// Load configuration: defaults, then `path` (if given and present),
    /// then `BRAID_`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("default_backend", "local")?
            .set_default("cache_path", default_cache_path().to_string_lossy().as_ref())?
            .set_default("creator_id", default_creator_id())?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }

        builder = builder.add_source(Environment::with_prefix("BRAID").separator("__"));

        let config: BraidConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_backend.is_empty() {
            return Err(ConfigError::Invalid(
                "default_backend cannot be empty".to_string(),
            ));
        }
        if self.cache_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("cache_path cannot be empty".to_string()));
        }
        if !self.backends.is_empty() && !self.backends.contains_key(&self.default_backend) {
            return Err(ConfigError::Invalid(format!(
                "default_backend '{}' is not a configured backend",
                self.default_backend
            )));
        }
        for (name, backend) in &self.backends {
            if backend.kind.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "backend '{name}' has an empty kind"
                )));
            }
        }
        Ok(())
    }
}
