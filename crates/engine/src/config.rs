//! Service configuration

use anyhow::Result;
use engine_lib::EngineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default configuration file, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "crop-engine.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Port of the HTTP API, health and metrics server
    pub api_port: u16,

    /// JSON array of price observations loaded at startup
    pub data_file: Option<PathBuf>,

    /// JSON crop catalog; the built-in catalog is used when unset
    pub catalog_file: Option<PathBuf>,

    /// Interval between scheduled retraining rounds
    pub retrain_interval_secs: u64,

    /// Train the scheduled kinds once before serving
    pub train_on_startup: bool,

    pub engine: EngineConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_port: 8080,
            data_file: None,
            catalog_file: None,
            retrain_interval_secs: 24 * 60 * 60,
            train_on_startup: true,
            engine: EngineConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load from `crop-engine.toml` (optional) and `ENGINE__*` environment variables
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("ENGINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.engine.validate()?;
        Ok(config)
    }
}
