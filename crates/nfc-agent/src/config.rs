use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use nfc_core::NfcConfig;

use crate::simulate::SimulationConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),
    #[error("config parse error: {0}")]
    ParseError(String),
    #[error("config validation error: {0}")]
    ValidationError(String),
}

impl From<nfc_core::ConfigError> for ConfigError {
    fn from(e: nfc_core::ConfigError) -> Self {
        match e {
            nfc_core::ConfigError::FileNotFound(msg) => ConfigError::FileNotFound(msg),
            nfc_core::ConfigError::ParseError(msg) => ConfigError::ParseError(msg),
            nfc_core::ConfigError::ValidationError(msg) => ConfigError::ValidationError(msg),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    // Logging
    pub log_level: String,
    pub log_json: bool,
    pub log_file: Option<PathBuf>,

    pub nfc: NfcConfig,

    // Simulated controller
    pub simulation: SimulationConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            log_file: None,
            nfc: NfcConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileNotFound(format!("{}: {}", path.display(), e)))?;

        let config: AgentConfig = toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn load_from_env() -> Self {
        let mut config = Self {
            nfc: NfcConfig::load_from_env(),
            ..Self::default()
        };

        if let Ok(level) = std::env::var("RUST_LOG") {
            config.log_level = level;
        }
        if let Ok(flag) = std::env::var("NFC_LOG_JSON") {
            config.log_json = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        if let Ok(path) = std::env::var("NFC_LOG_FILE") {
            config.log_file = Some(PathBuf::from(path));
        }

        if let Err(e) = config.validate() {
            warn!(error = %e, "environment configuration is invalid, using defaults");
            return Self::default();
        }
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.nfc.validate()?;
        self.simulation.validate()?;
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::ValidationError("log_level must not be empty".to_string()));
        }
        if let Some(path) = &self.log_file {
            if path.file_name().is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "log_file must name a file: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}
