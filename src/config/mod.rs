//! Configuration module
//!
//! Handles loading the uploader configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::protocol::DEFAULT_PORT;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkSettings,

    /// Upload settings
    #[serde(default)]
    pub upload: UploadSettings,
}

/// General configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

/// Network configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSettings {
    /// Port the device's OTA listener uses
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connection timeout in ms (absent = wait indefinitely)
    pub connect_timeout_ms: Option<u64>,
    /// Per-response timeout in ms (absent = wait indefinitely)
    pub read_timeout_ms: Option<u64>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            connect_timeout_ms: None,
            read_timeout_ms: None,
        }
    }
}

/// Upload configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadSettings {
    /// Also require `OK` from the end command
    #[serde(default)]
    pub strict_finalize: bool,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("ota-upload/config.toml")),
            Some(PathBuf::from("./ota-upload.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }
}
