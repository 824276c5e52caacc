//! Configuration for the patch engine
//!
//! A single TOML file, `configs/core.toml`, holds engine-level settings:
//! - `debug` raises the log level to DEBUG
//! - `strict` logs fallback anchor use at WARN instead of DEBUG
//! - `gamedata` names the anchors file under `gamedata/`
//!
//! A default file is written the first time it is loaded.

mod loader;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use loader::{base_dir, configs_dir, core_config_path, gamedata_path, BASE_DIR_ENV};

/// Configuration system errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read or write config file
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML content
    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to serialize config to TOML
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Could not determine config directory from module location
    #[error("Config directory not available - could not resolve module base path")]
    NoConfigDirectory,
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Core engine configuration.
///
/// Loaded from `<base>/configs/core.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Config version for future migration support
    pub version: u32,

    /// Enable debug logging
    pub debug: bool,

    /// Report fallback anchors loudly
    pub strict: bool,

    /// Anchors file name under `gamedata/`
    pub gamedata: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            version: 1,
            debug: false,
            strict: true,
            gamedata: "anchors.json".to_string(),
        }
    }
}

impl CoreConfig {
    /// Load core config from the default location, creating it if missing.
    pub fn load() -> ConfigResult<Self> {
        Self::load_from(core_config_path()?)
    }

    /// Save core config to the default location.
    pub fn save(&self) -> ConfigResult<()> {
        self.save_to(core_config_path()?)
    }

    /// Reload core config from the default location.
    pub fn reload(&mut self) -> ConfigResult<()> {
        self.reload_from(core_config_path()?)
    }

    /// Load from an explicit path, creating a default file if missing.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            tracing::debug!("Loaded core config from {:?}", path);
            Ok(config)
        } else {
            let default = Self::default();
            default.save_to(path)?;
            tracing::info!("Created default core config at {:?}", path);
            Ok(default)
        }
    }

    /// Save to an explicit path, creating parent directories.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::debug!("Saved core config to {:?}", path);
        Ok(())
    }

    /// Reload from an explicit path.
    pub fn reload_from<P: AsRef<Path>>(&mut self, path: P) -> ConfigResult<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        *self = toml::from_str(&content)?;
        tracing::debug!("Reloaded core config from {:?}", path);
        Ok(())
    }

    /// Log level matching `debug`
    pub fn log_level(&self) -> tracing::Level {
        if self.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
