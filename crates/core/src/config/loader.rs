//! Config path resolution
//!
//! Handles resolving paths for configuration and gamedata files based on
//! the module's location.

use std::path::PathBuf;

use super::{ConfigError, ConfigResult};

/// Environment variable that overrides the base directory
pub const BASE_DIR_ENV: &str = "ILSPLICE_HOME";

/// Returns the ilsplice base directory.
///
/// `ILSPLICE_HOME` wins when set. Otherwise the module is expected under
/// `<base>/bin/`, and this navigates up one level from its directory.
pub fn base_dir() -> ConfigResult<PathBuf> {
    if let Some(home) = std::env::var_os(BASE_DIR_ENV) {
        return Ok(PathBuf::from(home));
    }

    let exe = std::env::current_exe().map_err(ConfigError::IoError)?;

    // Navigate: module -> bin -> base
    exe.parent() // bin/
        .and_then(|p| p.parent()) // base/
        .map(PathBuf::from)
        .ok_or(ConfigError::NoConfigDirectory)
}

/// Returns the configs directory.
///
/// Path: `<base>/configs/`
pub fn configs_dir() -> ConfigResult<PathBuf> {
    Ok(base_dir()?.join("configs"))
}

/// Returns the core config path.
///
/// Path: `<base>/configs/core.toml`
pub fn core_config_path() -> ConfigResult<PathBuf> {
    Ok(configs_dir()?.join("core.toml"))
}

/// Returns the path of a gamedata file.
///
/// Path: `<base>/gamedata/{file_name}`
pub fn gamedata_path(file_name: &str) -> ConfigResult<PathBuf> {
    Ok(base_dir()?.join("gamedata").join(file_name))
}
