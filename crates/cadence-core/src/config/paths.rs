//! Where configuration files live by default

use std::path::PathBuf;

const APP_DIR: &str = "cadence";

/// Per-user configuration directory for the engine
///
/// Resolves to the platform config dir (e.g. `~/.config/cadence`), then the
/// home directory, then the working directory.
pub fn default_config_dir() -> PathBuf {
    let base = dirs::config_dir().or_else(dirs::home_dir);
    base.unwrap_or_default().join(APP_DIR)
}

pub fn default_config_path(file_name: &str) -> PathBuf {
    default_config_dir().join(file_name)
}
