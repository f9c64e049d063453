//! YAML persistence for configuration structs
//!
//! Loading never fails: a missing or unreadable file yields `T::default()`
//! so the engine can always start. Saving reports errors to the caller.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Read `path` as YAML, falling back to defaults
///
/// Fields absent from the file keep their `Default` values when `T` is
/// annotated with `#[serde(default)]`.
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    if !path.is_file() {
        log::info!("No config at {}, using defaults", path.display());
        return T::default();
    }

    read_yaml(path).unwrap_or_else(|err| {
        log::warn!("Ignoring config: {:#}", err);
        T::default()
    })
}

/// Write `config` to `path` as YAML, creating missing parent directories
pub fn save_config<T: Serialize>(config: &T, path: &Path) -> Result<()> {
    let dir = path.parent().filter(|dir| !dir.as_os_str().is_empty());
    if let Some(dir) = dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }

    let text = serde_yaml::to_string(config).context("serializing config")?;
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
    log::debug!("Saved config to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, StopPolicy};

    #[test]
    fn test_load_nonexistent_returns_default() {
        let config: EngineConfig = load_config(Path::new("/nonexistent/path/engine.yaml"));
        assert_eq!(config.sample_rate, EngineConfig::default().sample_rate);
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.yaml");

        let config = EngineConfig {
            sample_rate: 44100,
            stop_policy: StopPolicy::RetainPosition,
            ..Default::default()
        };

        save_config(&config, &path).unwrap();
        let loaded: EngineConfig = load_config(&path);

        assert_eq!(loaded.sample_rate, 44100);
        assert_eq!(loaded.stop_policy, StopPolicy::RetainPosition);
    }

    #[test]
    fn test_invalid_yaml_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "sample_rate: [not, a, number]").unwrap();

        let loaded: EngineConfig = load_config(&path);
        assert_eq!(loaded.sample_rate, EngineConfig::default().sample_rate);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "block_size: 256\ndropout:\n  reduce_after: 2\n").unwrap();

        let loaded: EngineConfig = load_config(&path);
        assert_eq!(loaded.block_size, 256);
        assert_eq!(loaded.dropout.reduce_after, 2);
        assert_eq!(loaded.dropout.restore_after, EngineConfig::default().dropout.restore_after);
    }
}
