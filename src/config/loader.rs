// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{EngineConfig, RawEngineConfig};
use crate::errors::Result;

/// Load an engine configuration file and return the raw `RawEngineConfig`.
///
/// This only performs TOML deserialization; use [`load_and_validate`] for
/// duration parsing and sanity checks.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawEngineConfig> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawEngineConfig = toml::from_str(&contents)?;

    Ok(config)
}

/// Load an engine configuration file from path and validate it.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<EngineConfig> {
    let raw_config = load_from_path(&path)?;
    let config = EngineConfig::try_from(raw_config)?;
    Ok(config)
}

/// Load the config at `path`, falling back to defaults when the file is the
/// implicit default path and does not exist.
///
/// An explicitly requested file that is missing is still an error.
pub fn load_or_default(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(p) => load_and_validate(p),
        None => {
            let default_path = default_config_path();
            if default_path.is_file() {
                load_and_validate(&default_path)
            } else {
                debug!(path = ?default_path, "no engine config found; using defaults");
                EngineConfig::try_from(RawEngineConfig::default())
            }
        }
    }
}

/// Default engine config location: `Convergent.toml` in the working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Convergent.toml")
}
