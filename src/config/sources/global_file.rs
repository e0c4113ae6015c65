//! Global config file: `<config dir>/treesync/config.toml`.

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, File};
use std::path::PathBuf;
use tracing::warn;

/// Path of the user-level config file, when a home directory can be determined.
pub fn global_config_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.config_dir().join("treesync").join("config.toml"))
}

/// Add the global file to `builder` if it exists.
pub fn add_to_builder(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let Some(path) = global_config_path() else {
        return Ok(builder);
    };
    if !path.exists() {
        warn!(
            config_path = %path.display(),
            "No global configuration file; using defaults"
        );
        return Ok(builder);
    }
    let path = path.canonicalize().unwrap_or(path);
    Ok(builder.add_source(File::from(path).required(false)))
}
