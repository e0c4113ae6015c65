//! Workspace config files: `config/config.toml`, then `config/{TREESYNC_ENV}.toml`.

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, File};
use std::path::Path;

const DEFAULT_ENV: &str = "development";

/// Add the workspace files that exist under `workspace_root`.
pub fn add_to_builder(
    mut builder: ConfigBuilder<DefaultState>,
    workspace_root: &Path,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let config_dir = workspace_root.join("config");
    let env_name = std::env::var("TREESYNC_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());

    for path in [
        config_dir.join("config.toml"),
        config_dir.join(format!("{env_name}.toml")),
    ] {
        if path.exists() {
            builder = builder.add_source(File::from(path).required(false));
        }
    }
    Ok(builder)
}
