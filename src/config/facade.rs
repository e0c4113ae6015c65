//! Config loading entry point.

use super::merge::merge_policy;
use super::sources::{global_file, workspace_file};
use super::SyncConfig;
use crate::error::SyncError;
use config::{Config, Environment, File};
use std::path::Path;
use tracing::debug;

/// Loads [`SyncConfig`] from every layer.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Defaults, then the global file, then the workspace files, then `TREESYNC__*`
    /// environment variables (`TREESYNC__SCHEDULER__WORKERS=4`). The result is validated.
    pub fn load(workspace_root: &Path) -> Result<SyncConfig, SyncError> {
        let builder = merge_policy::builder_with_defaults()?;
        let builder = global_file::add_to_builder(builder)?;
        let builder = workspace_file::add_to_builder(builder, workspace_root)?;
        let builder = builder.add_source(Self::environment());
        Self::finish(builder.build()?)
    }

    /// Load a single file over the defaults, ignoring every other layer.
    pub fn load_from_file(path: &Path) -> Result<SyncConfig, SyncError> {
        if !path.exists() {
            return Err(SyncError::ConfigError(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        let settings = merge_policy::builder_with_defaults()?
            .add_source(File::from(path))
            .build()?;
        Self::finish(settings)
    }

    fn environment() -> Environment {
        Environment::with_prefix("TREESYNC")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("sync.ignored_properties")
    }

    fn finish(settings: Config) -> Result<SyncConfig, SyncError> {
        let config: SyncConfig = settings.try_deserialize()?;
        config.validate().map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            SyncError::ConfigError(format!("Invalid configuration: {}", messages.join("; ")))
        })?;
        debug!(
            workers = config.scheduler.workers,
            ignored = config.sync.ignored_properties.len(),
            "Configuration loaded"
        );
        Ok(config)
    }
}
