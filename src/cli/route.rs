//! CLI route: run context and the single dispatch table.

use super::parse::{Commands, ConfigCommands, MapCommands, StateCommands};
use super::presentation::{format_config, format_map, format_state};
use crate::config::{ConfigLoader, SyncConfig};
use crate::error::SyncError;
use crate::identity::IdentityMapSnapshot;
use crate::persistence::StateStore;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Workspace, effective configuration and the resolved state database path.
pub struct RunContext {
    config: SyncConfig,
    state_path: PathBuf,
}

impl RunContext {
    /// Load the configuration for `workspace_root`; `state_override` replaces
    /// `persistence.state_path`. Relative paths are taken from the workspace root.
    pub fn new(workspace_root: &Path, state_override: Option<PathBuf>) -> Result<Self, SyncError> {
        let config = ConfigLoader::load(workspace_root)?;
        Ok(Self::with_config(config, workspace_root, state_override))
    }

    pub fn with_config(
        config: SyncConfig,
        workspace_root: &Path,
        state_override: Option<PathBuf>,
    ) -> Self {
        let state_path = state_override.unwrap_or_else(|| config.persistence.state_path.clone());
        let state_path = if state_path.is_relative() {
            workspace_root.join(state_path)
        } else {
            state_path
        };
        debug!(state_path = %state_path.display(), "Resolved state database");
        Self { config, state_path }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn execute(&self, command: &Commands) -> Result<String, SyncError> {
        match command {
            Commands::State { command } => match command {
                StateCommands::Show { format } => {
                    let state = self.open_state()?.load()?;
                    format_state(state.as_ref(), *format)
                }
                StateCommands::Clear => {
                    self.open_state()?.clear()?;
                    info!(state_path = %self.state_path.display(), "Cleared saved state");
                    Ok("Saved session state cleared.".to_string())
                }
            },
            Commands::Map { command } => match command {
                MapCommands::Show { format } => {
                    let snapshot = match self.open_state()?.load()? {
                        Some(state) if !state.serialized_identity_map.trim().is_empty() => {
                            IdentityMapSnapshot::decode(&state.serialized_identity_map)?
                        }
                        _ => IdentityMapSnapshot::default(),
                    };
                    format_map(&snapshot, *format)
                }
            },
            Commands::Config { command } => match command {
                ConfigCommands::Show => format_config(&self.config),
            },
        }
    }

    fn open_state(&self) -> Result<StateStore, SyncError> {
        StateStore::open(&self.state_path)
    }
}
