//! Configuration
//!
//! Layered configuration: built-in defaults, the global file, the workspace files and
//! `TREESYNC__SECTION__KEY` environment variables, later layers winning. See [`ConfigLoader`].

use crate::context::SyncSettings;
use crate::logging::LoggingConfig;
use crate::scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

mod facade;
mod merge;
mod sources;

pub use facade::ConfigLoader;
pub use sources::global_file::global_config_path;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub sync: SyncSection,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// What gets copied between the stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSection {
    /// Properties never copied in either direction
    #[serde(default = "default_ignored_properties")]
    pub ignored_properties: Vec<String>,
}

fn default_ignored_properties() -> Vec<String> {
    vec!["virtualPackage".to_string(), "stereotype".to_string()]
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            ignored_properties: default_ignored_properties(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Directory of the session state database
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
}

fn default_state_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "treesync")
        .map(|dirs| dirs.data_dir().join("state"))
        .unwrap_or_else(|| PathBuf::from(".treesync/state"))
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
        }
    }
}

/// Default connection target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Scheduler(String),
    Sync(String),
    Persistence(String),
    Remote(String),
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Scheduler(msg) => write!(f, "Scheduler: {}", msg),
            ValidationError::Sync(msg) => write!(f, "Sync: {}", msg),
            ValidationError::Persistence(msg) => write!(f, "Persistence: {}", msg),
            ValidationError::Remote(msg) => write!(f, "Remote: {}", msg),
            ValidationError::Logging(msg) => write!(f, "Logging: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl SyncConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.scheduler.workers == 0 {
            errors.push(ValidationError::Scheduler(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.scheduler.edit_channel_capacity == 0 {
            errors.push(ValidationError::Scheduler(
                "edit_channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.scheduler.poll_interval_ms == 0 {
            errors.push(ValidationError::Scheduler(
                "poll_interval_ms must be positive".to_string(),
            ));
        }

        if self
            .sync
            .ignored_properties
            .iter()
            .any(|p| p.trim().is_empty())
        {
            errors.push(ValidationError::Sync(
                "ignored_properties cannot contain blank names".to_string(),
            ));
        }

        if self.persistence.state_path.as_os_str().is_empty() {
            errors.push(ValidationError::Persistence(
                "state_path cannot be empty".to_string(),
            ));
        }

        // a partial target cannot be connected to
        let remote = [
            &self.remote.server_url,
            &self.remote.repository,
            &self.remote.branch,
        ];
        let given = remote.iter().filter(|v| v.is_some()).count();
        if given != 0 && given != remote.len() {
            errors.push(ValidationError::Remote(
                "server_url, repository and branch must be given together".to_string(),
            ));
        }

        if !["json", "text"].contains(&self.logging.format.as_str()) {
            errors.push(ValidationError::Logging(format!(
                "unknown format '{}'",
                self.logging.format
            )));
        }
        if !["stdout", "stderr", "file"].contains(&self.logging.output.as_str()) {
            errors.push(ValidationError::Logging(format!(
                "unknown output '{}'",
                self.logging.output
            )));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Session settings for [`SyncContext`](crate::context::SyncContext).
    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            ignored_properties: self
                .sync
                .ignored_properties
                .iter()
                .cloned()
                .collect::<BTreeSet<_>>(),
            edit_channel_capacity: self.scheduler.edit_channel_capacity,
            poll_interval: Duration::from_millis(self.scheduler.poll_interval_ms),
        }
    }

    /// Effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, crate::error::SyncError> {
        toml::to_string_pretty(self).map_err(|e| {
            crate::error::SyncError::ConfigError(format!("Failed to render config: {}", e))
        })
    }
}
