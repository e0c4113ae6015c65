//! CLI output: error mapping from domain errors to the CLI surface.

use crate::error::SyncError;

/// Map service errors to the line printed on stderr.
pub fn map_error(e: &SyncError) -> String {
    match e {
        SyncError::ConfigError(msg) => format!("configuration: {msg}"),
        SyncError::Persistence(msg) => format!("state database: {msg}"),
        SyncError::InvalidSnapshot(msg) => format!("saved identity map is unreadable: {msg}"),
        other => other.to_string(),
    }
}
