//! Error types for the synchronization engine.

use crate::scheduler::SyncDirection;
use thiserror::Error;

/// Failures reported by the store collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Unknown listener: {0}")]
    UnknownListener(u64),

    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("Version not found: {0}")]
    VersionNotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Synchronization errors
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("Mapping inconsistency: {0}")]
    MappingInconsistency(String),

    #[error("Identity conflict: {0}")]
    IdentityConflict(String),

    #[error("Identity map is not empty, clear it before deserializing")]
    MapNotEmpty,

    #[error("Invalid serialized identity map: {0}")]
    InvalidSnapshot(String),

    #[error("Connection failure: {message}: {cause}")]
    ConnectionFailure { message: String, cause: String },

    #[error("Not connected to a remote branch")]
    NotConnected,

    #[error("Deactivation of {binding} failed: {cause}")]
    DeactivationFailed { binding: String, cause: String },

    #[error("{0} cannot be removed, because not all of its model bindings have been removed")]
    BindingNotEmpty(String),

    #[error("Binding conflict: {0}")]
    BindingConflict(String),

    #[error("Unknown concept: {0}")]
    UnknownConcept(String),

    #[error("Parent of node {0} is not found")]
    ParentNotFound(String),

    #[error("{0} already exists on the remote store, therefore it will not be synchronized again")]
    AlreadyOnRemote(String),

    #[error("Task rejected while a {running:?} task is running on this thread")]
    EchoSuppressed { running: SyncDirection },

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error("Scheduler is not running")]
    SchedulerStopped,

    #[error("Timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("Synchronization session is closed")]
    SessionClosed,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Restore failed: {0}")]
    RestoreFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl SyncError {
    pub fn connection(message: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        SyncError::ConnectionFailure {
            message: message.into(),
            cause: cause.to_string(),
        }
    }

    pub fn mapping(message: impl Into<String>) -> Self {
        SyncError::MappingInconsistency(message.into())
    }

    /// Echo suppression is expected traffic, not a failure worth surfacing.
    pub fn is_echo(&self) -> bool {
        matches!(self, SyncError::EchoSuppressed { .. })
    }
}

impl From<config::ConfigError> for SyncError {
    fn from(err: config::ConfigError) -> Self {
        SyncError::ConfigError(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

impl From<sled::Error> for SyncError {
    fn from(err: sled::Error) -> Self {
        SyncError::Persistence(err.to_string())
    }
}
