//! Treesync: bidirectional synchronization of model trees
//!
//! Keeps an editable local tree of modules, models and nodes consistent with a replicated
//! remote tree on a model server. A bulk transformer mirrors whole modules or models in
//! either direction; afterwards two incremental propagators carry single edits across. All
//! work runs as tasks on a lock-aware [`scheduler`], and the [`identity`] map records which
//! local entity corresponds to which remote node.

pub mod binding;
pub mod cli;
pub mod concept;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod identity;
pub mod logging;
pub mod notify;
pub mod persistence;
pub mod propagate;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod transform;
pub mod types;

pub use config::{ConfigLoader, SyncConfig};
pub use context::{SyncContext, SyncSettings};
pub use error::{StoreError, SyncError};
pub use identity::IdentityMap;
pub use scheduler::{Scheduler, SchedulerConfig, SyncDirection, TaskHandle};
pub use service::SyncService;
