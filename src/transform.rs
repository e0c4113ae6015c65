//! Bulk Tree Transformer
//!
//! Materializes a whole module or model of one store in the other. Remote→local transforms
//! fan out over dependency modules, models and root subtrees as separate scheduler tasks and
//! join them before the reference-resolution pass of the entry module runs. Local→remote
//! transforms write the subtree in one remote transaction and resolve references before
//! committing it.

mod pull;
mod push;
mod references;

pub use pull::{find_model, find_module, transform_model, transform_module};
pub use push::{push_model, push_module};
pub use references::{PendingImport, ReferenceResolver, ResolutionReport, ResolvableReference};

pub(crate) use pull::{
    apply_model_import, apply_module_dependency, apply_reference, apply_used_language,
    create_local_node, local_location, read_used_language, LocalUsedLanguage, ModuleRun,
};
pub(crate) use push::{
    link_references, remote_target, write_language_dependency, write_model_import,
    write_module_dependency, write_subtree, UsedLanguage,
};

use crate::types::RemoteNodeId;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Result of a transform request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformOutcome {
    Transformed,
    /// Another run already materialized (or is materializing) the same module.
    AlreadySynchronized,
}

/// Module transforms currently running, by remote module node.
#[derive(Default)]
pub(crate) struct InFlightTransforms {
    modules: Mutex<HashMap<RemoteNodeId, ModuleRun>>,
}

impl InFlightTransforms {
    pub(crate) fn len(&self) -> usize {
        self.modules.lock().len()
    }
}
