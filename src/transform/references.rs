//! Deferred references of the remote→local direction.
//!
//! While a tree is being materialized locally, a reference whose remote target has no local
//! counterpart yet is recorded as a `(source, role, target)` triple. The resolution pass sets
//! every triple whose target has been mapped since and keeps the others for a later pass.

use crate::error::SyncError;
use crate::identity::IdentityMap;
use crate::store::LocalRepository;
use crate::types::{LocalNodeId, ModelId, RemoteNodeId};
use parking_lot::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvableReference {
    pub source: LocalNodeId,
    pub role: String,
    pub target: RemoteNodeId,
}

/// Model import whose target model was not mapped when the import was read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingImport {
    pub model: ModelId,
    pub import_node: RemoteNodeId,
    pub target: RemoteNodeId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionReport {
    pub resolved: usize,
    pub unresolved: usize,
    pub failed: usize,
}

#[derive(Default)]
pub struct ReferenceResolver {
    references: Mutex<Vec<ResolvableReference>>,
    imports: Mutex<Vec<PendingImport>>,
}

impl ReferenceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer(&self, reference: ResolvableReference) {
        debug!(
            source = %reference.source,
            role = %reference.role,
            target = %reference.target,
            "Deferred reference"
        );
        self.references.lock().push(reference);
    }

    pub fn defer_import(&self, import: PendingImport) {
        debug!(model = %import.model, target = %import.target, "Deferred model import");
        self.imports.lock().push(import);
    }

    pub fn pending_references(&self) -> Vec<ResolvableReference> {
        self.references.lock().clone()
    }

    pub fn pending_imports(&self) -> Vec<PendingImport> {
        self.imports.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.references.lock().is_empty() && self.imports.lock().is_empty()
    }

    pub fn clear(&self) {
        self.references.lock().clear();
        self.imports.lock().clear();
    }

    /// Set every pending reference and import whose target is mapped now.
    ///
    /// Entries whose source disappeared are dropped.
    pub fn resolve(
        &self,
        identity: &IdentityMap,
        local: &dyn LocalRepository,
    ) -> ResolutionReport {
        let mut report = ResolutionReport::default();

        let references = std::mem::take(&mut *self.references.lock());
        let mut kept = Vec::new();
        for reference in references {
            if local.node(&reference.source).is_none() {
                continue;
            }
            let Some(target) = identity.get_local(reference.target) else {
                kept.push(reference);
                continue;
            };
            match local.set_reference(&reference.source, &reference.role, Some(&target)) {
                Ok(()) => report.resolved += 1,
                Err(err) => {
                    warn!(
                        source = %reference.source,
                        role = %reference.role,
                        error = %err,
                        "Failed to set deferred reference"
                    );
                    report.failed += 1;
                }
            }
        }
        report.unresolved += kept.len();
        self.references.lock().extend(kept);

        let imports = std::mem::take(&mut *self.imports.lock());
        let mut kept = Vec::new();
        for import in imports {
            if local.model(&import.model).is_none() {
                continue;
            }
            let Some(target) = identity.get_model(import.target) else {
                kept.push(import);
                continue;
            };
            match add_import(identity, local, &import, &target) {
                Ok(()) => report.resolved += 1,
                Err(err) => {
                    warn!(
                        model = %import.model,
                        error = %err,
                        "Failed to add deferred model import"
                    );
                    report.failed += 1;
                }
            }
        }
        report.unresolved += kept.len();
        self.imports.lock().extend(kept);

        debug!(
            resolved = report.resolved,
            unresolved = report.unresolved,
            failed = report.failed,
            "Resolution pass finished"
        );
        report
    }
}

fn add_import(
    identity: &IdentityMap,
    local: &dyn LocalRepository,
    import: &PendingImport,
    target: &ModelId,
) -> Result<(), SyncError> {
    local.add_model_import(&import.model, target)?;
    identity.put_model_import(&import.model, target, import.import_node)
}
