//! Compact serialized form of the identity map: `v1:` + hex(bincode(entries)).
//!
//! Entries are sorted before encoding so equal maps serialize to equal strings.

use super::IdentityMap;
use crate::error::SyncError;
use crate::types::{LocalNodeId, ModelId, ModuleId, RemoteNodeId};
use serde::{Deserialize, Serialize};

const FORMAT_PREFIX: &str = "v1:";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMapSnapshot {
    pub nodes: Vec<(LocalNodeId, ModelId, RemoteNodeId)>,
    pub models: Vec<(ModelId, ModuleId, RemoteNodeId)>,
    pub modules: Vec<(ModuleId, RemoteNodeId)>,
    pub module_dependencies: Vec<(ModuleId, ModuleId, RemoteNodeId)>,
    pub model_imports: Vec<(ModelId, ModelId, RemoteNodeId)>,
    pub language_dependencies: Vec<(ModelId, ModuleId, RemoteNodeId)>,
}

impl IdentityMapSnapshot {
    pub(super) fn capture(
        nodes: impl Iterator<Item = (LocalNodeId, Option<ModelId>, RemoteNodeId)>,
        models: impl Iterator<Item = (ModelId, Option<ModuleId>, RemoteNodeId)>,
        modules: impl Iterator<Item = (ModuleId, RemoteNodeId)>,
        module_dependencies: impl Iterator<Item = (ModuleId, ModuleId, RemoteNodeId)>,
        model_imports: impl Iterator<Item = (ModelId, ModelId, RemoteNodeId)>,
        language_dependencies: impl Iterator<Item = (ModelId, ModuleId, RemoteNodeId)>,
    ) -> Self {
        // owners are always recorded on put; entries without one cannot be restored
        let mut snapshot = Self {
            nodes: nodes
                .filter_map(|(local, model, remote)| model.map(|m| (local, m, remote)))
                .collect(),
            models: models
                .filter_map(|(model, module, remote)| module.map(|m| (model, m, remote)))
                .collect(),
            modules: modules.collect(),
            module_dependencies: module_dependencies.collect(),
            model_imports: model_imports.collect(),
            language_dependencies: language_dependencies.collect(),
        };
        snapshot.nodes.sort();
        snapshot.models.sort();
        snapshot.modules.sort();
        snapshot.module_dependencies.sort();
        snapshot.model_imports.sort();
        snapshot.language_dependencies.sort();
        snapshot
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
            + self.models.len()
            + self.modules.len()
            + self.module_dependencies.len()
            + self.model_imports.len()
            + self.language_dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn encode(&self) -> Result<String, SyncError> {
        let bytes = bincode::serialize(self).map_err(|e| {
            SyncError::InvalidSnapshot(format!("Failed to encode identity map: {e}"))
        })?;
        Ok(format!("{FORMAT_PREFIX}{}", hex::encode(bytes)))
    }

    pub fn decode(serialized: &str) -> Result<Self, SyncError> {
        let payload = serialized.trim().strip_prefix(FORMAT_PREFIX).ok_or_else(|| {
            SyncError::InvalidSnapshot("missing format prefix".to_string())
        })?;
        let bytes = hex::decode(payload)
            .map_err(|e| SyncError::InvalidSnapshot(format!("invalid hex payload: {e}")))?;
        bincode::deserialize(&bytes)
            .map_err(|e| SyncError::InvalidSnapshot(format!("Failed to decode identity map: {e}")))
    }

    /// Insert every entry into `map`, validating injectivity as it goes.
    pub(super) fn apply(&self, map: &IdentityMap) -> Result<(), SyncError> {
        for (module, remote) in &self.modules {
            map.put_module(module.clone(), *remote)?;
        }
        for (model, module, remote) in &self.models {
            map.put_model(model.clone(), module, *remote)?;
        }
        for (local, model, remote) in &self.nodes {
            map.put_node(local.clone(), model, *remote)?;
        }
        for (module, target, remote) in &self.module_dependencies {
            map.put_module_dependency(module, target, *remote)?;
        }
        for (model, target, remote) in &self.model_imports {
            map.put_model_import(model, target, *remote)?;
        }
        for (model, language, remote) in &self.language_dependencies {
            map.put_language_dependency(model, language, *remote)?;
        }
        Ok(())
    }
}
