//! Identity Correspondence Map
//!
//! Bidirectional mapping between local identities and remote node ids. Besides plain nodes,
//! models and modules, the map tracks the remote nodes standing for module dependencies,
//! model imports and language/devkit dependencies, and remembers which model or module every
//! entry belongs to so that removing a model or module removes everything related to it.

mod snapshot;

pub use snapshot::IdentityMapSnapshot;

use crate::error::SyncError;
use crate::types::{LocalNodeId, ModelId, ModuleId, RemoteNodeId};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// The local entity a remote id stands for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MappedEntity {
    Node(LocalNodeId),
    Model(ModelId),
    Module(ModuleId),
    ModuleDependency { module: ModuleId, target: ModuleId },
    ModelImport { model: ModelId, target: ModelId },
    LanguageDependency { model: ModelId, language: ModuleId },
}

#[derive(Debug, Default)]
struct MapState {
    nodes: HashMap<LocalNodeId, RemoteNodeId>,
    models: HashMap<ModelId, RemoteNodeId>,
    modules: HashMap<ModuleId, RemoteNodeId>,
    module_dependencies: HashMap<(ModuleId, ModuleId), RemoteNodeId>,
    model_imports: HashMap<(ModelId, ModelId), RemoteNodeId>,
    language_dependencies: HashMap<(ModelId, ModuleId), RemoteNodeId>,

    /// Reverse index over every entry kind; a remote id maps to exactly one entity.
    remote: HashMap<RemoteNodeId, MappedEntity>,

    node_owner: HashMap<LocalNodeId, ModelId>,
    model_owner: HashMap<ModelId, ModuleId>,
    model_members: HashMap<ModelId, HashSet<MappedEntity>>,
    module_members: HashMap<ModuleId, HashSet<MappedEntity>>,
}

impl MapState {
    fn forward(&self, entity: &MappedEntity) -> Option<RemoteNodeId> {
        match entity {
            MappedEntity::Node(id) => self.nodes.get(id).copied(),
            MappedEntity::Model(id) => self.models.get(id).copied(),
            MappedEntity::Module(id) => self.modules.get(id).copied(),
            MappedEntity::ModuleDependency { module, target } => self
                .module_dependencies
                .get(&(module.clone(), target.clone()))
                .copied(),
            MappedEntity::ModelImport { model, target } => {
                self.model_imports.get(&(model.clone(), target.clone())).copied()
            }
            MappedEntity::LanguageDependency { model, language } => self
                .language_dependencies
                .get(&(model.clone(), language.clone()))
                .copied(),
        }
    }

    /// Both directions must be free or already hold exactly this pair.
    fn check_injective(
        &self,
        entity: &MappedEntity,
        remote: RemoteNodeId,
    ) -> Result<bool, SyncError> {
        let existing_remote = self.forward(entity);
        let existing_entity = self.remote.get(&remote);
        match (existing_remote, existing_entity) {
            (None, None) => Ok(false),
            (Some(r), Some(e)) if r == remote && e == entity => Ok(true),
            (Some(r), _) if r != remote => Err(SyncError::IdentityConflict(format!(
                "{entity:?} is already mapped to remote node {r}"
            ))),
            (_, Some(e)) => Err(SyncError::IdentityConflict(format!(
                "remote node {remote} is already mapped to {e:?}"
            ))),
            _ => Err(SyncError::IdentityConflict(format!(
                "inconsistent entry for {entity:?} and remote node {remote}"
            ))),
        }
    }

    fn insert(&mut self, entity: MappedEntity, remote: RemoteNodeId) {
        match &entity {
            MappedEntity::Node(id) => {
                self.nodes.insert(id.clone(), remote);
            }
            MappedEntity::Model(id) => {
                self.models.insert(id.clone(), remote);
            }
            MappedEntity::Module(id) => {
                self.modules.insert(id.clone(), remote);
            }
            MappedEntity::ModuleDependency { module, target } => {
                self.module_dependencies
                    .insert((module.clone(), target.clone()), remote);
            }
            MappedEntity::ModelImport { model, target } => {
                self.model_imports.insert((model.clone(), target.clone()), remote);
            }
            MappedEntity::LanguageDependency { model, language } => {
                self.language_dependencies
                    .insert((model.clone(), language.clone()), remote);
            }
        }
        self.remote.insert(remote, entity);
    }

    fn remove_entity(&mut self, entity: &MappedEntity) -> Option<RemoteNodeId> {
        let removed = match entity {
            MappedEntity::Node(id) => {
                if let Some(model) = self.node_owner.remove(id) {
                    if let Some(members) = self.model_members.get_mut(&model) {
                        members.remove(entity);
                    }
                }
                self.nodes.remove(id)
            }
            MappedEntity::Model(id) => {
                if let Some(members) = self.model_members.remove(id) {
                    for member in members {
                        self.remove_entity(&member);
                    }
                }
                if let Some(module) = self.model_owner.remove(id) {
                    if let Some(members) = self.module_members.get_mut(&module) {
                        members.remove(entity);
                    }
                }
                self.models.remove(id)
            }
            MappedEntity::Module(id) => {
                if let Some(members) = self.module_members.remove(id) {
                    for member in members {
                        self.remove_entity(&member);
                    }
                }
                self.modules.remove(id)
            }
            MappedEntity::ModuleDependency { module, target } => {
                if let Some(members) = self.module_members.get_mut(module) {
                    members.remove(entity);
                }
                self.module_dependencies
                    .remove(&(module.clone(), target.clone()))
            }
            MappedEntity::ModelImport { model, target } => {
                if let Some(members) = self.model_members.get_mut(model) {
                    members.remove(entity);
                }
                self.model_imports.remove(&(model.clone(), target.clone()))
            }
            MappedEntity::LanguageDependency { model, language } => {
                if let Some(members) = self.model_members.get_mut(model) {
                    members.remove(entity);
                }
                self.language_dependencies
                    .remove(&(model.clone(), language.clone()))
            }
        };
        if let Some(remote) = removed {
            self.remote.remove(&remote);
        }
        removed
    }
}

/// Thread-safe identity map. Shared by every component of a session.
#[derive(Debug, Default)]
pub struct IdentityMap {
    state: RwLock<MapState>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn put(
        &self,
        entity: MappedEntity,
        remote: RemoteNodeId,
        owner: impl FnOnce(&mut MapState, &MappedEntity),
    ) -> Result<(), SyncError> {
        let mut state = self.state.write();
        if state.check_injective(&entity, remote)? {
            return Ok(());
        }
        owner(&mut state, &entity);
        debug!(?entity, remote = %remote, "Mapped entity");
        state.insert(entity, remote);
        Ok(())
    }

    /// Map a plain node that lives in `model`.
    pub fn put_node(
        &self,
        local: LocalNodeId,
        model: &ModelId,
        remote: RemoteNodeId,
    ) -> Result<(), SyncError> {
        let model = model.clone();
        self.put(MappedEntity::Node(local.clone()), remote, move |state, entity| {
            state.node_owner.insert(local, model.clone());
            state
                .model_members
                .entry(model)
                .or_default()
                .insert(entity.clone());
        })
    }

    pub fn put_model(
        &self,
        model: ModelId,
        module: &ModuleId,
        remote: RemoteNodeId,
    ) -> Result<(), SyncError> {
        let module = module.clone();
        self.put(MappedEntity::Model(model.clone()), remote, move |state, entity| {
            state.model_owner.insert(model, module.clone());
            state
                .module_members
                .entry(module)
                .or_default()
                .insert(entity.clone());
        })
    }

    pub fn put_module(&self, module: ModuleId, remote: RemoteNodeId) -> Result<(), SyncError> {
        self.put(MappedEntity::Module(module), remote, |_, _| {})
    }

    pub fn put_module_dependency(
        &self,
        module: &ModuleId,
        target: &ModuleId,
        remote: RemoteNodeId,
    ) -> Result<(), SyncError> {
        let owner = module.clone();
        let entity = MappedEntity::ModuleDependency {
            module: module.clone(),
            target: target.clone(),
        };
        self.put(entity, remote, move |state, entity| {
            state
                .module_members
                .entry(owner)
                .or_default()
                .insert(entity.clone());
        })
    }

    pub fn put_model_import(
        &self,
        model: &ModelId,
        target: &ModelId,
        remote: RemoteNodeId,
    ) -> Result<(), SyncError> {
        let owner = model.clone();
        let entity = MappedEntity::ModelImport {
            model: model.clone(),
            target: target.clone(),
        };
        self.put(entity, remote, move |state, entity| {
            state
                .model_members
                .entry(owner)
                .or_default()
                .insert(entity.clone());
        })
    }

    /// Language and devkit dependencies of a model share one entry kind.
    pub fn put_language_dependency(
        &self,
        model: &ModelId,
        language: &ModuleId,
        remote: RemoteNodeId,
    ) -> Result<(), SyncError> {
        let owner = model.clone();
        let entity = MappedEntity::LanguageDependency {
            model: model.clone(),
            language: language.clone(),
        };
        self.put(entity, remote, move |state, entity| {
            state
                .model_members
                .entry(owner)
                .or_default()
                .insert(entity.clone());
        })
    }

    pub fn get_local(&self, remote: RemoteNodeId) -> Option<LocalNodeId> {
        match self.state.read().remote.get(&remote) {
            Some(MappedEntity::Node(id)) => Some(id.clone()),
            _ => None,
        }
    }

    pub fn get_model(&self, remote: RemoteNodeId) -> Option<ModelId> {
        match self.state.read().remote.get(&remote) {
            Some(MappedEntity::Model(id)) => Some(id.clone()),
            _ => None,
        }
    }

    pub fn get_module(&self, remote: RemoteNodeId) -> Option<ModuleId> {
        match self.state.read().remote.get(&remote) {
            Some(MappedEntity::Module(id)) => Some(id.clone()),
            _ => None,
        }
    }

    pub fn get_remote(&self, local: &LocalNodeId) -> Option<RemoteNodeId> {
        self.state.read().nodes.get(local).copied()
    }

    pub fn get_remote_model(&self, model: &ModelId) -> Option<RemoteNodeId> {
        self.state.read().models.get(model).copied()
    }

    pub fn get_remote_module(&self, module: &ModuleId) -> Option<RemoteNodeId> {
        self.state.read().modules.get(module).copied()
    }

    pub fn get_remote_module_dependency(
        &self,
        module: &ModuleId,
        target: &ModuleId,
    ) -> Option<RemoteNodeId> {
        self.state
            .read()
            .module_dependencies
            .get(&(module.clone(), target.clone()))
            .copied()
    }

    pub fn get_remote_model_import(
        &self,
        model: &ModelId,
        target: &ModelId,
    ) -> Option<RemoteNodeId> {
        self.state
            .read()
            .model_imports
            .get(&(model.clone(), target.clone()))
            .copied()
    }

    pub fn get_remote_language_dependency(
        &self,
        model: &ModelId,
        language: &ModuleId,
    ) -> Option<RemoteNodeId> {
        self.state
            .read()
            .language_dependencies
            .get(&(model.clone(), language.clone()))
            .copied()
    }

    /// The single entity `remote` stands for, of whatever kind.
    pub fn lookup(&self, remote: RemoteNodeId) -> Option<MappedEntity> {
        self.state.read().remote.get(&remote).cloned()
    }

    pub fn is_mapped(&self, remote: RemoteNodeId) -> bool {
        self.state.read().remote.contains_key(&remote)
    }

    pub fn is_mapped_local_node(&self, local: &LocalNodeId) -> bool {
        self.state.read().nodes.contains_key(local)
    }

    pub fn is_mapped_local_model(&self, model: &ModelId) -> bool {
        self.state.read().models.contains_key(model)
    }

    pub fn is_mapped_local_module(&self, module: &ModuleId) -> bool {
        self.state.read().modules.contains_key(module)
    }

    pub fn model_of_node(&self, local: &LocalNodeId) -> Option<ModelId> {
        self.state.read().node_owner.get(local).cloned()
    }

    pub fn module_of_model(&self, model: &ModelId) -> Option<ModuleId> {
        self.state.read().model_owner.get(model).cloned()
    }

    /// Models mapped under `module`.
    pub fn models_of_module(&self, module: &ModuleId) -> Vec<ModelId> {
        let state = self.state.read();
        let mut models: Vec<ModelId> = state
            .module_members
            .get(module)
            .into_iter()
            .flatten()
            .filter_map(|member| match member {
                MappedEntity::Model(id) => Some(id.clone()),
                _ => None,
            })
            .collect();
        models.sort();
        models
    }

    /// Remove whatever `remote` stands for. Models and modules cascade to related entries.
    pub fn remove(&self, remote: RemoteNodeId) -> Option<MappedEntity> {
        let mut state = self.state.write();
        let entity = state.remote.get(&remote).cloned()?;
        state.remove_entity(&entity);
        debug!(?entity, remote = %remote, "Unmapped entity");
        Some(entity)
    }

    pub fn remove_node(&self, local: &LocalNodeId) -> Option<RemoteNodeId> {
        self.state
            .write()
            .remove_entity(&MappedEntity::Node(local.clone()))
    }

    /// Remove a model with its nodes, imports and language dependencies.
    pub fn remove_model(&self, model: &ModelId) -> Option<RemoteNodeId> {
        self.state
            .write()
            .remove_entity(&MappedEntity::Model(model.clone()))
    }

    /// Remove a module with its dependencies and models, recursively.
    pub fn remove_module(&self, module: &ModuleId) -> Option<RemoteNodeId> {
        self.state
            .write()
            .remove_entity(&MappedEntity::Module(module.clone()))
    }

    pub fn remove_module_dependency(
        &self,
        module: &ModuleId,
        target: &ModuleId,
    ) -> Option<RemoteNodeId> {
        self.state.write().remove_entity(&MappedEntity::ModuleDependency {
            module: module.clone(),
            target: target.clone(),
        })
    }

    pub fn remove_model_import(&self, model: &ModelId, target: &ModelId) -> Option<RemoteNodeId> {
        self.state.write().remove_entity(&MappedEntity::ModelImport {
            model: model.clone(),
            target: target.clone(),
        })
    }

    pub fn remove_language_dependency(
        &self,
        model: &ModelId,
        language: &ModuleId,
    ) -> Option<RemoteNodeId> {
        self.state.write().remove_entity(&MappedEntity::LanguageDependency {
            model: model.clone(),
            language: language.clone(),
        })
    }

    /// Re-own a mapped model after it moved to another module. Its entries stay mapped.
    pub fn move_model(&self, model: &ModelId, module: &ModuleId) -> Result<(), SyncError> {
        let mut state = self.state.write();
        if !state.models.contains_key(model) {
            return Err(SyncError::mapping(format!("model {model} is not mapped")));
        }
        let entity = MappedEntity::Model(model.clone());
        if let Some(previous) = state.model_owner.insert(model.clone(), module.clone()) {
            if let Some(members) = state.module_members.get_mut(&previous) {
                members.remove(&entity);
            }
        }
        state
            .module_members
            .entry(module.clone())
            .or_default()
            .insert(entity);
        Ok(())
    }

    /// Re-own a mapped node after it moved to another model.
    pub fn move_node(&self, local: &LocalNodeId, model: &ModelId) -> Result<(), SyncError> {
        let mut state = self.state.write();
        if !state.nodes.contains_key(local) {
            return Err(SyncError::mapping(format!("node {local} is not mapped")));
        }
        let entity = MappedEntity::Node(local.clone());
        if let Some(previous) = state.node_owner.insert(local.clone(), model.clone()) {
            if let Some(members) = state.model_members.get_mut(&previous) {
                members.remove(&entity);
            }
        }
        state
            .model_members
            .entry(model.clone())
            .or_default()
            .insert(entity);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.read().remote.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().remote.is_empty()
    }

    pub fn clear(&self) {
        *self.state.write() = MapState::default();
    }

    /// Serialize the whole map to its compact string form.
    pub fn serialize(&self) -> Result<String, SyncError> {
        self.snapshot().encode()
    }

    /// Restore from [`serialize`](Self::serialize) output. Rejected unless the map is empty.
    pub fn deserialize(&self, serialized: &str) -> Result<(), SyncError> {
        if !self.is_empty() {
            return Err(SyncError::MapNotEmpty);
        }
        let snapshot = IdentityMapSnapshot::decode(serialized)?;
        let restored = IdentityMap::new();
        snapshot.apply(&restored)?;
        // swap in only once every entry validated
        let mut state = self.state.write();
        if !state.remote.is_empty() {
            return Err(SyncError::MapNotEmpty);
        }
        *state = std::mem::take(&mut *restored.state.write());
        Ok(())
    }

    pub fn snapshot(&self) -> IdentityMapSnapshot {
        let state = self.state.read();
        IdentityMapSnapshot::capture(
            state.nodes.iter().map(|(local, remote)| {
                let model = state.node_owner.get(local).cloned();
                (local.clone(), model, *remote)
            }),
            state.models.iter().map(|(model, remote)| {
                let module = state.model_owner.get(model).cloned();
                (model.clone(), module, *remote)
            }),
            state.modules.iter().map(|(m, r)| (m.clone(), *r)),
            state
                .module_dependencies
                .iter()
                .map(|((m, t), r)| (m.clone(), t.clone(), *r)),
            state
                .model_imports
                .iter()
                .map(|((m, t), r)| (m.clone(), t.clone(), *r)),
            state
                .language_dependencies
                .iter()
                .map(|((m, l), r)| (m.clone(), l.clone(), *r)),
        )
    }

    /// Checks both directions of every entry agree. Used by tests and diagnostics.
    pub fn is_consistent(&self) -> bool {
        let state = self.state.read();
        let forward_count = state.nodes.len()
            + state.models.len()
            + state.modules.len()
            + state.module_dependencies.len()
            + state.model_imports.len()
            + state.language_dependencies.len();
        forward_count == state.remote.len()
            && state
                .remote
                .iter()
                .all(|(remote, entity)| state.forward(entity) == Some(*remote))
    }
}
