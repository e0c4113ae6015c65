//! In-memory local repository.
//!
//! Listeners are notified on the mutating thread after the state lock is released, and only
//! for mutations that changed something.

use super::local::{
    DevKitDependency, LanguageDependency, ListenerScope, LocalChangeListener, LocalEdit,
    LocalModel, LocalModule, LocalNode, LocalRepository, ModuleDependency, NodeLocation,
};
use crate::concept::properties;
use crate::error::StoreError;
use crate::types::{ConceptId, ListenerId, LocalNodeId, ModelId, ModuleId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Default)]
struct LocalState {
    modules: BTreeMap<ModuleId, LocalModule>,
    models: BTreeMap<ModelId, LocalModel>,
    nodes: HashMap<LocalNodeId, LocalNode>,
}

type Emitted = Vec<(ListenerScope, LocalEdit)>;

impl LocalState {
    fn module_mut(&mut self, id: &ModuleId) -> Result<&mut LocalModule, StoreError> {
        self.modules
            .get_mut(id)
            .ok_or_else(|| StoreError::ModuleNotFound(id.to_string()))
    }

    fn model_mut(&mut self, id: &ModelId) -> Result<&mut LocalModel, StoreError> {
        self.models
            .get_mut(id)
            .ok_or_else(|| StoreError::ModelNotFound(id.to_string()))
    }

    fn node_mut(&mut self, id: &LocalNodeId) -> Result<&mut LocalNode, StoreError> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NodeNotFound(id.to_string()))
    }

    fn subtree(&self, id: &LocalNodeId) -> Vec<LocalNodeId> {
        let mut result = Vec::new();
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                for (_, child) in node.children.iter().rev() {
                    stack.push(child.clone());
                }
                result.push(current);
            }
        }
        result
    }

    /// Unlink `id` from its parent or model. Returns the edit describing the removal.
    fn detach(&mut self, id: &LocalNodeId) -> Result<(ListenerScope, LocalEdit), StoreError> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| StoreError::NodeNotFound(id.to_string()))?
            .clone();
        match (&node.parent, &node.role) {
            (Some(parent), Some(role)) => {
                self.node_mut(parent)?.children.retain(|(_, c)| c != id);
                Ok((
                    ListenerScope::Nodes(node.model.clone()),
                    LocalEdit::ChildRemoved {
                        parent: parent.clone(),
                        role: role.clone(),
                        child: id.clone(),
                    },
                ))
            }
            _ => {
                self.model_mut(&node.model)?.roots.retain(|r| r != id);
                Ok((
                    ListenerScope::Model(node.model.clone()),
                    LocalEdit::RootRemoved {
                        model: node.model.clone(),
                        node: id.clone(),
                    },
                ))
            }
        }
    }

    /// Link `id` at `location`; returns the model it now belongs to.
    fn attach(&mut self, id: &LocalNodeId, location: &NodeLocation) -> Result<ModelId, StoreError> {
        match location {
            NodeLocation::Root(model) => {
                self.model_mut(model)?.roots.push(id.clone());
                let node = self.node_mut(id)?;
                node.parent = None;
                node.role = None;
                Ok(model.clone())
            }
            NodeLocation::Child {
                parent,
                role,
                index,
            } => {
                let parent_node = self.node_mut(parent)?;
                let same_role: Vec<usize> = parent_node
                    .children
                    .iter()
                    .enumerate()
                    .filter(|(_, (r, _))| r == role)
                    .map(|(i, _)| i)
                    .collect();
                let position = match index {
                    Some(i) if *i < same_role.len() => same_role[*i],
                    _ => same_role
                        .last()
                        .map(|last| last + 1)
                        .unwrap_or(parent_node.children.len()),
                };
                parent_node.children.insert(position, (role.clone(), id.clone()));
                let model = parent_node.model.clone();
                let node = self.node_mut(id)?;
                node.parent = Some(parent.clone());
                node.role = Some(role.clone());
                Ok(model)
            }
        }
    }
}

/// Local repository held entirely in memory.
#[derive(Default)]
pub struct MemoryLocalRepository {
    state: RwLock<LocalState>,
    listeners: RwLock<Vec<(ListenerId, ListenerScope, Arc<dyn LocalChangeListener>)>>,
}

impl MemoryLocalRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Node in `model` whose property `name` equals `value`.
    pub fn find_node(&self, model: &ModelId, name: &str, value: &str) -> Option<LocalNode> {
        self.state
            .read()
            .nodes
            .values()
            .find(|n| {
                &n.model == model && n.properties.get(name).map(String::as_str) == Some(value)
            })
            .cloned()
    }

    fn emit(&self, edits: Emitted) {
        if edits.is_empty() {
            return;
        }
        let listeners: Vec<(ListenerScope, Arc<dyn LocalChangeListener>)> = self
            .listeners
            .read()
            .iter()
            .map(|(_, scope, listener)| (scope.clone(), Arc::clone(listener)))
            .collect();
        for (scope, edit) in &edits {
            for (listening, listener) in &listeners {
                if listening == scope {
                    listener.on_edit(edit);
                }
            }
        }
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut LocalState, &mut Emitted) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut emitted = Vec::new();
        let result = {
            let mut state = self.state.write();
            f(&mut state, &mut emitted)?
        };
        self.emit(emitted);
        Ok(result)
    }
}

fn set_entry(map: &mut BTreeMap<String, String>, key: &str, value: Option<&str>) -> bool {
    match value {
        Some(value) => map.insert(key.to_string(), value.to_string()).as_deref() != Some(value),
        None => map.remove(key).is_some(),
    }
}

impl LocalRepository for MemoryLocalRepository {
    fn modules(&self) -> Vec<ModuleId> {
        self.state.read().modules.keys().cloned().collect()
    }

    fn module(&self, id: &ModuleId) -> Option<LocalModule> {
        self.state.read().modules.get(id).cloned()
    }

    fn create_module(&self, id: &ModuleId, name: &str) -> Result<(), StoreError> {
        self.mutate(|state, emitted| {
            if state.modules.contains_key(id) {
                return Err(StoreError::AlreadyExists(format!("module {id}")));
            }
            state.modules.insert(
                id.clone(),
                LocalModule {
                    id: id.clone(),
                    name: name.to_string(),
                    models: Vec::new(),
                    properties: BTreeMap::new(),
                    dependencies: BTreeMap::new(),
                },
            );
            emitted.push((
                ListenerScope::Repository,
                LocalEdit::ModuleAdded { module: id.clone() },
            ));
            Ok(())
        })
    }

    fn delete_module(&self, id: &ModuleId) -> Result<(), StoreError> {
        self.mutate(|state, emitted| {
            let module = state
                .modules
                .remove(id)
                .ok_or_else(|| StoreError::ModuleNotFound(id.to_string()))?;
            for model in &module.models {
                if let Some(removed) = state.models.remove(model) {
                    state.nodes.retain(|_, n| n.model != removed.id);
                }
            }
            emitted.push((
                ListenerScope::Repository,
                LocalEdit::ModuleRemoved { module: id.clone() },
            ));
            Ok(())
        })
    }

    fn set_module_property(
        &self,
        id: &ModuleId,
        property: &str,
        value: Option<&str>,
    ) -> Result<(), StoreError> {
        self.mutate(|state, emitted| {
            let module = state.module_mut(id)?;
            let changed = if property == properties::NAME {
                let name = value.unwrap_or_default();
                let changed = module.name != name;
                module.name = name.to_string();
                changed
            } else {
                set_entry(&mut module.properties, property, value)
            };
            if changed {
                emitted.push((
                    ListenerScope::Module(id.clone()),
                    LocalEdit::ModulePropertyChanged {
                        module: id.clone(),
                        property: property.to_string(),
                        value: value.map(str::to_string),
                    },
                ));
            }
            Ok(())
        })
    }

    fn add_module_dependency(
        &self,
        module: &ModuleId,
        dependency: ModuleDependency,
    ) -> Result<(), StoreError> {
        self.mutate(|state, emitted| {
            let entry = state.module_mut(module)?;
            if entry.dependencies.get(&dependency.target) == Some(&dependency) {
                return Ok(());
            }
            entry
                .dependencies
                .insert(dependency.target.clone(), dependency.clone());
            emitted.push((
                ListenerScope::Module(module.clone()),
                LocalEdit::ModuleDependencyAdded {
                    module: module.clone(),
                    dependency,
                },
            ));
            Ok(())
        })
    }

    fn remove_module_dependency(&self, module: &ModuleId, target: &ModuleId)
        -> Result<(), StoreError> {
        self.mutate(|state, emitted| {
            if state.module_mut(module)?.dependencies.remove(target).is_some() {
                emitted.push((
                    ListenerScope::Module(module.clone()),
                    LocalEdit::ModuleDependencyRemoved {
                        module: module.clone(),
                        target: target.clone(),
                    },
                ));
            }
            Ok(())
        })
    }

    fn model(&self, id: &ModelId) -> Option<LocalModel> {
        self.state.read().models.get(id).cloned()
    }

    fn create_model(&self, module: &ModuleId, id: &ModelId, name: &str) -> Result<(), StoreError> {
        self.mutate(|state, emitted| {
            if state.models.contains_key(id) {
                return Err(StoreError::AlreadyExists(format!("model {id}")));
            }
            state.module_mut(module)?.models.push(id.clone());
            state.models.insert(
                id.clone(),
                LocalModel {
                    id: id.clone(),
                    name: name.to_string(),
                    module: module.clone(),
                    roots: Vec::new(),
                    properties: BTreeMap::new(),
                    imports: BTreeSet::new(),
                    languages: BTreeMap::new(),
                    devkits: BTreeMap::new(),
                },
            );
            emitted.push((
                ListenerScope::Module(module.clone()),
                LocalEdit::ModelAdded {
                    module: module.clone(),
                    model: id.clone(),
                },
            ));
            Ok(())
        })
    }

    fn delete_model(&self, id: &ModelId) -> Result<(), StoreError> {
        self.mutate(|state, emitted| {
            let model = state
                .models
                .remove(id)
                .ok_or_else(|| StoreError::ModelNotFound(id.to_string()))?;
            state.nodes.retain(|_, n| &n.model != id);
            if let Some(module) = state.modules.get_mut(&model.module) {
                module.models.retain(|m| m != id);
            }
            emitted.push((
                ListenerScope::Module(model.module.clone()),
                LocalEdit::ModelRemoved {
                    module: model.module,
                    model: id.clone(),
                },
            ));
            Ok(())
        })
    }

    fn move_model(&self, id: &ModelId, module: &ModuleId) -> Result<(), StoreError> {
        self.mutate(|state, emitted| {
            state.module_mut(module)?;
            let from = state.model_mut(id)?.module.clone();
            if &from == module {
                return Ok(());
            }
            state.module_mut(&from)?.models.retain(|m| m != id);
            state.module_mut(module)?.models.push(id.clone());
            state.model_mut(id)?.module = module.clone();
            let edit = LocalEdit::ModelMoved {
                model: id.clone(),
                from: from.clone(),
                to: module.clone(),
            };
            emitted.push((ListenerScope::Module(from), edit.clone()));
            emitted.push((ListenerScope::Module(module.clone()), edit));
            Ok(())
        })
    }

    fn set_model_property(
        &self,
        id: &ModelId,
        property: &str,
        value: Option<&str>,
    ) -> Result<(), StoreError> {
        self.mutate(|state, emitted| {
            let model = state.model_mut(id)?;
            let changed = if property == properties::NAME {
                let name = value.unwrap_or_default();
                let changed = model.name != name;
                model.name = name.to_string();
                changed
            } else {
                set_entry(&mut model.properties, property, value)
            };
            if changed {
                emitted.push((
                    ListenerScope::Model(id.clone()),
                    LocalEdit::ModelPropertyChanged {
                        model: id.clone(),
                        property: property.to_string(),
                        value: value.map(str::to_string),
                    },
                ));
            }
            Ok(())
        })
    }

    fn add_model_import(&self, model: &ModelId, target: &ModelId) -> Result<(), StoreError> {
        self.mutate(|state, emitted| {
            if state.model_mut(model)?.imports.insert(target.clone()) {
                emitted.push((
                    ListenerScope::Model(model.clone()),
                    LocalEdit::ModelImportAdded {
                        model: model.clone(),
                        target: target.clone(),
                    },
                ));
            }
            Ok(())
        })
    }

    fn remove_model_import(&self, model: &ModelId, target: &ModelId) -> Result<(), StoreError> {
        self.mutate(|state, emitted| {
            if state.model_mut(model)?.imports.remove(target) {
                emitted.push((
                    ListenerScope::Model(model.clone()),
                    LocalEdit::ModelImportRemoved {
                        model: model.clone(),
                        target: target.clone(),
                    },
                ));
            }
            Ok(())
        })
    }

    fn add_language_dependency(
        &self,
        model: &ModelId,
        dependency: LanguageDependency,
    ) -> Result<(), StoreError> {
        self.mutate(|state, emitted| {
            let entry = state.model_mut(model)?;
            if entry.languages.get(&dependency.language) == Some(&dependency) {
                return Ok(());
            }
            entry
                .languages
                .insert(dependency.language.clone(), dependency.clone());
            emitted.push((
                ListenerScope::Model(model.clone()),
                LocalEdit::LanguageDependencyAdded {
                    model: model.clone(),
                    dependency,
                },
            ));
            Ok(())
        })
    }

    fn remove_language_dependency(&self, model: &ModelId, language: &ModuleId)
        -> Result<(), StoreError> {
        self.mutate(|state, emitted| {
            if state.model_mut(model)?.languages.remove(language).is_some() {
                emitted.push((
                    ListenerScope::Model(model.clone()),
                    LocalEdit::LanguageDependencyRemoved {
                        model: model.clone(),
                        language: language.clone(),
                    },
                ));
            }
            Ok(())
        })
    }

    fn add_devkit_dependency(
        &self,
        model: &ModelId,
        dependency: DevKitDependency,
    ) -> Result<(), StoreError> {
        self.mutate(|state, emitted| {
            let entry = state.model_mut(model)?;
            if entry.devkits.get(&dependency.devkit) == Some(&dependency) {
                return Ok(());
            }
            entry
                .devkits
                .insert(dependency.devkit.clone(), dependency.clone());
            emitted.push((
                ListenerScope::Model(model.clone()),
                LocalEdit::DevKitDependencyAdded {
                    model: model.clone(),
                    dependency,
                },
            ));
            Ok(())
        })
    }

    fn remove_devkit_dependency(
        &self,
        model: &ModelId,
        devkit: &ModuleId,
    ) -> Result<(), StoreError> {
        self.mutate(|state, emitted| {
            if state.model_mut(model)?.devkits.remove(devkit).is_some() {
                emitted.push((
                    ListenerScope::Model(model.clone()),
                    LocalEdit::DevKitDependencyRemoved {
                        model: model.clone(),
                        devkit: devkit.clone(),
                    },
                ));
            }
            Ok(())
        })
    }

    fn node(&self, id: &LocalNodeId) -> Option<LocalNode> {
        self.state.read().nodes.get(id).cloned()
    }

    fn create_node(
        &self,
        id: &LocalNodeId,
        concept: &ConceptId,
        location: NodeLocation,
    ) -> Result<(), StoreError> {
        self.mutate(|state, emitted| {
            if state.nodes.contains_key(id) {
                return Err(StoreError::AlreadyExists(format!("node {id}")));
            }
            let model = match &location {
                NodeLocation::Root(model) => {
                    state.model_mut(model)?;
                    model.clone()
                }
                NodeLocation::Child { parent, .. } => state.node_mut(parent)?.model.clone(),
            };
            state.nodes.insert(
                id.clone(),
                LocalNode {
                    id: id.clone(),
                    concept: concept.clone(),
                    model: model.clone(),
                    parent: None,
                    role: None,
                    properties: BTreeMap::new(),
                    references: BTreeMap::new(),
                    children: Vec::new(),
                },
            );
            state.attach(id, &location)?;
            emitted.push(match location {
                NodeLocation::Root(model) => (
                    ListenerScope::Model(model.clone()),
                    LocalEdit::RootAdded {
                        model,
                        node: id.clone(),
                    },
                ),
                NodeLocation::Child { parent, role, .. } => (
                    ListenerScope::Nodes(model),
                    LocalEdit::ChildAdded {
                        parent,
                        role,
                        child: id.clone(),
                    },
                ),
            });
            Ok(())
        })
    }

    fn delete_node(&self, id: &LocalNodeId) -> Result<(), StoreError> {
        self.mutate(|state, emitted| {
            let doomed = state.subtree(id);
            emitted.push(state.detach(id)?);
            for node in doomed {
                state.nodes.remove(&node);
            }
            Ok(())
        })
    }

    fn move_node(&self, id: &LocalNodeId, location: NodeLocation) -> Result<(), StoreError> {
        self.mutate(|state, emitted| {
            let subtree = state.subtree(id);
            if let NodeLocation::Child { parent, .. } = &location {
                if subtree.contains(parent) {
                    return Err(StoreError::InvalidOperation(format!(
                        "cannot move {id} into its own subtree"
                    )));
                }
            }
            let old_model = state.node_mut(id)?.model.clone();
            state.detach(id)?;
            let new_model = state.attach(id, &location)?;
            if new_model != old_model {
                for node in &subtree {
                    state.node_mut(node)?.model = new_model.clone();
                }
            }
            emitted.push((
                ListenerScope::Nodes(old_model),
                LocalEdit::NodeMoved {
                    node: id.clone(),
                    to: location,
                },
            ));
            Ok(())
        })
    }

    fn set_property(
        &self,
        node: &LocalNodeId,
        property: &str,
        value: Option<&str>,
    ) -> Result<(), StoreError> {
        self.mutate(|state, emitted| {
            let entry = state.node_mut(node)?;
            if set_entry(&mut entry.properties, property, value) {
                emitted.push((
                    ListenerScope::Nodes(entry.model.clone()),
                    LocalEdit::NodePropertyChanged {
                        node: node.clone(),
                        property: property.to_string(),
                        value: value.map(str::to_string),
                    },
                ));
            }
            Ok(())
        })
    }

    fn set_reference(
        &self,
        node: &LocalNodeId,
        role: &str,
        target: Option<&LocalNodeId>,
    ) -> Result<(), StoreError> {
        self.mutate(|state, emitted| {
            let entry = state.node_mut(node)?;
            let changed = match target {
                Some(target) => entry.references.insert(role.to_string(), target.clone()).as_ref()
                    != Some(target),
                None => entry.references.remove(role).is_some(),
            };
            if changed {
                emitted.push((
                    ListenerScope::Nodes(entry.model.clone()),
                    LocalEdit::NodeReferenceChanged {
                        node: node.clone(),
                        role: role.to_string(),
                        target: target.cloned(),
                    },
                ));
            }
            Ok(())
        })
    }

    fn add_listener(&self, scope: ListenerScope, listener: Arc<dyn LocalChangeListener>)
        -> ListenerId {
        let id = ListenerId::next();
        self.listeners.write().push((id, scope, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) -> Result<(), StoreError> {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _, _)| *existing != id);
        if listeners.len() == before {
            return Err(StoreError::UnknownListener(id.as_u64()));
        }
        Ok(())
    }
}
