//! Local store interface.

use crate::error::StoreError;
use crate::types::{ConceptId, ListenerId, LocalNodeId, ModelId, ModuleId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModuleDependency {
    pub target: ModuleId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LanguageDependency {
    pub language: ModuleId,
    pub name: String,
    pub version: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DevKitDependency {
    pub devkit: ModuleId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalNode {
    pub id: LocalNodeId,
    pub concept: ConceptId,
    pub model: ModelId,
    /// `None` for root nodes
    pub parent: Option<LocalNodeId>,
    pub role: Option<String>,
    pub properties: BTreeMap<String, String>,
    pub references: BTreeMap<String, LocalNodeId>,
    /// Children in order, with their containment role
    pub children: Vec<(String, LocalNodeId)>,
}

impl LocalNode {
    pub fn location(&self) -> NodeLocation {
        match (&self.parent, &self.role) {
            (Some(parent), Some(role)) => NodeLocation::Child {
                parent: parent.clone(),
                role: role.clone(),
                index: None,
            },
            _ => NodeLocation::Root(self.model.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalModel {
    pub id: ModelId,
    pub name: String,
    pub module: ModuleId,
    pub roots: Vec<LocalNodeId>,
    pub properties: BTreeMap<String, String>,
    pub imports: BTreeSet<ModelId>,
    pub languages: BTreeMap<ModuleId, LanguageDependency>,
    pub devkits: BTreeMap<ModuleId, DevKitDependency>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalModule {
    pub id: ModuleId,
    pub name: String,
    pub models: Vec<ModelId>,
    pub properties: BTreeMap<String, String>,
    pub dependencies: BTreeMap<ModuleId, ModuleDependency>,
}

/// Where a node is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeLocation {
    Root(ModelId),
    Child {
        parent: LocalNodeId,
        role: String,
        index: Option<usize>,
    },
}

/// Granularity at which a listener observes edits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenerScope {
    /// Module additions and removals
    Repository,
    /// Models, properties and dependencies of one module
    Module(ModuleId),
    /// Roots, properties, imports and language dependencies of one model
    Model(ModelId),
    /// Edits of the nodes inside one model
    Nodes(ModelId),
}

/// A single edit made to the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEdit {
    NodePropertyChanged {
        node: LocalNodeId,
        property: String,
        value: Option<String>,
    },
    NodeReferenceChanged {
        node: LocalNodeId,
        role: String,
        target: Option<LocalNodeId>,
    },
    ChildAdded {
        parent: LocalNodeId,
        role: String,
        child: LocalNodeId,
    },
    ChildRemoved {
        parent: LocalNodeId,
        role: String,
        child: LocalNodeId,
    },
    NodeMoved {
        node: LocalNodeId,
        to: NodeLocation,
    },
    RootAdded {
        model: ModelId,
        node: LocalNodeId,
    },
    RootRemoved {
        model: ModelId,
        node: LocalNodeId,
    },
    ModelPropertyChanged {
        model: ModelId,
        property: String,
        value: Option<String>,
    },
    ModelImportAdded {
        model: ModelId,
        target: ModelId,
    },
    ModelImportRemoved {
        model: ModelId,
        target: ModelId,
    },
    LanguageDependencyAdded {
        model: ModelId,
        dependency: LanguageDependency,
    },
    LanguageDependencyRemoved {
        model: ModelId,
        language: ModuleId,
    },
    DevKitDependencyAdded {
        model: ModelId,
        dependency: DevKitDependency,
    },
    DevKitDependencyRemoved {
        model: ModelId,
        devkit: ModuleId,
    },
    ModelAdded {
        module: ModuleId,
        model: ModelId,
    },
    ModelRemoved {
        module: ModuleId,
        model: ModelId,
    },
    ModelMoved {
        model: ModelId,
        from: ModuleId,
        to: ModuleId,
    },
    ModulePropertyChanged {
        module: ModuleId,
        property: String,
        value: Option<String>,
    },
    ModuleDependencyAdded {
        module: ModuleId,
        dependency: ModuleDependency,
    },
    ModuleDependencyRemoved {
        module: ModuleId,
        target: ModuleId,
    },
    ModuleAdded {
        module: ModuleId,
    },
    ModuleRemoved {
        module: ModuleId,
    },
}

pub trait LocalChangeListener: Send + Sync {
    fn on_edit(&self, edit: &LocalEdit);
}

/// Everything the engine needs from the local store.
///
/// Mutations notify the listeners registered for the matching scope, on the mutating thread,
/// after the mutation is visible.
pub trait LocalRepository: Send + Sync {
    fn modules(&self) -> Vec<ModuleId>;
    fn module(&self, id: &ModuleId) -> Option<LocalModule>;
    fn create_module(&self, id: &ModuleId, name: &str) -> Result<(), StoreError>;
    /// Deletes the module with all of its models.
    fn delete_module(&self, id: &ModuleId) -> Result<(), StoreError>;
    fn set_module_property(
        &self,
        id: &ModuleId,
        property: &str,
        value: Option<&str>,
    ) -> Result<(), StoreError>;
    fn add_module_dependency(
        &self,
        module: &ModuleId,
        dependency: ModuleDependency,
    ) -> Result<(), StoreError>;
    fn remove_module_dependency(&self, module: &ModuleId, target: &ModuleId)
        -> Result<(), StoreError>;

    fn model(&self, id: &ModelId) -> Option<LocalModel>;
    fn create_model(&self, module: &ModuleId, id: &ModelId, name: &str) -> Result<(), StoreError>;
    fn delete_model(&self, id: &ModelId) -> Result<(), StoreError>;
    fn move_model(&self, id: &ModelId, module: &ModuleId) -> Result<(), StoreError>;
    fn set_model_property(
        &self,
        id: &ModelId,
        property: &str,
        value: Option<&str>,
    ) -> Result<(), StoreError>;
    fn add_model_import(&self, model: &ModelId, target: &ModelId) -> Result<(), StoreError>;
    fn remove_model_import(&self, model: &ModelId, target: &ModelId) -> Result<(), StoreError>;
    fn add_language_dependency(
        &self,
        model: &ModelId,
        dependency: LanguageDependency,
    ) -> Result<(), StoreError>;
    fn remove_language_dependency(&self, model: &ModelId, language: &ModuleId)
        -> Result<(), StoreError>;
    fn add_devkit_dependency(
        &self,
        model: &ModelId,
        dependency: DevKitDependency,
    ) -> Result<(), StoreError>;
    fn remove_devkit_dependency(&self, model: &ModelId, devkit: &ModuleId)
        -> Result<(), StoreError>;

    fn node(&self, id: &LocalNodeId) -> Option<LocalNode>;
    fn create_node(
        &self,
        id: &LocalNodeId,
        concept: &ConceptId,
        location: NodeLocation,
    ) -> Result<(), StoreError>;
    /// Deletes the node with its whole subtree.
    fn delete_node(&self, id: &LocalNodeId) -> Result<(), StoreError>;
    fn move_node(&self, id: &LocalNodeId, location: NodeLocation) -> Result<(), StoreError>;
    fn set_property(
        &self,
        node: &LocalNodeId,
        property: &str,
        value: Option<&str>,
    ) -> Result<(), StoreError>;
    fn set_reference(
        &self,
        node: &LocalNodeId,
        role: &str,
        target: Option<&LocalNodeId>,
    ) -> Result<(), StoreError>;

    fn add_listener(&self, scope: ListenerScope, listener: Arc<dyn LocalChangeListener>)
        -> ListenerId;
    fn remove_listener(&self, id: ListenerId) -> Result<(), StoreError>;

    /// The node and all of its descendants, parents first.
    fn subtree(&self, id: &LocalNodeId) -> Vec<LocalNodeId> {
        let mut result = Vec::new();
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.node(&current) {
                for (_, child) in node.children.iter().rev() {
                    stack.push(child.clone());
                }
                result.push(current);
            }
        }
        result
    }
}
