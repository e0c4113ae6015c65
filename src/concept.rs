//! Concepts shared by both stores, and classification of remote nodes.

use crate::error::SyncError;
use crate::types::ConceptId;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Structural concepts of the remote repository tree.
pub mod concepts {
    pub const REPOSITORY: &str = "treesync.structure.Repository";
    pub const MODULE: &str = "treesync.structure.Module";
    pub const MODEL: &str = "treesync.structure.Model";
    pub const MODULE_DEPENDENCY: &str = "treesync.structure.ModuleDependency";
    pub const MODEL_IMPORT: &str = "treesync.structure.ModelImport";
    pub const LANGUAGE_DEPENDENCY: &str = "treesync.structure.LanguageDependency";
    pub const DEVKIT_DEPENDENCY: &str = "treesync.structure.DevKitDependency";
}

/// Child roles of the structural concepts.
pub mod roles {
    pub const MODULES: &str = "modules";
    pub const MODELS: &str = "models";
    pub const DEPENDENCIES: &str = "dependencies";
    pub const ROOT_NODES: &str = "rootNodes";
    pub const MODEL_IMPORTS: &str = "modelImports";
    pub const USED_LANGUAGES: &str = "usedLanguages";
    /// Reference role of a model import pointing at the imported model.
    pub const IMPORTED_MODEL: &str = "model";
}

/// Property names of the structural concepts.
pub mod properties {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const UUID: &str = "uuid";
    pub const VERSION: &str = "version";
    /// Carries a plain node's local id on the remote side.
    pub const LOCAL_ID: &str = "$localId";
}

/// What a remote node stands for in the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Module,
    Model,
    ModuleDependency,
    ModelImport,
    LanguageDependency,
    DevKitDependency,
    PlainNode,
}

impl EntityKind {
    pub fn classify(concept: &ConceptId) -> Self {
        match concept.as_str() {
            concepts::MODULE => EntityKind::Module,
            concepts::MODEL => EntityKind::Model,
            concepts::MODULE_DEPENDENCY => EntityKind::ModuleDependency,
            concepts::MODEL_IMPORT => EntityKind::ModelImport,
            concepts::LANGUAGE_DEPENDENCY => EntityKind::LanguageDependency,
            concepts::DEVKIT_DEPENDENCY => EntityKind::DevKitDependency,
            _ => EntityKind::PlainNode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConceptInfo {
    pub id: ConceptId,
    pub name: String,
    /// Whether instances may be roots of a model.
    pub rootable: bool,
}

/// Concept lookup shared by the local and the remote side.
#[derive(Debug, Default)]
pub struct LanguageRepository {
    concepts: RwLock<HashMap<ConceptId, ConceptInfo>>,
}

impl LanguageRepository {
    /// Repository pre-populated with the structural concepts.
    pub fn new() -> Self {
        let repository = Self::default();
        for (id, name) in [
            (concepts::REPOSITORY, "Repository"),
            (concepts::MODULE, "Module"),
            (concepts::MODEL, "Model"),
            (concepts::MODULE_DEPENDENCY, "ModuleDependency"),
            (concepts::MODEL_IMPORT, "ModelImport"),
            (concepts::LANGUAGE_DEPENDENCY, "LanguageDependency"),
            (concepts::DEVKIT_DEPENDENCY, "DevKitDependency"),
        ] {
            repository.register(ConceptInfo {
                id: ConceptId::new(id),
                name: name.to_string(),
                rootable: false,
            });
        }
        repository
    }

    pub fn register(&self, concept: ConceptInfo) {
        self.concepts.write().insert(concept.id.clone(), concept);
    }

    /// Register a user concept by id, deriving its name from the last path segment.
    pub fn register_concept(&self, id: &str, rootable: bool) -> ConceptId {
        let concept = ConceptId::new(id);
        let name = id.rsplit(['.', '/']).next().unwrap_or(id).to_string();
        self.register(ConceptInfo {
            id: concept.clone(),
            name,
            rootable,
        });
        concept
    }

    pub fn resolve(&self, id: &ConceptId) -> Result<ConceptInfo, SyncError> {
        self.concepts
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownConcept(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.concepts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.concepts.read().is_empty()
    }
}
