//! Local → remote transform.
//!
//! A push writes the whole module or model inside one remote transaction: structure first,
//! then references and imports once every node of the transaction has its remote id.

use super::pull::{find_model, find_module};
use crate::binding::{bind_model, bind_module_with_models};
use crate::concept::{concepts, properties, roles};
use crate::context::SyncContext;
use crate::error::SyncError;
use crate::scheduler::{SyncDirection, SyncLock, TaskHandle};
use crate::store::{DevKitDependency, LanguageDependency, ModuleDependency, RemoteRef, RemoteWrite};
use crate::types::{ConceptId, LocalNodeId, ModelId, ModuleId, RemoteNodeId};
use std::sync::Arc;
use tracing::{debug, info, warn};

const PUSH_LOCKS: [SyncLock; 2] = [SyncLock::LocalRead, SyncLock::RemoteWrite];

/// A reference written before its target had a remote id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RemoteReferenceEdge {
    pub source: RemoteNodeId,
    pub role: String,
    pub target: LocalNodeId,
}

/// Language or devkit used by a model.
#[derive(Debug, Clone, Copy)]
pub(crate) enum UsedLanguage<'a> {
    Language(&'a LanguageDependency),
    DevKit(&'a DevKitDependency),
}

/// Write a local module, its dependencies and all of its models to the remote store, then
/// bind it.
pub fn push_module(ctx: &Arc<SyncContext>, module: &ModuleId) -> TaskHandle<()> {
    let task_ctx = Arc::clone(ctx);
    let target = module.clone();
    let written = ctx
        .scheduler()
        .enqueue(PUSH_LOCKS, SyncDirection::LocalToRemote, move || {
            write_module(&task_ctx, &target)
        });

    let task_ctx = Arc::clone(ctx);
    written.continue_with(SyncLock::None, SyncDirection::None, move |module: ModuleId| {
        bind_module_with_models(&task_ctx, &module)?;
        info!(module = %module, "Module synchronized to remote");
        Ok(())
    })
}

/// Write one local model into its already synchronized module, then bind it.
pub fn push_model(ctx: &Arc<SyncContext>, model: &ModelId) -> TaskHandle<()> {
    let task_ctx = Arc::clone(ctx);
    let target = model.clone();
    let written = ctx
        .scheduler()
        .enqueue(PUSH_LOCKS, SyncDirection::LocalToRemote, move || {
            write_single_model(&task_ctx, &target)
        });

    let task_ctx = Arc::clone(ctx);
    written.continue_with(SyncLock::None, SyncDirection::None, move |model: ModelId| {
        bind_model(&task_ctx, &model)?;
        info!(model = %model, "Model synchronized to remote");
        Ok(())
    })
}

fn write_module(ctx: &SyncContext, module: &ModuleId) -> Result<ModuleId, SyncError> {
    let local_module = ctx
        .local()
        .module(module)
        .ok_or_else(|| SyncError::mapping(format!("Local module {module} not found")))?;
    let already = || SyncError::AlreadyOnRemote(format!("Module '{}'", local_module.name));
    if ctx.identity().is_mapped_local_module(module) {
        return Err(already());
    }

    let branch = ctx.branch()?;
    let mut write = branch.write()?;
    if find_module(write.as_ref(), module.as_str())?.is_some() {
        return Err(already());
    }

    let root = write.root();
    let concept = ConceptId::new(concepts::MODULE);
    let remote = write.add_new_child(root, roles::MODULES, None, &concept)?;
    write.set_property(remote, properties::ID, Some(module.as_str()))?;
    write.set_property(remote, properties::NAME, Some(&local_module.name))?;
    for (key, value) in &local_module.properties {
        if !ctx.settings().is_ignored(key) {
            write.set_property(remote, key, Some(value))?;
        }
    }
    ctx.identity().put_module(module.clone(), remote)?;

    let written = (|| {
        for dependency in local_module.dependencies.values() {
            write_module_dependency(ctx, write.as_mut(), module, remote, dependency)?;
        }
        let mut edges = Vec::new();
        for model in &local_module.models {
            edges.extend(write_model(ctx, write.as_mut(), model, module, remote)?);
        }
        for model in &local_module.models {
            write_model_imports(ctx, write.as_mut(), model)?;
        }
        link_references(ctx, write.as_mut(), edges)
    })();
    let committed = written.and_then(|()| Ok(write.commit()?));
    if let Err(err) = committed {
        // nothing reached the remote store, forget what was mapped along the way
        ctx.identity().remove_module(module);
        return Err(err);
    }
    debug!(
        module = %module,
        remote = %remote,
        models = local_module.models.len(),
        "Wrote module to remote"
    );
    Ok(module.clone())
}

fn write_single_model(ctx: &SyncContext, model: &ModelId) -> Result<ModelId, SyncError> {
    let local_model = ctx
        .local()
        .model(model)
        .ok_or_else(|| SyncError::mapping(format!("Local model {model} not found")))?;
    let already = || SyncError::AlreadyOnRemote(format!("Model '{}'", local_model.name));
    if ctx.identity().is_mapped_local_model(model) {
        return Err(already());
    }
    let module_remote = ctx
        .identity()
        .get_remote_module(&local_model.module)
        .ok_or_else(|| {
            SyncError::mapping(format!("Module of model {model} is not synchronized"))
        })?;

    let branch = ctx.branch()?;
    let mut write = branch.write()?;
    if find_model(write.as_ref(), model.as_str())?.is_some() {
        return Err(already());
    }
    let written = (|| {
        let edges = write_model(ctx, write.as_mut(), model, &local_model.module, module_remote)?;
        write_model_imports(ctx, write.as_mut(), model)?;
        link_references(ctx, write.as_mut(), edges)
    })();
    if let Err(err) = written.and_then(|()| Ok(write.commit()?)) {
        ctx.identity().remove_model(model);
        return Err(err);
    }
    Ok(model.clone())
}

/// Model node, language dependencies and root subtrees. Imports and references are left to
/// the caller.
fn write_model(
    ctx: &SyncContext,
    write: &mut dyn RemoteWrite,
    model: &ModelId,
    module: &ModuleId,
    module_remote: RemoteNodeId,
) -> Result<Vec<RemoteReferenceEdge>, SyncError> {
    let local_model = ctx
        .local()
        .model(model)
        .ok_or_else(|| SyncError::mapping(format!("Local model {model} not found")))?;
    let remote = write.add_new_child(
        module_remote,
        roles::MODELS,
        None,
        &ConceptId::new(concepts::MODEL),
    )?;
    write.set_property(remote, properties::ID, Some(model.as_str()))?;
    write.set_property(remote, properties::NAME, Some(&local_model.name))?;
    for (key, value) in &local_model.properties {
        if !ctx.settings().is_ignored(key) {
            write.set_property(remote, key, Some(value))?;
        }
    }
    ctx.identity().put_model(model.clone(), module, remote)?;

    for dependency in local_model.languages.values() {
        write_language_dependency(ctx, write, model, remote, UsedLanguage::Language(dependency))?;
    }
    for dependency in local_model.devkits.values() {
        write_language_dependency(ctx, write, model, remote, UsedLanguage::DevKit(dependency))?;
    }

    let mut edges = Vec::new();
    for root in &local_model.roots {
        edges.extend(write_subtree(ctx, write, root, remote, roles::ROOT_NODES, None)?);
    }
    Ok(edges)
}

fn write_model_imports(
    ctx: &SyncContext,
    write: &mut dyn RemoteWrite,
    model: &ModelId,
) -> Result<(), SyncError> {
    let Some(local_model) = ctx.local().model(model) else {
        return Ok(());
    };
    for target in &local_model.imports {
        write_model_import(ctx, write, model, target)?;
    }
    Ok(())
}

/// Write `node` and its descendants below `parent`. Returns the references still to link.
pub(crate) fn write_subtree(
    ctx: &SyncContext,
    write: &mut dyn RemoteWrite,
    node: &LocalNodeId,
    parent: RemoteNodeId,
    role: &str,
    index: Option<usize>,
) -> Result<Vec<RemoteReferenceEdge>, SyncError> {
    let local = ctx.local();
    let mut edges = Vec::new();
    let mut stack = vec![(node.clone(), parent, role.to_string(), index)];
    while let Some((current, parent, role, index)) = stack.pop() {
        let data = local
            .node(&current)
            .ok_or_else(|| SyncError::mapping(format!("Local node {current} not found")))?;
        let remote = write.add_new_child(parent, &role, index, &data.concept)?;
        write.set_property(remote, properties::LOCAL_ID, Some(current.as_str()))?;
        for (key, value) in &data.properties {
            if !ctx.settings().is_ignored(key) {
                write.set_property(remote, key, Some(value))?;
            }
        }
        ctx.identity().put_node(current.clone(), &data.model, remote)?;
        edges.extend(data.references.iter().map(|(role, target)| RemoteReferenceEdge {
            source: remote,
            role: role.clone(),
            target: target.clone(),
        }));
        // reversed so children pop in order and append
        for (child_role, child) in data.children.iter().rev() {
            stack.push((child.clone(), remote, child_role.clone(), None));
        }
    }
    Ok(edges)
}

/// Remote form of a local reference target.
pub(crate) fn remote_target(ctx: &SyncContext, target: &LocalNodeId) -> RemoteRef {
    match ctx.identity().get_remote(target) {
        Some(remote) => RemoteRef::Node(remote),
        None => RemoteRef::Foreign(target.as_str().to_string()),
    }
}

pub(crate) fn link_references(
    ctx: &SyncContext,
    write: &mut dyn RemoteWrite,
    edges: Vec<RemoteReferenceEdge>,
) -> Result<(), SyncError> {
    for edge in edges {
        write.set_reference(edge.source, &edge.role, Some(remote_target(ctx, &edge.target)))?;
    }
    Ok(())
}

pub(crate) fn write_module_dependency(
    ctx: &SyncContext,
    write: &mut dyn RemoteWrite,
    module: &ModuleId,
    module_remote: RemoteNodeId,
    dependency: &ModuleDependency,
) -> Result<RemoteNodeId, SyncError> {
    let remote = write.add_new_child(
        module_remote,
        roles::DEPENDENCIES,
        None,
        &ConceptId::new(concepts::MODULE_DEPENDENCY),
    )?;
    write.set_property(remote, properties::UUID, Some(dependency.target.as_str()))?;
    write.set_property(remote, properties::NAME, Some(&dependency.name))?;
    ctx.identity()
        .put_module_dependency(module, &dependency.target, remote)?;
    Ok(remote)
}

pub(crate) fn write_language_dependency(
    ctx: &SyncContext,
    write: &mut dyn RemoteWrite,
    model: &ModelId,
    model_remote: RemoteNodeId,
    used: UsedLanguage<'_>,
) -> Result<RemoteNodeId, SyncError> {
    let (concept, language, name, version) = match used {
        UsedLanguage::Language(dependency) => (
            concepts::LANGUAGE_DEPENDENCY,
            &dependency.language,
            &dependency.name,
            Some(dependency.version),
        ),
        UsedLanguage::DevKit(dependency) => (
            concepts::DEVKIT_DEPENDENCY,
            &dependency.devkit,
            &dependency.name,
            None,
        ),
    };
    let remote = write.add_new_child(
        model_remote,
        roles::USED_LANGUAGES,
        None,
        &ConceptId::new(concept),
    )?;
    write.set_property(remote, properties::UUID, Some(language.as_str()))?;
    write.set_property(remote, properties::NAME, Some(name))?;
    if let Some(version) = version {
        write.set_property(remote, properties::VERSION, Some(&version.to_string()))?;
    }
    ctx.identity()
        .put_language_dependency(model, language, remote)?;
    Ok(remote)
}

/// Write the import node of `model` pointing at `target`, by remote id when it is mapped.
pub(crate) fn write_model_import(
    ctx: &SyncContext,
    write: &mut dyn RemoteWrite,
    model: &ModelId,
    target: &ModelId,
) -> Result<RemoteNodeId, SyncError> {
    let model_remote = ctx
        .identity()
        .get_remote_model(model)
        .ok_or_else(|| SyncError::mapping(format!("Model {model} is not synchronized")))?;
    let remote = write.add_new_child(
        model_remote,
        roles::MODEL_IMPORTS,
        None,
        &ConceptId::new(concepts::MODEL_IMPORT),
    )?;
    let reference = match ctx.identity().get_remote_model(target) {
        Some(target_remote) => RemoteRef::Node(target_remote),
        None => {
            warn!(
                model = %model,
                target = %target,
                "Imported model is not synchronized, writing a foreign import"
            );
            RemoteRef::Foreign(target.as_str().to_string())
        }
    };
    write.set_reference(remote, roles::IMPORTED_MODEL, Some(reference))?;
    ctx.identity().put_model_import(model, target, remote)?;
    Ok(remote)
}
