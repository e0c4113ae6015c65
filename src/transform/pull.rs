//! Remote → local transform.

use super::references::{PendingImport, ResolvableReference};
use super::TransformOutcome;
use crate::binding::bind_module_with_models;
use crate::concept::{properties, roles, EntityKind};
use crate::context::SyncContext;
use crate::error::SyncError;
use crate::scheduler::{SyncDirection, SyncLock, TaskHandle};
use crate::store::{
    DevKitDependency, LanguageDependency, LocalRepository, ModuleDependency, NodeLocation,
    RemoteRead, RemoteRef,
};
use crate::types::{LocalNodeId, ModelId, ModuleId, RemoteNodeId};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const PULL_LOCKS: [SyncLock; 2] = [SyncLock::LocalWrite, SyncLock::RemoteRead];

#[derive(Debug, Clone)]
pub(crate) struct CreatedModule {
    module: ModuleId,
    dependencies: Vec<RemoteNodeId>,
    models: Vec<RemoteNodeId>,
}

/// A module transform in progress.
pub(crate) struct ModuleRun {
    /// The module and its models exist locally; its dependencies may still be running.
    materialized: TaskHandle<CreatedModule>,
    finished: TaskHandle<TransformOutcome>,
}

#[derive(Debug, Clone)]
struct CreatedModel {
    model: ModelId,
    roots: Vec<RemoteNodeId>,
}

/// Remote module node whose `id` property is `module`.
pub fn find_module<R: RemoteRead + ?Sized>(
    read: &R,
    module: &str,
) -> Result<Option<RemoteNodeId>, SyncError> {
    for candidate in read.children(read.root(), roles::MODULES)? {
        if read.property(candidate, properties::ID)?.as_deref() == Some(module) {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

/// Remote model node whose `id` property is `model`, searched in every module.
pub fn find_model<R: RemoteRead + ?Sized>(
    read: &R,
    model: &str,
) -> Result<Option<RemoteNodeId>, SyncError> {
    for module in read.children(read.root(), roles::MODULES)? {
        for candidate in read.children(module, roles::MODELS)? {
            if read.property(candidate, properties::ID)?.as_deref() == Some(model) {
                return Ok(Some(candidate));
            }
        }
    }
    Ok(None)
}

fn required_property<R: RemoteRead + ?Sized>(
    read: &R,
    node: RemoteNodeId,
    property: &str,
) -> Result<String, SyncError> {
    read.property(node, property)?.ok_or_else(|| {
        SyncError::mapping(format!("Remote node {node} has no '{property}' property"))
    })
}

fn expect_kind<R: RemoteRead + ?Sized>(
    read: &R,
    node: RemoteNodeId,
    kind: EntityKind,
) -> Result<(), SyncError> {
    let concept = read.concept(node)?;
    if EntityKind::classify(&concept) != kind {
        return Err(SyncError::mapping(format!(
            "Remote node {node} is a {concept}, expected a {kind:?}"
        )));
    }
    Ok(())
}

/// Materialize a remote module with its dependency modules and models.
///
/// Only the entry module runs the reference-resolution pass, after everything it pulled in
/// has been joined. A module already mapped, or being transformed by another run, yields
/// [`TransformOutcome::AlreadySynchronized`].
pub fn transform_module(
    ctx: &Arc<SyncContext>,
    remote_module: RemoteNodeId,
    is_entry: bool,
) -> TaskHandle<TransformOutcome> {
    transform_module_within(ctx, remote_module, is_entry, Arc::new(Vec::new()))
}

/// `ancestors` are the modules whose dependency fan-out led here; joining one of them would
/// wait on itself.
fn transform_module_within(
    ctx: &Arc<SyncContext>,
    remote_module: RemoteNodeId,
    is_entry: bool,
    ancestors: Arc<Vec<RemoteNodeId>>,
) -> TaskHandle<TransformOutcome> {
    let scheduler = ctx.scheduler().clone();
    if ancestors.contains(&remote_module) {
        debug!(remote = %remote_module, "Cyclic module dependency, not joining");
        return scheduler.ready(TransformOutcome::AlreadySynchronized);
    }
    let chain = Arc::new(ancestors.iter().copied().chain([remote_module]).collect::<Vec<_>>());
    let mut in_flight = ctx.in_flight().modules.lock();
    if let Some(running) = in_flight.get(&remote_module) {
        if is_entry {
            debug!(remote = %remote_module, "Module transform already running, joining it");
            return running.finished.map(|_| TransformOutcome::AlreadySynchronized);
        }
        // The other run may be waiting on one of our ancestors: wait for its module only and
        // walk its dependencies from here.
        debug!(
            remote = %remote_module,
            "Module transform already running, walking its dependencies"
        );
        let task_ctx = Arc::clone(ctx);
        return running
            .materialized
            .continue_with_handle(
                SyncLock::None,
                SyncDirection::RemoteToLocal,
                move |created: CreatedModule| {
                    Ok(transform_dependencies(&task_ctx, &created.dependencies, chain))
                },
            )
            .map(|_| TransformOutcome::AlreadySynchronized);
    }
    if ctx.identity().get_module(remote_module).is_some() {
        debug!(remote = %remote_module, "Module already synchronized");
        return scheduler.ready(TransformOutcome::AlreadySynchronized);
    }

    let task_ctx = Arc::clone(ctx);
    let created = scheduler.enqueue(PULL_LOCKS, SyncDirection::RemoteToLocal, move || {
        create_module(&task_ctx, remote_module)
    });

    let task_ctx = Arc::clone(ctx);
    let materialized = created.continue_with_handle(
        SyncLock::None,
        SyncDirection::RemoteToLocal,
        move |created: CreatedModule| {
            let models = created
                .models
                .iter()
                .map(|model| transform_model(&task_ctx, *model).map(|_| ()))
                .collect();
            Ok(task_ctx.scheduler().join_all(models).map(move |_| created))
        },
    );

    let task_ctx = Arc::clone(ctx);
    let joined = materialized.continue_with_handle(
        SyncLock::None,
        SyncDirection::RemoteToLocal,
        move |created: CreatedModule| {
            let module = created.module;
            Ok(transform_dependencies(&task_ctx, &created.dependencies, chain)
                .map(move |_| module))
        },
    );

    let resolved = if is_entry {
        let task_ctx = Arc::clone(ctx);
        joined.continue_with(SyncLock::LocalWrite, SyncDirection::RemoteToLocal, move |module| {
            let report = task_ctx
                .references()
                .resolve(task_ctx.identity(), task_ctx.local().as_ref());
            if report.unresolved > 0 {
                info!(
                    module = %module,
                    unresolved = report.unresolved,
                    "References left unresolved after transform"
                );
            }
            Ok(module)
        })
    } else {
        joined
    };

    let task_ctx = Arc::clone(ctx);
    let bound = resolved.continue_with(SyncLock::None, SyncDirection::None, move |module| {
        bind_module_with_models(&task_ctx, &module)?;
        info!(module = %module, "Module synchronized from remote");
        Ok(TransformOutcome::Transformed)
    });

    in_flight.insert(
        remote_module,
        ModuleRun {
            materialized,
            finished: bound.clone(),
        },
    );
    drop(in_flight);

    let weak = Arc::downgrade(ctx);
    bound.on_complete(move |_| {
        if let Some(ctx) = weak.upgrade() {
            ctx.in_flight().modules.lock().remove(&remote_module);
        }
    });
    bound
}

fn transform_dependencies(
    ctx: &Arc<SyncContext>,
    dependencies: &[RemoteNodeId],
    chain: Arc<Vec<RemoteNodeId>>,
) -> TaskHandle<Vec<()>> {
    let children = dependencies
        .iter()
        .map(|dependency| {
            transform_module_within(ctx, *dependency, false, Arc::clone(&chain)).map(|_| ())
        })
        .collect();
    ctx.scheduler().join_all(children)
}

#[instrument(skip(ctx))]
fn create_module(ctx: &SyncContext, remote: RemoteNodeId) -> Result<CreatedModule, SyncError> {
    let branch = ctx.branch()?;
    let read = branch.read()?;
    expect_kind(read.as_ref(), remote, EntityKind::Module)?;
    let id = required_property(read.as_ref(), remote, properties::ID)?;
    let name = read.property(remote, properties::NAME)?.unwrap_or_else(|| id.clone());
    let module = ModuleId::new(id);

    if ctx.identity().get_module(remote).is_some() {
        return Ok(CreatedModule {
            module,
            dependencies: Vec::new(),
            models: Vec::new(),
        });
    }

    let local = ctx.local();
    if local.module(&module).is_none() {
        local.create_module(&module, &name)?;
    }
    for (key, value) in read.properties(remote)? {
        if key == properties::ID || key == properties::NAME || ctx.settings().is_ignored(&key) {
            continue;
        }
        local.set_module_property(&module, &key, Some(&value))?;
    }
    ctx.identity().put_module(module.clone(), remote)?;

    let mut dependencies = Vec::new();
    for dependency in read.children(remote, roles::DEPENDENCIES)? {
        let target = apply_module_dependency(ctx, read.as_ref(), &module, dependency)?;
        if let Some(target_remote) = find_module(read.as_ref(), target.as_str())? {
            dependencies.push(target_remote);
        }
    }
    let models = read.children(remote, roles::MODELS)?;
    debug!(
        module = %module,
        dependencies = dependencies.len(),
        models = models.len(),
        "Created local module"
    );
    Ok(CreatedModule {
        module,
        dependencies,
        models,
    })
}

/// Materialize a remote model with all of its root subtrees. The module must be mapped.
pub fn transform_model(ctx: &Arc<SyncContext>, remote_model: RemoteNodeId) -> TaskHandle<ModelId> {
    let task_ctx = Arc::clone(ctx);
    let created = ctx
        .scheduler()
        .enqueue(PULL_LOCKS, SyncDirection::RemoteToLocal, move || {
            create_model(&task_ctx, remote_model)
        });

    let task_ctx = Arc::clone(ctx);
    created.continue_with_handle(
        SyncLock::None,
        SyncDirection::RemoteToLocal,
        move |created: CreatedModel| {
            let scheduler = task_ctx.scheduler();
            let subtrees = created
                .roots
                .iter()
                .map(|root| {
                    let ctx = Arc::clone(&task_ctx);
                    let root = *root;
                    scheduler.enqueue(PULL_LOCKS, SyncDirection::RemoteToLocal, move || {
                        transform_subtree(&ctx, root)
                    })
                })
                .collect();
            let model = created.model;
            Ok(scheduler.join_all(subtrees).map(move |_| model))
        },
    )
}

fn create_model(ctx: &SyncContext, remote: RemoteNodeId) -> Result<CreatedModel, SyncError> {
    let branch = ctx.branch()?;
    let read = branch.read()?;
    expect_kind(read.as_ref(), remote, EntityKind::Model)?;
    let id = required_property(read.as_ref(), remote, properties::ID)?;
    let name = read.property(remote, properties::NAME)?.unwrap_or_else(|| id.clone());
    let model = ModelId::new(id);

    if ctx.identity().get_model(remote).is_some() {
        return Ok(CreatedModel {
            model,
            roots: Vec::new(),
        });
    }
    let parent = read
        .parent(remote)?
        .ok_or_else(|| SyncError::mapping(format!("Model {model} has no module")))?;
    let module = ctx.identity().get_module(parent).ok_or_else(|| {
        SyncError::mapping(format!("Module of model {model} is not synchronized"))
    })?;

    let local = ctx.local();
    if local.model(&model).is_none() {
        local.create_model(&module, &model, &name)?;
    }
    for (key, value) in read.properties(remote)? {
        if key == properties::ID || key == properties::NAME || ctx.settings().is_ignored(&key) {
            continue;
        }
        local.set_model_property(&model, &key, Some(&value))?;
    }
    ctx.identity().put_model(model.clone(), &module, remote)?;

    for dependency in read.children(remote, roles::USED_LANGUAGES)? {
        apply_used_language(ctx, read.as_ref(), &model, dependency)?;
    }
    for import in read.children(remote, roles::MODEL_IMPORTS)? {
        apply_model_import(ctx, read.as_ref(), &model, import)?;
    }
    let roots = read.children(remote, roles::ROOT_NODES)?;
    debug!(model = %model, roots = roots.len(), "Created local model");
    Ok(CreatedModel { model, roots })
}

/// Depth-first creation of one root subtree; parents are always created before children.
fn transform_subtree(ctx: &SyncContext, root: RemoteNodeId) -> Result<(), SyncError> {
    let branch = ctx.branch()?;
    let read = branch.read()?;
    for node in read.subtree(root)? {
        create_local_node(ctx, read.as_ref(), node)?;
    }
    Ok(())
}

/// Where the local counterpart of `remote` belongs, with the model containing it.
///
/// `Ok(None)` when the remote node is outside every synchronized model.
pub(crate) fn local_location<R: RemoteRead + ?Sized>(
    ctx: &SyncContext,
    read: &R,
    remote: RemoteNodeId,
) -> Result<Option<(NodeLocation, ModelId)>, SyncError> {
    let Some(parent) = read.parent(remote)? else {
        return Err(SyncError::ParentNotFound(remote.to_string()));
    };
    let role = read.role_in_parent(remote)?.unwrap_or_default();

    if let Some(model) = ctx.identity().get_model(parent) {
        if role == roles::ROOT_NODES {
            return Ok(Some((NodeLocation::Root(model.clone()), model)));
        }
    }
    if let Some(parent_local) = ctx.identity().get_local(parent) {
        let model = ctx
            .local()
            .node(&parent_local)
            .map(|node| node.model)
            .ok_or_else(|| SyncError::ParentNotFound(remote.to_string()))?;
        let index = read
            .children(parent, &role)?
            .iter()
            .position(|child| *child == remote);
        return Ok(Some((
            NodeLocation::Child {
                parent: parent_local,
                role,
                index,
            },
            model,
        )));
    }

    // an unmapped parent inside a synchronized model means the tree is out of order
    let mut ancestor = Some(parent);
    while let Some(current) = ancestor {
        if ctx.identity().get_model(current).is_some() {
            return Err(SyncError::ParentNotFound(remote.to_string()));
        }
        ancestor = read.parent(current)?;
    }
    Ok(None)
}

/// Create the local counterpart of one remote plain node.
///
/// Returns the existing counterpart when the node is already mapped. Node references are
/// always deferred to the resolution pass.
pub(crate) fn create_local_node<R: RemoteRead + ?Sized>(
    ctx: &SyncContext,
    read: &R,
    remote: RemoteNodeId,
) -> Result<Option<LocalNodeId>, SyncError> {
    if let Some(existing) = ctx.identity().get_local(remote) {
        return Ok(Some(existing));
    }
    let concept = read.concept(remote)?;
    ctx.languages().resolve(&concept)?;
    let Some((location, model)) = local_location(ctx, read, remote)? else {
        debug!(remote = %remote, "Node is outside synchronized models, skipping");
        return Ok(None);
    };

    let local_id = read
        .property(remote, properties::LOCAL_ID)?
        .map(LocalNodeId::new)
        .unwrap_or_else(|| LocalNodeId::derived_from(remote));
    let local = ctx.local();
    local.create_node(&local_id, &concept, location)?;
    ctx.identity().put_node(local_id.clone(), &model, remote)?;

    for (key, value) in read.properties(remote)? {
        if key == properties::LOCAL_ID || ctx.settings().is_ignored(&key) {
            continue;
        }
        local.set_property(&local_id, &key, Some(&value))?;
    }
    for (role, target) in read.references(remote)? {
        match target {
            RemoteRef::Node(target) => ctx.references().defer(ResolvableReference {
                source: local_id.clone(),
                role,
                target,
            }),
            foreign => apply_reference(ctx, &local_id, &role, Some(foreign))?,
        }
    }
    Ok(Some(local_id))
}

/// Set one local reference from its remote form. Unmapped node targets are deferred.
pub(crate) fn apply_reference(
    ctx: &SyncContext,
    source: &LocalNodeId,
    role: &str,
    target: Option<RemoteRef>,
) -> Result<(), SyncError> {
    let local = ctx.local();
    match target {
        None => local.set_reference(source, role, None)?,
        Some(RemoteRef::Node(target)) => match ctx.identity().get_local(target) {
            Some(target) => local.set_reference(source, role, Some(&target))?,
            None => ctx.references().defer(ResolvableReference {
                source: source.clone(),
                role: role.to_string(),
                target,
            }),
        },
        Some(RemoteRef::Foreign(id)) => {
            let target = LocalNodeId::new(id);
            if local.node(&target).is_some() {
                local.set_reference(source, role, Some(&target))?;
            } else {
                warn!(
                    source = %source,
                    role,
                    target = %target,
                    "Foreign reference target not found locally"
                );
            }
        }
    }
    Ok(())
}

/// Add the module dependency described by remote node `dependency`. Returns its target.
pub(crate) fn apply_module_dependency<R: RemoteRead + ?Sized>(
    ctx: &SyncContext,
    read: &R,
    module: &ModuleId,
    dependency: RemoteNodeId,
) -> Result<ModuleId, SyncError> {
    let target = ModuleId::new(required_property(read, dependency, properties::UUID)?);
    let name = read
        .property(dependency, properties::NAME)?
        .unwrap_or_else(|| target.to_string());
    ctx.local().add_module_dependency(
        module,
        ModuleDependency {
            target: target.clone(),
            name,
        },
    )?;
    ctx.identity()
        .put_module_dependency(module, &target, dependency)?;
    Ok(target)
}

/// Language or devkit dependency as stored locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LocalUsedLanguage {
    Language(LanguageDependency),
    DevKit(DevKitDependency),
}

impl LocalUsedLanguage {
    pub(crate) fn module(&self) -> &ModuleId {
        match self {
            LocalUsedLanguage::Language(dependency) => &dependency.language,
            LocalUsedLanguage::DevKit(dependency) => &dependency.devkit,
        }
    }

    /// Attach to `model` in the local store.
    pub(crate) fn add_to(
        &self,
        local: &dyn LocalRepository,
        model: &ModelId,
    ) -> Result<(), SyncError> {
        match self {
            LocalUsedLanguage::Language(dependency) => {
                local.add_language_dependency(model, dependency.clone())?
            }
            LocalUsedLanguage::DevKit(dependency) => {
                local.add_devkit_dependency(model, dependency.clone())?
            }
        }
        Ok(())
    }
}

pub(crate) fn read_used_language<R: RemoteRead + ?Sized>(
    read: &R,
    dependency: RemoteNodeId,
) -> Result<LocalUsedLanguage, SyncError> {
    let concept = read.concept(dependency)?;
    let language = ModuleId::new(required_property(read, dependency, properties::UUID)?);
    let name = read
        .property(dependency, properties::NAME)?
        .unwrap_or_else(|| language.to_string());
    match EntityKind::classify(&concept) {
        EntityKind::LanguageDependency => {
            let version = read
                .property(dependency, properties::VERSION)?
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            Ok(LocalUsedLanguage::Language(LanguageDependency {
                language,
                name,
                version,
            }))
        }
        EntityKind::DevKitDependency => Ok(LocalUsedLanguage::DevKit(DevKitDependency {
            devkit: language,
            name,
        })),
        other => Err(SyncError::mapping(format!(
            "Remote node {dependency} is a {other:?}, expected a language dependency"
        ))),
    }
}

/// Add the language or devkit dependency described by remote node `dependency` to `model`.
pub(crate) fn apply_used_language<R: RemoteRead + ?Sized>(
    ctx: &SyncContext,
    read: &R,
    model: &ModelId,
    dependency: RemoteNodeId,
) -> Result<(), SyncError> {
    let used = read_used_language(read, dependency)?;
    used.add_to(ctx.local().as_ref(), model)?;
    ctx.identity()
        .put_language_dependency(model, used.module(), dependency)
}

/// Add the model import described by remote node `import`, deferring unmapped targets.
pub(crate) fn apply_model_import<R: RemoteRead + ?Sized>(
    ctx: &SyncContext,
    read: &R,
    model: &ModelId,
    import: RemoteNodeId,
) -> Result<(), SyncError> {
    let target = match read.reference(import, roles::IMPORTED_MODEL)? {
        Some(RemoteRef::Node(target_remote)) => match ctx.identity().get_model(target_remote) {
            Some(target) => target,
            None => {
                ctx.references().defer_import(PendingImport {
                    model: model.clone(),
                    import_node: import,
                    target: target_remote,
                });
                return Ok(());
            }
        },
        Some(RemoteRef::Foreign(id)) => ModelId::new(id),
        None => {
            warn!(model = %model, import = %import, "Model import without target");
            return Ok(());
        }
    };
    ctx.local().add_model_import(model, &target)?;
    ctx.identity().put_model_import(model, &target, import)
}
