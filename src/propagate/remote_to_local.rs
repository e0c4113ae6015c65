use crate::binding::bind_model;
use crate::concept::{properties, roles, EntityKind};
use crate::context::SyncContext;
use crate::error::SyncError;
use crate::identity::MappedEntity;
use crate::scheduler::{SyncDirection, SyncLock};
use crate::store::{RemoteRead, TreeDiffVisitor};
use crate::transform::{
    apply_model_import, apply_module_dependency, apply_reference, apply_used_language,
    create_local_node, local_location, read_used_language, transform_model, transform_module,
};
use crate::types::{ModelId, ModuleId, RemoteNodeId};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

const APPLY_LOCKS: [SyncLock; 2] = [SyncLock::LocalWrite, SyncLock::RemoteRead];

/// Applies remote tree diffs to the local store.
pub struct RemoteChangeVisitor {
    context: Weak<SyncContext>,
}

impl RemoteChangeVisitor {
    pub(crate) fn new(context: Weak<SyncContext>) -> Self {
        Self { context }
    }

    /// Queue one `RemoteToLocal` task running `body` against a read of the current revision.
    fn apply<F>(&self, what: String, body: F)
    where
        F: FnOnce(&Arc<SyncContext>, &dyn RemoteRead) -> Result<(), SyncError> + Send + 'static,
    {
        let Some(ctx) = self.context.upgrade() else {
            return;
        };
        let task_ctx = Arc::clone(&ctx);
        let handle = ctx
            .scheduler()
            .enqueue(APPLY_LOCKS, SyncDirection::RemoteToLocal, move || {
                let branch = task_ctx.branch()?;
                let read = branch.read()?;
                body(&task_ctx, read.as_ref())
            });
        ctx.report(&handle, SyncDirection::RemoteToLocal, what);
    }
}

impl TreeDiffVisitor for RemoteChangeVisitor {
    fn property_changed(&self, node: RemoteNodeId, role: &str) {
        let role = role.to_string();
        self.apply(format!("property '{role}' of remote node {node}"), move |ctx, read| {
            let Some(entity) = ctx.identity().lookup(node) else {
                debug!(remote = %node, "Property changed on an unmapped node");
                return Ok(());
            };
            if ctx.settings().is_ignored(&role) {
                return Ok(());
            }
            let value = read.property(node, &role)?;
            let local = ctx.local();
            match entity {
                MappedEntity::Node(id) if role != properties::LOCAL_ID => {
                    local.set_property(&id, &role, value.as_deref())?
                }
                MappedEntity::Model(model) if role != properties::ID => {
                    local.set_model_property(&model, &role, value.as_deref())?
                }
                MappedEntity::Module(module) if role != properties::ID => {
                    local.set_module_property(&module, &role, value.as_deref())?
                }
                MappedEntity::LanguageDependency { model, language } => {
                    // version or name changed: re-attach with the new values
                    remove_local_language(ctx, &model, &language)?;
                    apply_used_language(ctx, read, &model, node)?;
                }
                other => debug!(?other, role, "Ignored property change"),
            }
            Ok(())
        });
    }

    fn reference_changed(&self, node: RemoteNodeId, role: &str) {
        let role = role.to_string();
        self.apply(format!("reference '{role}' of remote node {node}"), move |ctx, read| {
            match ctx.identity().lookup(node) {
                Some(MappedEntity::Node(id)) => {
                    let target = read.reference(node, &role)?;
                    apply_reference(ctx, &id, &role, target)
                }
                Some(MappedEntity::ModelImport { model, target })
                    if role == roles::IMPORTED_MODEL =>
                {
                    ctx.local().remove_model_import(&model, &target)?;
                    ctx.identity().remove(node);
                    apply_model_import(ctx, read, &model, node)
                }
                Some(other) => {
                    debug!(?other, role, "Ignored reference change");
                    Ok(())
                }
                None => {
                    debug!(remote = %node, "Reference changed on an unmapped node");
                    Ok(())
                }
            }
        });
    }

    fn node_added(&self, node: RemoteNodeId) {
        self.apply(format!("new remote node {node}"), move |ctx, read| {
            if ctx.identity().is_mapped(node) {
                debug!(remote = %node, "Added node is already mapped");
                return Ok(());
            }
            if !read.contains(node) {
                debug!(remote = %node, "Added node is already gone");
                return Ok(());
            }
            let parent = read.parent(node)?;
            let parent_entity = parent.and_then(|parent| ctx.identity().lookup(parent));
            match EntityKind::classify(&read.concept(node)?) {
                EntityKind::Module => {
                    let handle = transform_module(ctx, node, true);
                    ctx.report(&handle, SyncDirection::RemoteToLocal, format!("new module {node}"));
                }
                EntityKind::Model => {
                    if !matches!(parent_entity, Some(MappedEntity::Module(_))) {
                        debug!(remote = %node, "Model added to an unsynchronized module");
                        return Ok(());
                    }
                    add_model(ctx, node);
                }
                EntityKind::ModuleDependency => {
                    if let Some(MappedEntity::Module(module)) = parent_entity {
                        apply_module_dependency(ctx, read, &module, node)?;
                    }
                }
                EntityKind::ModelImport => {
                    if let Some(MappedEntity::Model(model)) = parent_entity {
                        apply_model_import(ctx, read, &model, node)?;
                    }
                }
                EntityKind::LanguageDependency | EntityKind::DevKitDependency => {
                    match parent_entity {
                        Some(MappedEntity::Model(model)) => {
                            apply_used_language(ctx, read, &model, node)?
                        }
                        Some(MappedEntity::Module(module)) => {
                            // a module-level language applies to each model of the module
                            let used = read_used_language(read, node)?;
                            for model in ctx.identity().models_of_module(&module) {
                                used.add_to(ctx.local().as_ref(), &model)?;
                            }
                        }
                        _ => {}
                    }
                }
                EntityKind::PlainNode => {
                    create_local_node(ctx, read, node)?;
                }
            }
            Ok(())
        });
    }

    fn node_removed(&self, node: RemoteNodeId) {
        self.apply(format!("removal of remote node {node}"), move |ctx, _read| {
            let Some(entity) = ctx.identity().lookup(node) else {
                return Ok(());
            };
            let local = ctx.local();
            match entity {
                MappedEntity::Node(id) => {
                    for removed in local.subtree(&id) {
                        ctx.identity().remove_node(&removed);
                    }
                    ctx.identity().remove(node);
                    if local.node(&id).is_some() {
                        local.delete_node(&id)?;
                    }
                }
                MappedEntity::Model(model) => remove_model(ctx, model),
                MappedEntity::Module(module) => remove_module(ctx, module),
                MappedEntity::ModuleDependency { module, target } => {
                    ctx.identity().remove(node);
                    local.remove_module_dependency(&module, &target)?;
                }
                MappedEntity::ModelImport { model, target } => {
                    ctx.identity().remove(node);
                    local.remove_model_import(&model, &target)?;
                }
                MappedEntity::LanguageDependency { model, language } => {
                    ctx.identity().remove(node);
                    remove_local_language(ctx, &model, &language)?;
                }
            }
            Ok(())
        });
    }

    fn containment_changed(&self, node: RemoteNodeId) {
        self.apply(format!("move of remote node {node}"), move |ctx, read| {
            match ctx.identity().lookup(node) {
                Some(MappedEntity::Node(id)) => match local_location(ctx, read, node)? {
                    Some((location, model)) => {
                        ctx.local().move_node(&id, location)?;
                        if ctx.identity().model_of_node(&id).as_ref() != Some(&model) {
                            for moved in ctx.local().subtree(&id) {
                                ctx.identity().move_node(&moved, &model)?;
                            }
                        }
                    }
                    None => {
                        debug!(remote = %node, "Node moved out of synchronized models");
                        for removed in ctx.local().subtree(&id) {
                            ctx.identity().remove_node(&removed);
                        }
                        ctx.local().delete_node(&id)?;
                    }
                },
                Some(MappedEntity::Model(model)) => {
                    let module = read
                        .parent(node)?
                        .and_then(|parent| ctx.identity().get_module(parent))
                        .ok_or_else(|| {
                            SyncError::mapping(format!("Model {model} moved to an unmapped module"))
                        })?;
                    ctx.local().move_model(&model, &module)?;
                    ctx.identity().move_model(&model, &module)?;
                    if ctx.bindings().model_binding(&model).is_some() {
                        ctx.bindings().move_model_binding(&model, &module)?;
                    }
                }
                other => debug!(remote = %node, ?other, "Ignored containment change"),
            }
            Ok(())
        });
    }

    fn children_changed(&self, node: RemoteNodeId, role: &str) {
        let Some(ctx) = self.context.upgrade() else {
            return;
        };
        let task_ctx = Arc::clone(&ctx);
        let handle = ctx
            .scheduler()
            .enqueue(SyncLock::LocalWrite, SyncDirection::RemoteToLocal, move || {
                task_ctx
                    .references()
                    .resolve(task_ctx.identity(), task_ctx.local().as_ref());
                Ok(())
            });
        ctx.report(
            &handle,
            SyncDirection::RemoteToLocal,
            format!("children '{role}' of remote node {node}"),
        );
    }
}

/// Materialize a model added to a synchronized module, resolve its references and bind it.
fn add_model(ctx: &Arc<SyncContext>, node: RemoteNodeId) {
    let task_ctx = Arc::clone(ctx);
    let bind_ctx = Arc::clone(ctx);
    let handle = transform_model(ctx, node)
        .continue_with(SyncLock::LocalWrite, SyncDirection::RemoteToLocal, move |model| {
            task_ctx
                .references()
                .resolve(task_ctx.identity(), task_ctx.local().as_ref());
            Ok(model)
        })
        .continue_with(SyncLock::None, SyncDirection::None, move |model: ModelId| {
            bind_model(&bind_ctx, &model)?;
            info!(model = %model, "Model synchronized from remote");
            Ok(())
        });
    ctx.report(&handle, SyncDirection::RemoteToLocal, format!("new model {node}"));
}

/// Deactivate the binding of a model removed remotely, then delete it locally.
fn remove_model(ctx: &Arc<SyncContext>, model: ModelId) {
    let task_ctx = Arc::clone(ctx);
    let deactivated = match ctx.bindings().model_binding(&model) {
        Some(binding) => binding.deactivate(false),
        None => {
            ctx.identity().remove_model(&model);
            ctx.scheduler().ready(())
        }
    };
    let target = model.clone();
    let handle = deactivated.continue_with(
        SyncLock::LocalWrite,
        SyncDirection::RemoteToLocal,
        move |()| {
            if task_ctx.local().model(&target).is_some() {
                task_ctx.local().delete_model(&target)?;
            }
            Ok(())
        },
    );
    ctx.report(&handle, SyncDirection::RemoteToLocal, format!("removal of model {model}"));
}

/// Deactivate the binding of a module removed remotely, then delete it locally.
fn remove_module(ctx: &Arc<SyncContext>, module: ModuleId) {
    let task_ctx = Arc::clone(ctx);
    let deactivated = match ctx.bindings().module_binding(&module) {
        Some(binding) => binding.deactivate(false),
        None => {
            ctx.identity().remove_module(&module);
            ctx.scheduler().ready(())
        }
    };
    let target = module.clone();
    let handle = deactivated.continue_with(
        SyncLock::LocalWrite,
        SyncDirection::RemoteToLocal,
        move |()| {
            if task_ctx.local().module(&target).is_some() {
                task_ctx.local().delete_module(&target)?;
            }
            Ok(())
        },
    );
    ctx.report(&handle, SyncDirection::RemoteToLocal, format!("removal of module {module}"));
}

fn remove_local_language(
    ctx: &SyncContext,
    model: &ModelId,
    language: &ModuleId,
) -> Result<(), SyncError> {
    let Some(local_model) = ctx.local().model(model) else {
        return Ok(());
    };
    if local_model.languages.contains_key(language) {
        ctx.local().remove_language_dependency(model, language)?;
    } else if local_model.devkits.contains_key(language) {
        ctx.local().remove_devkit_dependency(model, language)?;
    }
    Ok(())
}
