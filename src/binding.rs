//! Bindings
//!
//! A binding is the live synchronization relationship for one local model or module. It owns
//! the local listeners feeding the local→remote propagator and moves through
//! `Created → Activated → Deactivated`; deactivation is terminal.

mod event;
mod model;
mod module;
mod registry;

pub use event::{BindingEvent, BindingEventKind, BindingRef};
pub use model::ModelBinding;
pub use module::ModuleBinding;
pub use registry::BindingsRegistry;

use crate::context::SyncContext;
use crate::error::SyncError;
use crate::scheduler::TaskHandle;
use crate::types::{ListenerId, ModelId, ModuleId, RemoteNodeId};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Created,
    Activated,
    Deactivated,
}

/// Mutable part shared by both binding kinds.
struct Lifecycle {
    state: BindingState,
    listeners: Vec<ListenerId>,
    deactivation: Option<TaskHandle<()>>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: BindingState::Created,
            listeners: Vec::new(),
            deactivation: None,
        }
    }

    fn unregister(&mut self, ctx: &SyncContext, binding: &str) {
        for id in self.listeners.drain(..) {
            if let Err(err) = ctx.local().remove_listener(id) {
                warn!(binding, error = %err, "Listener was already gone");
            }
        }
    }
}

/// Either kind of binding.
#[derive(Clone)]
pub enum Binding {
    Model(Arc<ModelBinding>),
    Module(Arc<ModuleBinding>),
}

impl Binding {
    pub fn name(&self) -> &str {
        match self {
            Binding::Model(binding) => binding.name(),
            Binding::Module(binding) => binding.name(),
        }
    }

    pub fn state(&self) -> BindingState {
        match self {
            Binding::Model(binding) => binding.state(),
            Binding::Module(binding) => binding.state(),
        }
    }

    pub fn binding_ref(&self) -> BindingRef {
        match self {
            Binding::Model(binding) => BindingRef::Model(binding.model().clone()),
            Binding::Module(binding) => BindingRef::Module(binding.module().clone()),
        }
    }

    pub fn deactivate(&self, remove_from_remote: bool) -> TaskHandle<()> {
        match self {
            Binding::Model(binding) => binding.deactivate(remove_from_remote),
            Binding::Module(binding) => binding.deactivate(remove_from_remote),
        }
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Presentation order: model bindings before module bindings, then by name.
pub fn presentation_order(a: &Binding, b: &Binding) -> Ordering {
    let rank = |binding: &Binding| match binding {
        Binding::Model(_) => 0,
        Binding::Module(_) => 1,
    };
    rank(a).cmp(&rank(b)).then_with(|| a.name().cmp(b.name()))
}

fn deactivation_failed(binding: &str, err: SyncError) -> SyncError {
    match err {
        SyncError::DeactivationFailed { .. } => err,
        other => SyncError::DeactivationFailed {
            binding: binding.to_string(),
            cause: other.to_string(),
        },
    }
}

/// Delete the remote counterpart of a deactivated binding, if it is still there.
fn delete_remote(ctx: &SyncContext, remote: RemoteNodeId) -> Result<(), SyncError> {
    let branch = ctx.branch()?;
    let mut write = branch.write()?;
    if !write.contains(remote) {
        debug!(remote = %remote, "Remote node already deleted");
        return Ok(());
    }
    write.delete_node(remote)?;
    write.commit()?;
    Ok(())
}

/// Register and activate the binding of `module` unless one exists.
pub(crate) fn bind_module(
    ctx: &Arc<SyncContext>,
    module: &ModuleId,
) -> Result<Arc<ModuleBinding>, SyncError> {
    if let Some(existing) = ctx.bindings().module_binding(module) {
        return Ok(existing);
    }
    let name = ctx
        .local()
        .module(module)
        .map(|m| m.name)
        .ok_or_else(|| SyncError::mapping(format!("Local module {module} not found")))?;
    let binding = ModuleBinding::new(ctx, module.clone(), &name);
    if let Err(err) = ctx.bindings().add_module_binding(Arc::clone(&binding)) {
        return registered_meanwhile(err, || ctx.bindings().module_binding(module));
    }
    binding.activate()?;
    Ok(binding)
}

/// Register and activate the binding of `model`, binding its module first when needed.
pub(crate) fn bind_model(
    ctx: &Arc<SyncContext>,
    model: &ModelId,
) -> Result<Arc<ModelBinding>, SyncError> {
    if let Some(existing) = ctx.bindings().model_binding(model) {
        return Ok(existing);
    }
    let local = ctx
        .local()
        .model(model)
        .ok_or_else(|| SyncError::mapping(format!("Local model {model} not found")))?;
    bind_module(ctx, &local.module)?;
    let binding = ModelBinding::new(ctx, model.clone(), &local.name);
    if let Err(err) = ctx
        .bindings()
        .add_model_binding(&local.module, Arc::clone(&binding))
    {
        return registered_meanwhile(err, || ctx.bindings().model_binding(model));
    }
    binding.activate()?;
    Ok(binding)
}

/// A conflicting registration made by a concurrent bind since our lookup wins.
fn registered_meanwhile<B>(
    err: SyncError,
    lookup: impl FnOnce() -> Option<B>,
) -> Result<B, SyncError> {
    if matches!(err, SyncError::BindingConflict(_)) {
        if let Some(existing) = lookup() {
            debug!(error = %err, "Binding registered concurrently, using it");
            return Ok(existing);
        }
    }
    Err(err)
}

/// Bind a module together with every mapped model of it.
pub(crate) fn bind_module_with_models(
    ctx: &Arc<SyncContext>,
    module: &ModuleId,
) -> Result<(), SyncError> {
    bind_module(ctx, module)?;
    for model in ctx.identity().models_of_module(module) {
        bind_model(ctx, &model)?;
    }
    Ok(())
}
