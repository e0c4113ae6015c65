use crate::concept::{properties, roles};
use crate::context::SyncContext;
use crate::error::SyncError;
use crate::scheduler::{current_direction, Scheduler, SyncDirection, SyncLock};
use crate::store::{LocalChangeListener, LocalEdit, NodeLocation, RemoteWrite};
use crate::transform::{
    link_references, push_model, remote_target, write_language_dependency, write_model_import,
    write_module_dependency, write_subtree, UsedLanguage,
};
use crate::types::{LocalNodeId, ModelId, ModuleId, RemoteNodeId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

enum PumpMessage {
    Edit(LocalEdit),
    /// Answered once every edit sent before it was handed to the scheduler.
    Barrier(oneshot::Sender<()>),
}

/// Entry of the local→remote pipeline. Registered as listener on the local store.
pub struct EditSink {
    sender: SyncSender<PumpMessage>,
    receiver: Mutex<Option<Receiver<PumpMessage>>>,
    pending: Arc<AtomicUsize>,
}

impl EditSink {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, receiver) = sync_channel(capacity.max(1));
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Spawn the pump thread. It stops once the session is dropped.
    pub(crate) fn start_pump(
        &self,
        context: Weak<SyncContext>,
        poll_interval: Duration,
    ) -> Result<(), SyncError> {
        let Some(receiver) = self.receiver.lock().take() else {
            return Ok(());
        };
        let pending = Arc::clone(&self.pending);
        std::thread::Builder::new()
            .name("treesync-edit-pump".to_string())
            .spawn(move || pump(receiver, context, pending, poll_interval))?;
        Ok(())
    }

    /// Edits received but not yet handed to the scheduler.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait until every edit received so far has been mirrored and the scheduler is idle.
    pub async fn settle(&self, scheduler: &Scheduler) {
        loop {
            let (done, answered) = oneshot::channel();
            let mut message = PumpMessage::Barrier(done);
            loop {
                match self.sender.try_send(message) {
                    Ok(()) => break,
                    Err(TrySendError::Full(returned)) => {
                        message = returned;
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                    Err(TrySendError::Disconnected(_)) => return,
                }
            }
            let _ = answered.await;
            scheduler.wait_idle().await;
            if self.pending() == 0 && scheduler.is_idle() {
                return;
            }
        }
    }
}

impl LocalChangeListener for EditSink {
    fn on_edit(&self, edit: &LocalEdit) {
        if current_direction() == Some(SyncDirection::RemoteToLocal) {
            trace!(?edit, "Dropped local edit made by the remote→local propagator");
            return;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(PumpMessage::Edit(edit.clone())).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            warn!(?edit, "Edit pump stopped, local edit is not synchronized");
        }
    }
}

fn pump(
    receiver: Receiver<PumpMessage>,
    context: Weak<SyncContext>,
    pending: Arc<AtomicUsize>,
    poll_interval: Duration,
) {
    debug!("Edit pump started");
    loop {
        match receiver.recv_timeout(poll_interval) {
            Ok(PumpMessage::Edit(edit)) => {
                if let Some(ctx) = context.upgrade() {
                    propagate(&ctx, edit);
                }
                pending.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(PumpMessage::Barrier(done)) => {
                let _ = done.send(());
            }
            Err(RecvTimeoutError::Timeout) => {
                if context.strong_count() == 0 {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Edit pump stopped");
}

/// Identity map change whose validity depends on the outcome of a remote transaction.
enum IdentityChange {
    /// Forget a remote node with everything it owns.
    Unmap(RemoteNodeId),
    UnmapLocal(LocalNodeId),
    MoveNodes { nodes: Vec<LocalNodeId>, model: ModelId },
    MoveModel { model: ModelId, module: ModuleId },
}

impl IdentityChange {
    fn apply(self, ctx: &SyncContext) -> Result<(), SyncError> {
        match self {
            IdentityChange::Unmap(remote) => {
                ctx.identity().remove(remote);
            }
            IdentityChange::UnmapLocal(local) => {
                ctx.identity().remove_node(&local);
            }
            IdentityChange::MoveNodes { nodes, model } => {
                for node in &nodes {
                    ctx.identity().move_node(node, &model)?;
                }
            }
            IdentityChange::MoveModel { model, module } => {
                ctx.identity().move_model(&model, &module)?;
                if ctx.bindings().model_binding(&model).is_some() {
                    ctx.bindings().move_model_binding(&model, &module)?;
                }
            }
        }
        Ok(())
    }
}

/// Identity changes of one mirrored edit. Mappings removed or moved by the edit only change
/// once the remote commit succeeded; mappings added while writing are dropped if it failed.
#[derive(Default)]
struct Journal {
    on_commit: Vec<IdentityChange>,
    on_abort: Vec<IdentityChange>,
}

impl Journal {
    fn unmap(&mut self, remote: RemoteNodeId) {
        self.on_commit.push(IdentityChange::Unmap(remote));
    }

    fn forget_on_abort(&mut self, remote: Option<RemoteNodeId>) {
        if let Some(remote) = remote {
            self.on_abort.push(IdentityChange::Unmap(remote));
        }
    }

    fn settle(self, ctx: &SyncContext, written: Result<(), SyncError>) -> Result<(), SyncError> {
        match written {
            Ok(()) => self.on_commit.into_iter().try_for_each(|change| change.apply(ctx)),
            Err(err) => {
                for change in self.on_abort {
                    if let Err(undo) = change.apply(ctx) {
                        warn!(error = %undo, "Failed to roll back identity mapping");
                    }
                }
                Err(err)
            }
        }
    }
}

/// Queue one task mirroring `body` inside a remote write transaction.
fn mirror<F>(ctx: &Arc<SyncContext>, what: String, body: F)
where
    F: FnOnce(&SyncContext, &mut dyn RemoteWrite, &mut Journal) -> Result<(), SyncError>
        + Send
        + 'static,
{
    let task_ctx = Arc::clone(ctx);
    let handle = ctx.scheduler().enqueue(
        [SyncLock::LocalRead, SyncLock::RemoteWrite],
        SyncDirection::LocalToRemote,
        move || {
            let mut journal = Journal::default();
            let written = (|| -> Result<(), SyncError> {
                let branch = task_ctx.branch()?;
                let mut write = branch.write()?;
                body(&task_ctx, write.as_mut(), &mut journal)?;
                write.commit()?;
                Ok(())
            })();
            journal.settle(&task_ctx, written)
        },
    );
    ctx.report(&handle, SyncDirection::LocalToRemote, what);
}

fn remote_node(ctx: &SyncContext, node: &LocalNodeId) -> Result<RemoteNodeId, SyncError> {
    ctx.identity()
        .get_remote(node)
        .ok_or_else(|| SyncError::mapping(format!("Node {node} is not mapped to the remote store")))
}

fn remote_model(ctx: &SyncContext, model: &ModelId) -> Result<RemoteNodeId, SyncError> {
    ctx.identity().get_remote_model(model).ok_or_else(|| {
        SyncError::mapping(format!("Model {model} is not mapped to the remote store"))
    })
}

fn remote_module(ctx: &SyncContext, module: &ModuleId) -> Result<RemoteNodeId, SyncError> {
    ctx.identity().get_remote_module(module).ok_or_else(|| {
        SyncError::mapping(format!("Module {module} is not mapped to the remote store"))
    })
}

/// Position of `child` among the children of `parent` in `role`.
fn child_index(
    ctx: &SyncContext,
    parent: &LocalNodeId,
    role: &str,
    child: &LocalNodeId,
) -> Option<usize> {
    ctx.local().node(parent).and_then(|parent| {
        parent
            .children
            .iter()
            .filter(|(child_role, _)| child_role == role)
            .position(|(_, id)| id == child)
    })
}

/// Write a new local subtree below `parent` and link its references.
fn add_subtree(
    ctx: &SyncContext,
    write: &mut dyn RemoteWrite,
    journal: &mut Journal,
    node: &LocalNodeId,
    parent: RemoteNodeId,
    role: &str,
    index: Option<usize>,
) -> Result<(), SyncError> {
    if ctx.identity().is_mapped_local_node(node) {
        debug!(node = %node, "Node already on the remote store");
        return Ok(());
    }
    journal
        .on_abort
        .extend(ctx.local().subtree(node).into_iter().map(IdentityChange::UnmapLocal));
    let edges = write_subtree(ctx, write, node, parent, role, index)?;
    link_references(ctx, write, edges)
}

/// Delete a remote subtree whose local counterpart is gone, unmapping it once committed.
fn remove_subtree(
    ctx: &SyncContext,
    write: &mut dyn RemoteWrite,
    journal: &mut Journal,
    node: &LocalNodeId,
) -> Result<(), SyncError> {
    let Some(remote) = ctx.identity().get_remote(node) else {
        debug!(node = %node, "Removed node was never synchronized");
        return Ok(());
    };
    if write.contains(remote) {
        for id in write.subtree(remote)? {
            journal.unmap(id);
        }
        write.delete_node(remote)?;
    } else {
        journal.unmap(remote);
    }
    Ok(())
}

fn delete_mapped(
    write: &mut dyn RemoteWrite,
    journal: &mut Journal,
    remote: Option<RemoteNodeId>,
) -> Result<(), SyncError> {
    if let Some(remote) = remote {
        if write.contains(remote) {
            write.delete_node(remote)?;
        }
        journal.unmap(remote);
    }
    Ok(())
}

/// Mirror one local edit onto the remote store.
pub(crate) fn propagate(ctx: &Arc<SyncContext>, edit: LocalEdit) {
    trace!(?edit, "Propagating local edit");
    match edit {
        LocalEdit::NodePropertyChanged { node, property, value } => {
            if ctx.settings().is_ignored(&property) || property == properties::LOCAL_ID {
                return;
            }
            mirror(ctx, format!("property '{property}' of node {node}"), move |ctx, write, _| {
                let remote = remote_node(ctx, &node)?;
                write.set_property(remote, &property, value.as_deref())?;
                Ok(())
            });
        }
        LocalEdit::NodeReferenceChanged { node, role, target } => {
            mirror(ctx, format!("reference '{role}' of node {node}"), move |ctx, write, _| {
                let remote = remote_node(ctx, &node)?;
                let target = target.map(|target| remote_target(ctx, &target));
                write.set_reference(remote, &role, target)?;
                Ok(())
            });
        }
        LocalEdit::ChildAdded { parent, role, child } => {
            mirror(ctx, format!("new child {child} of node {parent}"), move |ctx, write, journal| {
                let parent_remote = remote_node(ctx, &parent)?;
                let index = child_index(ctx, &parent, &role, &child);
                add_subtree(ctx, write, journal, &child, parent_remote, &role, index)
            });
        }
        LocalEdit::ChildRemoved { child, .. } | LocalEdit::RootRemoved { node: child, .. } => {
            mirror(ctx, format!("removal of node {child}"), move |ctx, write, journal| {
                remove_subtree(ctx, write, journal, &child)
            });
        }
        LocalEdit::RootAdded { model, node } => {
            mirror(ctx, format!("new root {node} of model {model}"), move |ctx, write, journal| {
                let model_remote = remote_model(ctx, &model)?;
                let index = ctx
                    .local()
                    .model(&model)
                    .and_then(|m| m.roots.iter().position(|root| *root == node));
                add_subtree(ctx, write, journal, &node, model_remote, roles::ROOT_NODES, index)
            });
        }
        LocalEdit::NodeMoved { node, to } => {
            mirror(ctx, format!("move of node {node}"), move |ctx, write, journal| {
                let remote = remote_node(ctx, &node)?;
                let (parent, role, index, model) = match &to {
                    NodeLocation::Root(model) => {
                        let index = ctx
                            .local()
                            .model(model)
                            .and_then(|m| m.roots.iter().position(|root| *root == node));
                        (
                            remote_model(ctx, model)?,
                            roles::ROOT_NODES.to_string(),
                            index,
                            model.clone(),
                        )
                    }
                    NodeLocation::Child { parent, role, .. } => {
                        let model = ctx
                            .local()
                            .node(parent)
                            .map(|p| p.model)
                            .ok_or_else(|| SyncError::ParentNotFound(node.to_string()))?;
                        let index = child_index(ctx, parent, role, &node);
                        (remote_node(ctx, parent)?, role.clone(), index, model)
                    }
                };
                write.move_child(parent, &role, index, remote)?;
                if ctx.identity().model_of_node(&node).as_ref() != Some(&model) {
                    journal.on_commit.push(IdentityChange::MoveNodes {
                        nodes: ctx.local().subtree(&node),
                        model,
                    });
                }
                Ok(())
            });
        }
        LocalEdit::ModelPropertyChanged { model, property, value } => {
            if ctx.settings().is_ignored(&property) || property == properties::ID {
                return;
            }
            mirror(ctx, format!("property '{property}' of model {model}"), move |ctx, write, _| {
                let remote = remote_model(ctx, &model)?;
                write.set_property(remote, &property, value.as_deref())?;
                Ok(())
            });
        }
        LocalEdit::ModelImportAdded { model, target } => {
            mirror(ctx, format!("import of {target} in model {model}"), move |ctx, write, journal| {
                if ctx.identity().get_remote_model_import(&model, &target).is_none() {
                    write_model_import(ctx, write, &model, &target)?;
                    let written = ctx.identity().get_remote_model_import(&model, &target);
                    journal.forget_on_abort(written);
                }
                Ok(())
            });
        }
        LocalEdit::ModelImportRemoved { model, target } => {
            mirror(
                ctx,
                format!("removal of import {target} from model {model}"),
                move |ctx, write, journal| {
                    let remote = ctx.identity().get_remote_model_import(&model, &target);
                    delete_mapped(write, journal, remote)
                },
            );
        }
        LocalEdit::LanguageDependencyAdded { model, dependency } => {
            mirror(
                ctx,
                format!("language {} in model {model}", dependency.name),
                move |ctx, write, journal| {
                    let identity = ctx.identity();
                    if identity
                        .get_remote_language_dependency(&model, &dependency.language)
                        .is_none()
                    {
                        let model_remote = remote_model(ctx, &model)?;
                        let used = UsedLanguage::Language(&dependency);
                        write_language_dependency(ctx, write, &model, model_remote, used)?;
                        journal.forget_on_abort(
                            identity.get_remote_language_dependency(&model, &dependency.language),
                        );
                    }
                    Ok(())
                },
            );
        }
        LocalEdit::DevKitDependencyAdded { model, dependency } => {
            mirror(
                ctx,
                format!("devkit {} in model {model}", dependency.name),
                move |ctx, write, journal| {
                    let identity = ctx.identity();
                    if identity
                        .get_remote_language_dependency(&model, &dependency.devkit)
                        .is_none()
                    {
                        let model_remote = remote_model(ctx, &model)?;
                        let used = UsedLanguage::DevKit(&dependency);
                        write_language_dependency(ctx, write, &model, model_remote, used)?;
                        journal.forget_on_abort(
                            identity.get_remote_language_dependency(&model, &dependency.devkit),
                        );
                    }
                    Ok(())
                },
            );
        }
        LocalEdit::LanguageDependencyRemoved { model, language }
        | LocalEdit::DevKitDependencyRemoved { model, devkit: language } => {
            mirror(
                ctx,
                format!("removal of language {language} from model {model}"),
                move |ctx, write, journal| {
                    let remote = ctx.identity().get_remote_language_dependency(&model, &language);
                    delete_mapped(write, journal, remote)
                },
            );
        }
        LocalEdit::ModelAdded { module, model } => {
            if ctx.identity().is_mapped_local_model(&model) {
                return;
            }
            if ctx.bindings().module_binding(&module).is_none() {
                debug!(module = %module, model = %model, "Model added to an unbound module");
                return;
            }
            let handle = push_model(ctx, &model);
            ctx.report(&handle, SyncDirection::LocalToRemote, format!("new model {model}"));
        }
        LocalEdit::ModelRemoved { model, .. } => match ctx.bindings().model_binding(&model) {
            Some(binding) => {
                let handle = binding.deactivate(true);
                let what = format!("removal of model {model}");
                ctx.report(&handle, SyncDirection::LocalToRemote, what);
            }
            None => {
                mirror(ctx, format!("removal of model {model}"), move |ctx, write, journal| {
                    delete_mapped(write, journal, ctx.identity().get_remote_model(&model))
                });
            }
        },
        LocalEdit::ModelMoved { model, to, .. } => {
            let what = format!("move of model {model} to module {to}");
            mirror(ctx, what, move |ctx, write, journal| {
                let remote = remote_model(ctx, &model)?;
                let module_remote = remote_module(ctx, &to)?;
                write.move_child(module_remote, roles::MODELS, None, remote)?;
                journal.on_commit.push(IdentityChange::MoveModel { model, module: to });
                Ok(())
            });
        }
        LocalEdit::ModulePropertyChanged { module, property, value } => {
            if ctx.settings().is_ignored(&property) || property == properties::ID {
                return;
            }
            mirror(ctx, format!("property '{property}' of module {module}"), move |ctx, write, _| {
                let remote = remote_module(ctx, &module)?;
                write.set_property(remote, &property, value.as_deref())?;
                Ok(())
            });
        }
        LocalEdit::ModuleDependencyAdded { module, dependency } => {
            mirror(
                ctx,
                format!("dependency {} of module {module}", dependency.name),
                move |ctx, write, journal| {
                    let identity = ctx.identity();
                    if identity
                        .get_remote_module_dependency(&module, &dependency.target)
                        .is_some()
                    {
                        return Ok(());
                    }
                    let module_remote = remote_module(ctx, &module)?;
                    write_module_dependency(ctx, write, &module, module_remote, &dependency)?;
                    journal.forget_on_abort(
                        identity.get_remote_module_dependency(&module, &dependency.target),
                    );
                    Ok(())
                },
            );
        }
        LocalEdit::ModuleDependencyRemoved { module, target } => {
            mirror(
                ctx,
                format!("removal of dependency {target} from module {module}"),
                move |ctx, write, journal| {
                    let remote = ctx.identity().get_remote_module_dependency(&module, &target);
                    delete_mapped(write, journal, remote)
                },
            );
        }
        LocalEdit::ModuleAdded { module } => {
            debug!(module = %module, "Module added locally, not bound");
        }
        LocalEdit::ModuleRemoved { module } => {
            if let Some(binding) = ctx.bindings().module_binding(&module) {
                let handle = binding.deactivate(true);
                let what = format!("removal of module {module}");
                ctx.report(&handle, SyncDirection::LocalToRemote, what);
            }
        }
    }
}
