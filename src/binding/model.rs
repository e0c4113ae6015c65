use super::{deactivation_failed, delete_remote, BindingState, Lifecycle};
use crate::binding::{BindingEventKind, BindingRef};
use crate::context::SyncContext;
use crate::error::SyncError;
use crate::scheduler::{Scheduler, SyncDirection, SyncLock, TaskHandle};
use crate::store::ListenerScope;
use crate::types::ModelId;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Binding of one local model: listens to its nodes and to the model itself.
pub struct ModelBinding {
    model: ModelId,
    name: String,
    context: Weak<SyncContext>,
    scheduler: Scheduler,
    lifecycle: Mutex<Lifecycle>,
}

impl ModelBinding {
    pub(crate) fn new(ctx: &Arc<SyncContext>, model: ModelId, model_name: &str) -> Arc<Self> {
        Arc::new(Self {
            model,
            name: format!("Binding of Model '{model_name}'"),
            context: Arc::downgrade(ctx),
            scheduler: ctx.scheduler().clone(),
            lifecycle: Mutex::new(Lifecycle::new()),
        })
    }

    pub fn model(&self) -> &ModelId {
        &self.model
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BindingState {
        self.lifecycle.lock().state
    }

    /// Install the local listeners. No-op unless the binding is freshly created.
    pub fn activate(&self) -> Result<(), SyncError> {
        let ctx = self.context.upgrade().ok_or(SyncError::SessionClosed)?;
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != BindingState::Created {
                return Ok(());
            }
            let listener = ctx.edit_listener();
            let local = ctx.local();
            lifecycle.listeners.push(
                local.add_listener(ListenerScope::Nodes(self.model.clone()), Arc::clone(&listener)),
            );
            lifecycle
                .listeners
                .push(local.add_listener(ListenerScope::Model(self.model.clone()), listener));
            lifecycle.state = BindingState::Activated;
        }
        ctx.bindings().publish(
            BindingEventKind::Activated,
            BindingRef::Model(self.model.clone()),
            &self.name,
        );
        info!(binding = %self.name, "Activated binding");
        Ok(())
    }

    /// Stop synchronizing the model.
    ///
    /// The binding is terminal once it left the registry and the identity map; deleting the
    /// remote model node, when requested, happens after that, so a failed remote deletion is
    /// reported without leaving the binding half alive.
    pub fn deactivate(self: &Arc<Self>, remove_from_remote: bool) -> TaskHandle<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == BindingState::Deactivated {
            return self.scheduler.ready(());
        }
        if let Some(in_progress) = &lifecycle.deactivation {
            return in_progress.clone();
        }
        let Some(ctx) = self.context.upgrade() else {
            return self.scheduler.failed(SyncError::SessionClosed);
        };
        debug!(binding = %self.name, remove_from_remote, "Deactivating binding");

        let this = Arc::clone(self);
        let task_ctx = Arc::clone(&ctx);
        let unregistered = self
            .scheduler
            .enqueue(SyncLock::None, SyncDirection::None, move || {
                this.lifecycle.lock().unregister(&task_ctx, &this.name);
                Ok(task_ctx.identity().get_remote_model(&this.model))
            });

        let this = Arc::clone(self);
        let task_ctx = Arc::clone(&ctx);
        let terminal =
            unregistered.continue_with(SyncLock::None, SyncDirection::None, move |remote| {
                task_ctx.bindings().remove_model_binding(&this.model);
                task_ctx.identity().remove_model(&this.model);
                this.lifecycle.lock().state = BindingState::Deactivated;
                task_ctx.bindings().publish(
                    BindingEventKind::Removed,
                    BindingRef::Model(this.model.clone()),
                    &this.name,
                );
                info!(binding = %this.name, "Deactivated binding");
                Ok(remote)
            });

        let finished = if remove_from_remote {
            terminal.continue_with(
                SyncLock::RemoteWrite,
                SyncDirection::LocalToRemote,
                move |remote| match remote {
                    Some(remote) => delete_remote(&ctx, remote),
                    None => Ok(()),
                },
            )
        } else {
            terminal.map(|_| ())
        };

        let name = self.name.clone();
        let handle = finished.map_err(move |err| deactivation_failed(&name, err));
        lifecycle.deactivation = Some(handle.clone());
        handle
    }
}
