use super::{deactivation_failed, delete_remote, BindingState, Lifecycle};
use crate::binding::{BindingEventKind, BindingRef};
use crate::context::SyncContext;
use crate::error::SyncError;
use crate::scheduler::{Scheduler, SyncDirection, SyncLock, TaskHandle};
use crate::store::ListenerScope;
use crate::types::ModuleId;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Binding of one local module. Its model bindings live in the registry.
pub struct ModuleBinding {
    module: ModuleId,
    name: String,
    context: Weak<SyncContext>,
    scheduler: Scheduler,
    lifecycle: Mutex<Lifecycle>,
}

impl ModuleBinding {
    pub(crate) fn new(ctx: &Arc<SyncContext>, module: ModuleId, module_name: &str) -> Arc<Self> {
        Arc::new(Self {
            module,
            name: format!("Binding of Module '{module_name}'"),
            context: Arc::downgrade(ctx),
            scheduler: ctx.scheduler().clone(),
            lifecycle: Mutex::new(Lifecycle::new()),
        })
    }

    pub fn module(&self) -> &ModuleId {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BindingState {
        self.lifecycle.lock().state
    }

    pub fn activate(&self) -> Result<(), SyncError> {
        let ctx = self.context.upgrade().ok_or(SyncError::SessionClosed)?;
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != BindingState::Created {
                return Ok(());
            }
            let id = ctx.local().add_listener(
                ListenerScope::Module(self.module.clone()),
                ctx.edit_listener(),
            );
            lifecycle.listeners.push(id);
            lifecycle.state = BindingState::Activated;
        }
        ctx.bindings().publish(
            BindingEventKind::Activated,
            BindingRef::Module(self.module.clone()),
            &self.name,
        );
        info!(binding = %self.name, "Activated binding");
        Ok(())
    }

    /// Deactivate every model binding of the module, then the module binding itself.
    ///
    /// Completes after every child reached a terminal state. When a child fails, the module
    /// still finishes its own bookkeeping once all children are gone and reports the first
    /// child failure.
    pub fn deactivate(self: &Arc<Self>, remove_from_remote: bool) -> TaskHandle<()> {
        let handle = {
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
            let children = self
                .scheduler
                .enqueue(SyncLock::None, SyncDirection::None, move || {
                    this.lifecycle.lock().unregister(&task_ctx, &this.name);
                    let handles = task_ctx
                        .bindings()
                        .model_bindings_of(&this.module)
                        .iter()
                        .map(|child| child.deactivate(remove_from_remote))
                        .collect();
                    Ok(task_ctx.scheduler().join_all(handles))
                })
                .flatten();

            let this = Arc::clone(self);
            let task_ctx = Arc::clone(&ctx);
            let terminal = children.then(SyncLock::None, SyncDirection::None, move |children| {
                let remote = task_ctx.identity().get_remote_module(&this.module);
                task_ctx.bindings().remove_module_binding(&this.module)?;
                task_ctx.identity().remove_module(&this.module);
                this.lifecycle.lock().state = BindingState::Deactivated;
                task_ctx.bindings().publish(
                    BindingEventKind::Removed,
                    BindingRef::Module(this.module.clone()),
                    &this.name,
                );
                info!(binding = %this.name, "Deactivated binding");
                children.map(|_| remote)
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
        };

        // a module that could not reach its terminal state may be deactivated again
        let this = Arc::clone(self);
        handle.on_complete(move |result| {
            if result.is_err() {
                let mut lifecycle = this.lifecycle.lock();
                if lifecycle.state != BindingState::Deactivated {
                    warn!(binding = %this.name, "Deactivation did not complete");
                    lifecycle.deactivation = None;
                }
            }
        });
        handle
    }
}
