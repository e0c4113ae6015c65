//! Bindings Registry
//!
//! Owns every live binding, indexed by local module and model identity. Model bindings are
//! recorded under their module binding's id rather than held by the module binding itself.

use super::event::{BindingEvent, BindingEventKind, BindingRef, EventLog};
use super::{presentation_order, Binding, ModelBinding, ModuleBinding};
use crate::error::SyncError;
use crate::scheduler::{Scheduler, TaskHandle};
use crate::types::{ModelId, ModuleId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
struct RegistryState {
    modules: BTreeMap<ModuleId, Arc<ModuleBinding>>,
    models: BTreeMap<ModuleId, BTreeMap<ModelId, Arc<ModelBinding>>>,
}

impl RegistryState {
    fn owner_of(&self, model: &ModelId) -> Option<ModuleId> {
        self.models
            .iter()
            .find(|(_, models)| models.contains_key(model))
            .map(|(module, _)| module.clone())
    }
}

#[derive(Default)]
pub struct BindingsRegistry {
    state: RwLock<RegistryState>,
    events: EventLog,
}

impl BindingsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_module_binding(&self, binding: Arc<ModuleBinding>) -> Result<(), SyncError> {
        {
            let mut state = self.state.write();
            if state.modules.contains_key(binding.module()) {
                return Err(SyncError::BindingConflict(format!(
                    "{} is already registered",
                    binding.name()
                )));
            }
            state
                .modules
                .insert(binding.module().clone(), Arc::clone(&binding));
            state.models.entry(binding.module().clone()).or_default();
        }
        self.publish(
            BindingEventKind::Added,
            BindingRef::Module(binding.module().clone()),
            binding.name(),
        );
        Ok(())
    }

    /// Register a model binding under `module`, whose binding must already be registered.
    pub fn add_model_binding(
        &self,
        module: &ModuleId,
        binding: Arc<ModelBinding>,
    ) -> Result<(), SyncError> {
        {
            let mut state = self.state.write();
            if !state.modules.contains_key(module) {
                return Err(SyncError::BindingConflict(format!(
                    "{} needs a binding of module {module} first",
                    binding.name()
                )));
            }
            if let Some(owner) = state.owner_of(binding.model()) {
                return Err(SyncError::BindingConflict(format!(
                    "{} is already registered under module {owner}",
                    binding.name()
                )));
            }
            state
                .models
                .entry(module.clone())
                .or_default()
                .insert(binding.model().clone(), Arc::clone(&binding));
        }
        self.publish(
            BindingEventKind::Added,
            BindingRef::Model(binding.model().clone()),
            binding.name(),
        );
        Ok(())
    }

    pub fn remove_model_binding(&self, model: &ModelId) -> Option<Arc<ModelBinding>> {
        let removed = {
            let mut state = self.state.write();
            let owner = state.owner_of(model)?;
            state.models.get_mut(&owner).and_then(|models| models.remove(model))
        };
        if let Some(binding) = &removed {
            debug!(binding = binding.name(), "Removed model binding from registry");
        }
        removed
    }

    /// Fails while any model binding of the module is still registered.
    pub fn remove_module_binding(
        &self,
        module: &ModuleId,
    ) -> Result<Option<Arc<ModuleBinding>>, SyncError> {
        let mut state = self.state.write();
        let Some(binding) = state.modules.get(module).cloned() else {
            return Ok(None);
        };
        if state.models.get(module).is_some_and(|models| !models.is_empty()) {
            return Err(SyncError::BindingNotEmpty(binding.name().to_string()));
        }
        state.models.remove(module);
        state.modules.remove(module);
        debug!(binding = binding.name(), "Removed module binding from registry");
        Ok(Some(binding))
    }

    /// Record that a bound model now belongs to another module binding.
    pub fn move_model_binding(&self, model: &ModelId, to: &ModuleId) -> Result<(), SyncError> {
        let mut state = self.state.write();
        if !state.modules.contains_key(to) {
            return Err(SyncError::BindingConflict(format!("module {to} is not bound")));
        }
        let Some(from) = state.owner_of(model) else {
            return Ok(());
        };
        if let Some(binding) = state.models.get_mut(&from).and_then(|m| m.remove(model)) {
            state
                .models
                .entry(to.clone())
                .or_default()
                .insert(model.clone(), binding);
        }
        Ok(())
    }

    pub fn module_binding(&self, module: &ModuleId) -> Option<Arc<ModuleBinding>> {
        self.state.read().modules.get(module).cloned()
    }

    pub fn model_binding(&self, model: &ModelId) -> Option<Arc<ModelBinding>> {
        self.state
            .read()
            .models
            .values()
            .find_map(|models| models.get(model).cloned())
    }

    pub fn model_bindings_of(&self, module: &ModuleId) -> Vec<Arc<ModelBinding>> {
        self.state
            .read()
            .models
            .get(module)
            .map(|models| models.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn module_bindings(&self) -> Vec<Arc<ModuleBinding>> {
        self.state.read().modules.values().cloned().collect()
    }

    pub fn module_ids(&self) -> Vec<ModuleId> {
        self.state.read().modules.keys().cloned().collect()
    }

    /// Every binding, in presentation order.
    pub fn bindings(&self) -> Vec<Binding> {
        let state = self.state.read();
        let mut all: Vec<Binding> = state
            .modules
            .values()
            .cloned()
            .map(Binding::Module)
            .chain(
                state
                    .models
                    .values()
                    .flat_map(|models| models.values().cloned())
                    .map(Binding::Model),
            )
            .collect();
        all.sort_by(presentation_order);
        all
    }

    pub fn len(&self) -> usize {
        let state = self.state.read();
        state.modules.len() + state.models.values().map(BTreeMap::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deactivate every module binding; completes once all of them reached a terminal state.
    pub fn deactivate_all(
        &self,
        scheduler: &Scheduler,
        remove_from_remote: bool,
    ) -> TaskHandle<Vec<()>> {
        let handles = self
            .module_bindings()
            .iter()
            .map(|binding| binding.deactivate(remove_from_remote))
            .collect();
        scheduler.join_all(handles)
    }

    /// Forget every binding without deactivating it.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.modules.clear();
        state.models.clear();
    }

    pub fn events_since(&self, seq: u64) -> Vec<BindingEvent> {
        self.events.since(seq)
    }

    pub fn subscribe(&self) -> Receiver<BindingEvent> {
        self.events.subscribe()
    }

    pub fn last_event_seq(&self) -> u64 {
        self.events.last_seq()
    }

    pub(crate) fn publish(&self, kind: BindingEventKind, binding: BindingRef, name: &str) {
        self.events.publish(kind, binding, name);
    }
}
