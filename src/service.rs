//! Synchronization service
//!
//! Entry point of a session: connects to a branch, binds and unbinds modules and models in
//! either direction, and saves or restores the session state. Every failed operation is
//! reported to the notifier once, with the direction it failed in, and returned to the caller.

use crate::binding::{bind_model, bind_module, Binding};
use crate::concept::LanguageRepository;
use crate::config::SyncConfig;
use crate::context::{SyncContext, SyncSettings};
use crate::error::SyncError;
use crate::notify::{Notification, Notifier};
use crate::persistence::{PersistedState, StateStore};
use crate::scheduler::{Scheduler, SchedulerConfig, SyncDirection, SyncLock, TaskHandle};
use crate::store::{LocalRepository, RemoteBranch, RemoteClient, RemoteRead};
use crate::transform::{
    find_model, find_module, push_model, push_module, transform_model, transform_module,
    TransformOutcome,
};
use crate::types::{BranchRef, ModelId, ModuleId, RemoteNodeId, RepositoryId, VersionHash};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

pub struct SyncService {
    ctx: Arc<SyncContext>,
}

impl SyncService {
    /// Start a session configured from `config`. Must be called inside a tokio runtime.
    pub fn new(
        config: &SyncConfig,
        local: Arc<dyn LocalRepository>,
        languages: Arc<LanguageRepository>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, SyncError> {
        Self::with_settings(
            config.scheduler.clone(),
            config.settings(),
            local,
            languages,
            notifier,
        )
    }

    pub fn with_settings(
        scheduler: SchedulerConfig,
        settings: SyncSettings,
        local: Arc<dyn LocalRepository>,
        languages: Arc<LanguageRepository>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, SyncError> {
        let scheduler = Scheduler::new(scheduler);
        scheduler.start()?;
        let ctx = SyncContext::new(scheduler, local, languages, notifier, settings)?;
        Ok(Self { ctx })
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    /// Bindings in presentation order.
    pub fn bindings(&self) -> Vec<Binding> {
        self.ctx.bindings().bindings()
    }

    fn fail<T>(
        &self,
        direction: SyncDirection,
        message: String,
        err: SyncError,
    ) -> Result<T, SyncError> {
        if !err.is_echo() {
            self.ctx
                .notifier()
                .notify(Notification::failure(direction, message, &err));
        }
        Err(err)
    }

    async fn finish<T>(
        &self,
        handle: TaskHandle<T>,
        direction: SyncDirection,
        message: String,
    ) -> Result<T, SyncError>
    where
        T: Clone + Send + Sync + 'static,
    {
        match handle.join().await {
            Ok(value) => Ok(value),
            Err(err) => self.fail(direction, message, err),
        }
    }

    #[instrument(skip(self, client), fields(server = client.server_url()))]
    pub fn connect(
        &self,
        client: Arc<dyn RemoteClient>,
        branch: &BranchRef,
    ) -> Result<Arc<dyn RemoteBranch>, SyncError> {
        let connected = self.ctx.connection().connect(
            client,
            branch,
            self.ctx.remote_listener(),
            self.ctx.local(),
            self.ctx.edit_listener(),
        );
        match connected {
            Ok(branch) => Ok(branch),
            Err(err) => self.fail(SyncDirection::None, format!("Connecting to {branch}"), err),
        }
    }

    pub fn disconnect(&self) {
        self.ctx.connection().disconnect();
    }

    /// Materialize a remote module with its dependencies and bind it. Completes once the
    /// reference-resolution pass finished.
    #[instrument(skip(self))]
    pub async fn bind_module_from_remote(
        &self,
        module: &ModuleId,
    ) -> Result<TransformOutcome, SyncError> {
        let message = format!("Binding module {module}");
        let handle = self.start_module_transform(module, &message)?;
        self.finish(handle, SyncDirection::RemoteToLocal, message).await
    }

    /// Blocking form of [`bind_module_from_remote`](Self::bind_module_from_remote) for threads
    /// outside the async runtime. With a `timeout` the caller stops waiting after it elapses;
    /// the transform itself keeps running.
    ///
    /// Never call this from an async context or from a scheduler task.
    #[instrument(skip(self))]
    pub fn bind_module_from_remote_blocking(
        &self,
        module: &ModuleId,
        timeout: Option<Duration>,
    ) -> Result<TransformOutcome, SyncError> {
        let message = format!("Binding module {module}");
        let handle = self.start_module_transform(module, &message)?;
        let result = match timeout {
            Some(timeout) => handle
                .wait_timeout(timeout)
                .unwrap_or(Err(SyncError::TimedOut(timeout))),
            None => handle.wait(),
        };
        result.or_else(|err| self.fail(SyncDirection::RemoteToLocal, message, err))
    }

    fn start_module_transform(
        &self,
        module: &ModuleId,
        message: &str,
    ) -> Result<TaskHandle<TransformOutcome>, SyncError> {
        match self.locate(|read| find_module(read, module.as_str())) {
            Ok(Some(remote)) => Ok(transform_module(&self.ctx, remote, true)),
            Ok(None) => {
                let err = SyncError::mapping(format!("Module {module} is not on the remote store"));
                self.fail(SyncDirection::RemoteToLocal, message.to_string(), err)
            }
            Err(err) => self.fail(SyncDirection::RemoteToLocal, message.to_string(), err),
        }
    }

    /// Materialize one remote model of an already synchronized module and bind it.
    #[instrument(skip(self))]
    pub async fn bind_model_from_remote(&self, model: &ModelId) -> Result<(), SyncError> {
        let message = format!("Binding model {model}");
        let remote = match self.locate(|read| find_model(read, model.as_str())) {
            Ok(Some(remote)) => remote,
            Ok(None) => {
                let err = SyncError::mapping(format!("Model {model} is not on the remote store"));
                return self.fail(SyncDirection::RemoteToLocal, message, err);
            }
            Err(err) => return self.fail(SyncDirection::RemoteToLocal, message, err),
        };
        if self.ctx.identity().get_model(remote).is_some() {
            info!(model = %model, "Model already synchronized");
            return Ok(());
        }

        let resolve_ctx = Arc::clone(&self.ctx);
        let bind_ctx = Arc::clone(&self.ctx);
        let handle = transform_model(&self.ctx, remote)
            .continue_with(SyncLock::LocalWrite, SyncDirection::RemoteToLocal, move |model| {
                resolve_ctx
                    .references()
                    .resolve(resolve_ctx.identity(), resolve_ctx.local().as_ref());
                Ok(model)
            })
            .continue_with(SyncLock::None, SyncDirection::None, move |model: ModelId| {
                bind_model(&bind_ctx, &model).map(|_| ())
            });
        self.finish(handle, SyncDirection::RemoteToLocal, message).await
    }

    #[instrument(skip(self))]
    pub async fn bind_module_from_local(&self, module: &ModuleId) -> Result<(), SyncError> {
        let handle = push_module(&self.ctx, module);
        self.finish(handle, SyncDirection::LocalToRemote, format!("Binding module {module}"))
            .await
    }

    #[instrument(skip(self))]
    pub async fn bind_model_from_local(&self, model: &ModelId) -> Result<(), SyncError> {
        let handle = push_model(&self.ctx, model);
        self.finish(handle, SyncDirection::LocalToRemote, format!("Binding model {model}"))
            .await
    }

    pub async fn unbind_module(
        &self,
        module: &ModuleId,
        remove_from_remote: bool,
    ) -> Result<(), SyncError> {
        let Some(binding) = self.ctx.bindings().module_binding(module) else {
            return Ok(());
        };
        self.finish(
            binding.deactivate(remove_from_remote),
            SyncDirection::None,
            format!("Unbinding module {module}"),
        )
        .await
    }

    pub async fn unbind_model(
        &self,
        model: &ModelId,
        remove_from_remote: bool,
    ) -> Result<(), SyncError> {
        let Some(binding) = self.ctx.bindings().model_binding(model) else {
            return Ok(());
        };
        self.finish(
            binding.deactivate(remove_from_remote),
            SyncDirection::None,
            format!("Unbinding model {model}"),
        )
        .await
    }

    /// Deactivate every module binding. All of them are attempted; the first failure is
    /// returned.
    pub async fn unbind_all(&self, remove_from_remote: bool) -> Result<(), SyncError> {
        let handles: Vec<_> = self
            .ctx
            .bindings()
            .module_bindings()
            .iter()
            .map(|binding| binding.deactivate(remove_from_remote))
            .collect();
        let results = join_all(handles.iter().map(|handle| handle.join())).await;
        match results.into_iter().find_map(Result::err) {
            Some(err) => self.fail(SyncDirection::None, "Unbinding all modules".to_string(), err),
            None => Ok(()),
        }
    }

    /// Wait until every local edit so far has been mirrored and the scheduler is idle.
    pub async fn settle(&self) {
        self.ctx.edits().settle(self.ctx.scheduler()).await;
    }

    /// State to persist for resuming this session later.
    pub fn snapshot_state(&self) -> Result<PersistedState, SyncError> {
        let connection = self.ctx.connection();
        let client = connection.client().ok_or(SyncError::NotConnected)?;
        let branch_ref = connection.branch_ref().ok_or(SyncError::NotConnected)?;
        let head = connection.branch()?.head()?;
        Ok(PersistedState {
            client_url: client.server_url().to_string(),
            repository_id: branch_ref.repository.to_string(),
            branch_name: branch_ref.branch.clone(),
            local_version_hash: head.to_string(),
            module_ids: self
                .ctx
                .bindings()
                .module_ids()
                .iter()
                .map(|id| id.to_string())
                .collect(),
            serialized_identity_map: self.ctx.identity().serialize()?,
        })
    }

    pub fn save_state(&self, store: &StateStore) -> Result<(), SyncError> {
        let state = self.snapshot_state()?;
        store.save(&state)
    }

    /// Resume a saved session against `client`.
    ///
    /// Returns `Ok(false)` when `state` is not restorable. On failure the session is left
    /// disconnected with an empty identity map and no bindings.
    #[instrument(skip_all, fields(server = %state.client_url, branch = %state.branch_name))]
    pub async fn restore(
        &self,
        client: Arc<dyn RemoteClient>,
        state: &PersistedState,
    ) -> Result<bool, SyncError> {
        if !state.is_restorable() {
            info!("Saved state is not restorable, skipping");
            return Ok(false);
        }
        match self.try_restore(client, state).await {
            Ok(()) => {
                info!(modules = state.module_ids.len(), "Restored session");
                Ok(true)
            }
            Err(err) => {
                warn!(error = %err, "Restore failed, resetting session");
                self.ctx.connection().disconnect();
                self.ctx.identity().clear();
                self.ctx.bindings().clear();
                self.fail(SyncDirection::RemoteToLocal, "Restoring the session".to_string(), err)
            }
        }
    }

    async fn try_restore(
        &self,
        client: Arc<dyn RemoteClient>,
        state: &PersistedState,
    ) -> Result<(), SyncError> {
        let version = VersionHash::new(state.local_version_hash.clone());
        let repository = RepositoryId::new(state.repository_id.clone());
        client
            .pull_version(&repository, &version)
            .map_err(|err| SyncError::connection(format!("Cannot pull version {version}"), err))?;

        let branch = BranchRef::new(state.repository_id.clone(), state.branch_name.clone());
        self.ctx.connection().connect(
            client,
            &branch,
            self.ctx.remote_listener(),
            self.ctx.local(),
            self.ctx.edit_listener(),
        )?;

        self.ctx.identity().clear();
        self.ctx
            .identity()
            .deserialize(&state.serialized_identity_map)
            .map_err(|err| SyncError::RestoreFailed(err.to_string()))?;
        if self.ctx.identity().is_empty() && !state.serialized_identity_map.trim().is_empty() {
            return Err(SyncError::RestoreFailed(
                "the saved identity map is empty".to_string(),
            ));
        }

        let ctx = Arc::clone(&self.ctx);
        let modules: Vec<ModuleId> = state.module_ids.iter().map(ModuleId::new).collect();
        let rebound = self
            .ctx
            .scheduler()
            .enqueue(SyncLock::None, SyncDirection::None, move || {
                for module in &modules {
                    if ctx.identity().get_remote_module(module).is_none() {
                        return Err(SyncError::RestoreFailed(format!(
                            "module {module} is not in the saved identity map"
                        )));
                    }
                    bind_module(&ctx, module)?;
                    for model in ctx.identity().models_of_module(module) {
                        bind_model(&ctx, &model)?;
                    }
                }
                Ok(())
            });
        rebound.join().await?;

        self.ctx
            .connection()
            .replay_since(&version, self.ctx.remote_listener().as_ref())
    }

    /// Mirror pending edits, disconnect and stop the scheduler.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.settle().await;
        self.ctx.connection().disconnect();
        self.ctx.scheduler().stop().await
    }

    fn locate<F>(&self, find: F) -> Result<Option<RemoteNodeId>, SyncError>
    where
        F: FnOnce(&dyn RemoteRead) -> Result<Option<RemoteNodeId>, SyncError>,
    {
        let branch = self.ctx.branch()?;
        let read = branch.read()?;
        find(read.as_ref())
    }
}
