//! Per-session context
//!
//! Everything one synchronization session shares: the scheduler, the identity map, the
//! bindings and connection registries, both store handles and the propagators. Components
//! receive the context explicitly; there is no process-wide state.

use crate::binding::BindingsRegistry;
use crate::concept::LanguageRepository;
use crate::connection::ConnectionRegistry;
use crate::error::SyncError;
use crate::identity::IdentityMap;
use crate::notify::{Notification, Notifier};
use crate::propagate::{EditSink, RemoteChangeVisitor};
use crate::scheduler::{Scheduler, SyncDirection, TaskHandle};
use crate::store::{LocalChangeListener, LocalRepository, RemoteBranch, TreeDiffVisitor};
use crate::transform::{InFlightTransforms, ReferenceResolver};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Session settings derived from the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Properties never copied in either direction.
    pub ignored_properties: BTreeSet<String>,
    pub edit_channel_capacity: usize,
    pub poll_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            ignored_properties: ["virtualPackage", "stereotype"]
                .into_iter()
                .map(String::from)
                .collect(),
            edit_channel_capacity: 1024,
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl SyncSettings {
    pub fn is_ignored(&self, property: &str) -> bool {
        self.ignored_properties.contains(property)
    }
}

pub struct SyncContext {
    scheduler: Scheduler,
    identity: IdentityMap,
    bindings: BindingsRegistry,
    connection: ConnectionRegistry,
    local: Arc<dyn LocalRepository>,
    languages: Arc<LanguageRepository>,
    notifier: Arc<dyn Notifier>,
    references: ReferenceResolver,
    in_flight: InFlightTransforms,
    settings: SyncSettings,
    edits: Arc<EditSink>,
    remote_visitor: Arc<RemoteChangeVisitor>,
}

impl SyncContext {
    /// Build the context and start the edit pump. The scheduler is not started here.
    pub fn new(
        scheduler: Scheduler,
        local: Arc<dyn LocalRepository>,
        languages: Arc<LanguageRepository>,
        notifier: Arc<dyn Notifier>,
        settings: SyncSettings,
    ) -> Result<Arc<Self>, SyncError> {
        let ctx = Arc::new_cyclic(|weak| Self {
            scheduler,
            identity: IdentityMap::new(),
            bindings: BindingsRegistry::new(),
            connection: ConnectionRegistry::new(),
            local,
            languages,
            notifier,
            references: ReferenceResolver::new(),
            in_flight: InFlightTransforms::default(),
            edits: Arc::new(EditSink::new(settings.edit_channel_capacity)),
            remote_visitor: Arc::new(RemoteChangeVisitor::new(weak.clone())),
            settings,
        });
        ctx.edits
            .start_pump(Arc::downgrade(&ctx), ctx.settings.poll_interval)?;
        Ok(ctx)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn identity(&self) -> &IdentityMap {
        &self.identity
    }

    pub fn bindings(&self) -> &BindingsRegistry {
        &self.bindings
    }

    pub fn connection(&self) -> &ConnectionRegistry {
        &self.connection
    }

    pub fn local(&self) -> &Arc<dyn LocalRepository> {
        &self.local
    }

    pub fn languages(&self) -> &LanguageRepository {
        &self.languages
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn references(&self) -> &ReferenceResolver {
        &self.references
    }

    pub(crate) fn in_flight(&self) -> &InFlightTransforms {
        &self.in_flight
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub(crate) fn edits(&self) -> &EditSink {
        &self.edits
    }

    /// Listener feeding local edits to the local→remote propagator.
    pub fn edit_listener(&self) -> Arc<dyn LocalChangeListener> {
        Arc::clone(&self.edits) as Arc<dyn LocalChangeListener>
    }

    /// Visitor applying remote diffs through the remote→local propagator.
    pub fn remote_listener(&self) -> Arc<dyn TreeDiffVisitor> {
        Arc::clone(&self.remote_visitor) as Arc<dyn TreeDiffVisitor>
    }

    /// Handle of the connected branch.
    pub fn branch(&self) -> Result<Arc<dyn RemoteBranch>, SyncError> {
        self.connection.branch()
    }

    /// Turn a failure of `handle` into one user notification. Echo suppression is not a failure.
    pub fn report<T>(
        &self,
        handle: &TaskHandle<T>,
        direction: SyncDirection,
        message: impl Into<String>,
    ) where
        T: Clone + Send + Sync + 'static,
    {
        let notifier = Arc::clone(&self.notifier);
        let message = message.into();
        handle.on_complete(move |result| {
            if let Err(err) = result {
                if !err.is_echo() {
                    notifier.notify(Notification::failure(direction, message, err));
                }
            }
        });
    }
}
