//! Connection registry
//!
//! Holds at most one live branch connection per session, together with the two listeners
//! installed for it: the diff listener on the branch and the repository listener on the
//! local store.

use crate::error::SyncError;
use crate::store::{
    ListenerScope, LocalChangeListener, LocalRepository, RemoteBranch, RemoteClient,
    TreeDiffVisitor,
};
use crate::types::{BranchRef, ListenerId, VersionHash};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

struct Connection {
    client: Arc<dyn RemoteClient>,
    branch_ref: BranchRef,
    branch: Arc<dyn RemoteBranch>,
    diff_listener: ListenerId,
    local: Arc<dyn LocalRepository>,
    local_listener: ListenerId,
}

impl Connection {
    fn targets(&self, server_url: &str, branch: &BranchRef) -> bool {
        self.client.server_url() == server_url && &self.branch_ref == branch
    }

    fn dispose(self) {
        if let Err(err) = self.branch.remove_diff_listener(self.diff_listener) {
            warn!(branch = %self.branch_ref, error = %err, "Diff listener was already gone");
        }
        if let Err(err) = self.local.remove_listener(self.local_listener) {
            warn!(branch = %self.branch_ref, error = %err, "Repository listener was already gone");
        }
        self.branch.dispose();
        info!(server = self.client.server_url(), branch = %self.branch_ref, "Disconnected");
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    current: Mutex<Option<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to `branch_ref` on `client`'s server.
    ///
    /// Connecting again to the same server and branch returns the live handle. Any other
    /// connection is fully disposed before the new one is established.
    #[instrument(skip_all, fields(server = client.server_url(), branch = %branch_ref))]
    pub fn connect(
        &self,
        client: Arc<dyn RemoteClient>,
        branch_ref: &BranchRef,
        diff: Arc<dyn TreeDiffVisitor>,
        local: &Arc<dyn LocalRepository>,
        repository_listener: Arc<dyn LocalChangeListener>,
    ) -> Result<Arc<dyn RemoteBranch>, SyncError> {
        let mut current = self.current.lock();
        if let Some(existing) = current.as_ref() {
            if existing.targets(client.server_url(), branch_ref) {
                debug!("Already connected");
                return Ok(Arc::clone(&existing.branch));
            }
        }
        if let Some(previous) = current.take() {
            previous.dispose();
        }

        let branch = client.connect(branch_ref).map_err(|err| {
            SyncError::connection(
                format!("Cannot connect to {branch_ref} on {}", client.server_url()),
                err,
            )
        })?;
        let diff_listener = branch.add_diff_listener(diff);
        let local_listener = local.add_listener(ListenerScope::Repository, repository_listener);
        info!("Connected");
        *current = Some(Connection {
            client,
            branch_ref: branch_ref.clone(),
            branch: Arc::clone(&branch),
            diff_listener,
            local: Arc::clone(local),
            local_listener,
        });
        Ok(branch)
    }

    /// Deliver every remote change since `version` to `visitor`.
    pub fn replay_since(
        &self,
        version: &VersionHash,
        visitor: &dyn TreeDiffVisitor,
    ) -> Result<(), SyncError> {
        let branch = self.branch()?;
        branch.replay_since(version, visitor).map_err(|err| {
            SyncError::connection(format!("Cannot replay changes since {version}"), err)
        })
    }

    /// Dispose the current connection, if any.
    pub fn disconnect(&self) {
        if let Some(previous) = self.current.lock().take() {
            previous.dispose();
        }
    }

    /// Dispose the connection when it targets `branch`.
    pub fn unset_branch(&self, branch: &BranchRef) {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|c| &c.branch_ref == branch) {
            if let Some(previous) = current.take() {
                previous.dispose();
            }
        }
    }

    pub fn branch(&self) -> Result<Arc<dyn RemoteBranch>, SyncError> {
        self.current
            .lock()
            .as_ref()
            .map(|c| Arc::clone(&c.branch))
            .ok_or(SyncError::NotConnected)
    }

    pub fn client(&self) -> Option<Arc<dyn RemoteClient>> {
        self.current.lock().as_ref().map(|c| Arc::clone(&c.client))
    }

    pub fn branch_ref(&self) -> Option<BranchRef> {
        self.current.lock().as_ref().map(|c| c.branch_ref.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.current.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LocalEdit, MemoryLocalRepository, MemoryModelServer};
    use crate::types::RemoteNodeId;

    struct Silent;

    impl TreeDiffVisitor for Silent {
        fn property_changed(&self, _: RemoteNodeId, _: &str) {}
        fn reference_changed(&self, _: RemoteNodeId, _: &str) {}
        fn node_added(&self, _: RemoteNodeId) {}
        fn node_removed(&self, _: RemoteNodeId) {}
        fn containment_changed(&self, _: RemoteNodeId) {}
        fn children_changed(&self, _: RemoteNodeId, _: &str) {}
    }

    impl LocalChangeListener for Silent {
        fn on_edit(&self, _: &LocalEdit) {}
    }

    #[test]
    fn switching_branches_disposes_the_previous_connection() {
        let server = MemoryModelServer::new("memory://test");
        let main = BranchRef::new("repo", "main");
        let feature = BranchRef::new("repo", "feature");
        let main_branch = server.create_branch(&main).unwrap();
        let feature_branch = server.create_branch(&feature).unwrap();
        let local: Arc<dyn LocalRepository> = MemoryLocalRepository::new();
        let client: Arc<dyn RemoteClient> = server;
        let registry = ConnectionRegistry::new();

        let first = registry
            .connect(Arc::clone(&client), &main, Arc::new(Silent), &local, Arc::new(Silent))
            .unwrap();
        let again = registry
            .connect(Arc::clone(&client), &main, Arc::new(Silent), &local, Arc::new(Silent))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(main_branch.listener_count(), 1);

        registry
            .connect(client, &feature, Arc::new(Silent), &local, Arc::new(Silent))
            .unwrap();
        assert_eq!(main_branch.listener_count(), 0);
        assert_eq!(feature_branch.listener_count(), 1);
        assert_eq!(registry.branch_ref(), Some(feature.clone()));

        registry.unset_branch(&main);
        assert!(registry.is_connected());
        registry.unset_branch(&feature);
        assert!(!registry.is_connected());
        assert!(matches!(registry.branch(), Err(SyncError::NotConnected)));
    }
}
