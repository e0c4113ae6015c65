//! Remote store interface.

use crate::error::StoreError;
use crate::types::{BranchRef, ConceptId, ListenerId, RemoteNodeId, RepositoryId, VersionHash};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Target of a remote reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RemoteRef {
    /// Another node in the remote tree.
    Node(RemoteNodeId),
    /// A node that only exists locally, by serialized local id.
    Foreign(String),
}

/// Read access to one consistent revision of the remote tree.
pub trait RemoteRead {
    fn root(&self) -> RemoteNodeId;
    fn contains(&self, id: RemoteNodeId) -> bool;
    fn concept(&self, id: RemoteNodeId) -> Result<ConceptId, StoreError>;
    fn parent(&self, id: RemoteNodeId) -> Result<Option<RemoteNodeId>, StoreError>;
    fn role_in_parent(&self, id: RemoteNodeId) -> Result<Option<String>, StoreError>;
    fn children(&self, id: RemoteNodeId, role: &str) -> Result<Vec<RemoteNodeId>, StoreError>;
    fn all_children(&self, id: RemoteNodeId) -> Result<Vec<(String, RemoteNodeId)>, StoreError>;
    fn property(&self, id: RemoteNodeId, role: &str) -> Result<Option<String>, StoreError>;
    fn properties(&self, id: RemoteNodeId) -> Result<Vec<(String, String)>, StoreError>;
    fn reference(&self, id: RemoteNodeId, role: &str) -> Result<Option<RemoteRef>, StoreError>;
    fn references(&self, id: RemoteNodeId) -> Result<Vec<(String, RemoteRef)>, StoreError>;

    /// The node and all descendants, parents first.
    fn subtree(&self, id: RemoteNodeId) -> Result<Vec<RemoteNodeId>, StoreError> {
        let mut result = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for (_, child) in self.all_children(current)?.into_iter().rev() {
                stack.push(child);
            }
            result.push(current);
        }
        Ok(result)
    }
}

/// A write transaction. Changes become visible, and diffs are delivered, on commit.
/// Dropping without committing discards the changes.
pub trait RemoteWrite: RemoteRead {
    fn add_new_child(
        &mut self,
        parent: RemoteNodeId,
        role: &str,
        index: Option<usize>,
        concept: &ConceptId,
    ) -> Result<RemoteNodeId, StoreError>;
    fn move_child(
        &mut self,
        new_parent: RemoteNodeId,
        role: &str,
        index: Option<usize>,
        child: RemoteNodeId,
    ) -> Result<(), StoreError>;
    /// Deletes the node with its whole subtree.
    fn delete_node(&mut self, id: RemoteNodeId) -> Result<(), StoreError>;
    fn set_property(
        &mut self,
        id: RemoteNodeId,
        role: &str,
        value: Option<&str>,
    ) -> Result<(), StoreError>;
    fn set_reference(
        &mut self,
        id: RemoteNodeId,
        role: &str,
        target: Option<RemoteRef>,
    ) -> Result<(), StoreError>;
    fn commit(self: Box<Self>) -> Result<VersionHash, StoreError>;
}

/// Callbacks describing the difference between two remote revisions.
pub trait TreeDiffVisitor: Send + Sync {
    fn property_changed(&self, node: RemoteNodeId, role: &str);
    fn reference_changed(&self, node: RemoteNodeId, role: &str);
    fn node_added(&self, node: RemoteNodeId);
    fn node_removed(&self, node: RemoteNodeId);
    fn containment_changed(&self, node: RemoteNodeId);
    fn children_changed(&self, node: RemoteNodeId, role: &str);
}

/// Live handle on one branch of a replicated repository.
pub trait RemoteBranch: Send + Sync {
    fn branch_ref(&self) -> &BranchRef;
    fn read(&self) -> Result<Box<dyn RemoteRead + '_>, StoreError>;
    fn write(&self) -> Result<Box<dyn RemoteWrite + '_>, StoreError>;
    fn head(&self) -> Result<VersionHash, StoreError>;
    fn add_diff_listener(&self, listener: Arc<dyn TreeDiffVisitor>) -> ListenerId;
    fn remove_diff_listener(&self, id: ListenerId) -> Result<(), StoreError>;
    /// Deliver the diff from `version` to the current head to `visitor`.
    fn replay_since(&self, version: &VersionHash, visitor: &dyn TreeDiffVisitor)
        -> Result<(), StoreError>;
    fn dispose(&self);
}

/// Connection to a model server.
pub trait RemoteClient: Send + Sync {
    fn server_url(&self) -> &str;
    fn list_repositories(&self) -> Result<Vec<RepositoryId>, StoreError>;
    fn list_branches(&self, repository: &RepositoryId) -> Result<Vec<String>, StoreError>;
    fn connect(&self, branch: &BranchRef) -> Result<Arc<dyn RemoteBranch>, StoreError>;
    /// Make `version` of `repository` available locally.
    fn pull_version(&self, repository: &RepositoryId, version: &VersionHash)
        -> Result<(), StoreError>;
    /// Move the head of `branch` to an already known `version`.
    fn push_version(&self, branch: &BranchRef, version: &VersionHash) -> Result<(), StoreError>;
}
