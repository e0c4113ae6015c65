//! In-memory model server.
//!
//! Every branch keeps its head as an immutable [`TreeSnapshot`]; a write transaction edits a
//! private copy and installs it on commit, at which point the diff between the two revisions
//! is delivered to the branch's listeners on the committing thread. Versions are addressed by
//! the blake3 hash of their bincode encoding.

use super::diff::diff_trees;
use super::remote::{
    RemoteBranch, RemoteClient, RemoteRead, RemoteRef, RemoteWrite, TreeDiffVisitor,
};
use crate::concept::concepts;
use crate::error::StoreError;
use crate::types::{BranchRef, ConceptId, ListenerId, RemoteNodeId, RepositoryId, VersionHash};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

const ROOT_ID: u64 = 1;
/// Each branch allocates node ids from its own range.
const ID_RANGE: u64 = 1 << 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNodeData {
    pub concept: ConceptId,
    pub parent: Option<RemoteNodeId>,
    pub role: Option<String>,
    pub properties: BTreeMap<String, String>,
    pub references: BTreeMap<String, RemoteRef>,
    pub children: Vec<(String, RemoteNodeId)>,
}

/// One immutable revision of a remote tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    root: RemoteNodeId,
    next_id: u64,
    nodes: BTreeMap<RemoteNodeId, RemoteNodeData>,
}

impl TreeSnapshot {
    pub fn new(root: u64, first_id: u64) -> Self {
        let root = RemoteNodeId::new(root);
        let mut nodes = BTreeMap::new();
        nodes.insert(
            root,
            RemoteNodeData {
                concept: ConceptId::new(concepts::REPOSITORY),
                parent: None,
                role: None,
                properties: BTreeMap::new(),
                references: BTreeMap::new(),
                children: Vec::new(),
            },
        );
        Self {
            root,
            next_id: first_id,
            nodes,
        }
    }

    pub fn root_id(&self) -> RemoteNodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn version(&self) -> Result<VersionHash, StoreError> {
        let bytes = bincode::serialize(self).map_err(|e| {
            StoreError::InvalidOperation(format!("Failed to encode tree snapshot: {e}"))
        })?;
        Ok(VersionHash::from_bytes(&bytes))
    }

    fn get(&self, id: RemoteNodeId) -> Result<&RemoteNodeData, StoreError> {
        self.nodes
            .get(&id)
            .ok_or_else(|| StoreError::NodeNotFound(id.to_string()))
    }

    fn get_mut(&mut self, id: RemoteNodeId) -> Result<&mut RemoteNodeData, StoreError> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| StoreError::NodeNotFound(id.to_string()))
    }

    fn attach(
        &mut self,
        parent: RemoteNodeId,
        role: &str,
        index: Option<usize>,
        child: RemoteNodeId,
    ) -> Result<(), StoreError> {
        let parent_data = self.get_mut(parent)?;
        let same_role: Vec<usize> = parent_data
            .children
            .iter()
            .enumerate()
            .filter(|(_, (r, _))| r == role)
            .map(|(i, _)| i)
            .collect();
        let position = match index {
            Some(i) if i < same_role.len() => same_role[i],
            _ => same_role
                .last()
                .map(|last| last + 1)
                .unwrap_or(parent_data.children.len()),
        };
        parent_data.children.insert(position, (role.to_string(), child));
        let child_data = self.get_mut(child)?;
        child_data.parent = Some(parent);
        child_data.role = Some(role.to_string());
        Ok(())
    }

    fn detach(&mut self, child: RemoteNodeId) -> Result<(), StoreError> {
        let parent = self.get(child)?.parent;
        if let Some(parent) = parent {
            self.get_mut(parent)?.children.retain(|(_, c)| *c != child);
        }
        let child_data = self.get_mut(child)?;
        child_data.parent = None;
        child_data.role = None;
        Ok(())
    }

    pub fn insert_child(
        &mut self,
        parent: RemoteNodeId,
        role: &str,
        index: Option<usize>,
        concept: &ConceptId,
    ) -> Result<RemoteNodeId, StoreError> {
        self.get(parent)?;
        let id = RemoteNodeId::new(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            RemoteNodeData {
                concept: concept.clone(),
                parent: None,
                role: None,
                properties: BTreeMap::new(),
                references: BTreeMap::new(),
                children: Vec::new(),
            },
        );
        self.attach(parent, role, index, id)?;
        Ok(id)
    }

    pub fn move_node(
        &mut self,
        new_parent: RemoteNodeId,
        role: &str,
        index: Option<usize>,
        child: RemoteNodeId,
    ) -> Result<(), StoreError> {
        if child == self.root {
            return Err(StoreError::InvalidOperation("cannot move the root".to_string()));
        }
        self.get(new_parent)?;
        if self.subtree(child)?.contains(&new_parent) {
            return Err(StoreError::InvalidOperation(format!(
                "cannot move {child} into its own subtree"
            )));
        }
        self.detach(child)?;
        self.attach(new_parent, role, index, child)
    }

    pub fn remove_subtree(&mut self, id: RemoteNodeId) -> Result<(), StoreError> {
        if id == self.root {
            return Err(StoreError::InvalidOperation("cannot delete the root".to_string()));
        }
        let doomed = self.subtree(id)?;
        self.detach(id)?;
        for node in doomed {
            self.nodes.remove(&node);
        }
        Ok(())
    }

    pub fn set_property(&mut self, id: RemoteNodeId, role: &str, value: Option<&str>)
        -> Result<(), StoreError> {
        let data = self.get_mut(id)?;
        match value {
            Some(value) => data.properties.insert(role.to_string(), value.to_string()),
            None => data.properties.remove(role),
        };
        Ok(())
    }

    pub fn set_reference(&mut self, id: RemoteNodeId, role: &str, target: Option<RemoteRef>)
        -> Result<(), StoreError> {
        let data = self.get_mut(id)?;
        match target {
            Some(target) => data.references.insert(role.to_string(), target),
            None => data.references.remove(role),
        };
        Ok(())
    }
}

impl RemoteRead for TreeSnapshot {
    fn root(&self) -> RemoteNodeId {
        self.root
    }

    fn contains(&self, id: RemoteNodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    fn concept(&self, id: RemoteNodeId) -> Result<ConceptId, StoreError> {
        Ok(self.get(id)?.concept.clone())
    }

    fn parent(&self, id: RemoteNodeId) -> Result<Option<RemoteNodeId>, StoreError> {
        Ok(self.get(id)?.parent)
    }

    fn role_in_parent(&self, id: RemoteNodeId) -> Result<Option<String>, StoreError> {
        Ok(self.get(id)?.role.clone())
    }

    fn children(&self, id: RemoteNodeId, role: &str) -> Result<Vec<RemoteNodeId>, StoreError> {
        Ok(self
            .get(id)?
            .children
            .iter()
            .filter(|(r, _)| r == role)
            .map(|(_, c)| *c)
            .collect())
    }

    fn all_children(&self, id: RemoteNodeId) -> Result<Vec<(String, RemoteNodeId)>, StoreError> {
        Ok(self.get(id)?.children.clone())
    }

    fn property(&self, id: RemoteNodeId, role: &str) -> Result<Option<String>, StoreError> {
        Ok(self.get(id)?.properties.get(role).cloned())
    }

    fn properties(&self, id: RemoteNodeId) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .get(id)?
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn reference(&self, id: RemoteNodeId, role: &str) -> Result<Option<RemoteRef>, StoreError> {
        Ok(self.get(id)?.references.get(role).cloned())
    }

    fn references(&self, id: RemoteNodeId) -> Result<Vec<(String, RemoteRef)>, StoreError> {
        Ok(self
            .get(id)?
            .references
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

type VersionStore = RwLock<HashMap<VersionHash, Arc<TreeSnapshot>>>;

struct Head {
    tree: Arc<TreeSnapshot>,
    version: VersionHash,
}

/// One branch of an in-memory repository.
pub struct MemoryBranch {
    branch_ref: BranchRef,
    head: RwLock<Head>,
    writer: Mutex<()>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn TreeDiffVisitor>)>>,
    versions: Arc<VersionStore>,
    failing: Mutex<HashSet<RemoteNodeId>>,
    offline: Arc<AtomicBool>,
}

impl MemoryBranch {
    fn new(
        branch_ref: BranchRef,
        id_base: u64,
        versions: Arc<VersionStore>,
        offline: Arc<AtomicBool>,
    ) -> Result<Self, StoreError> {
        let tree = Arc::new(TreeSnapshot::new(ROOT_ID, id_base));
        let version = tree.version()?;
        versions.write().insert(version.clone(), Arc::clone(&tree));
        Ok(Self {
            branch_ref,
            head: RwLock::new(Head { tree, version }),
            writer: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
            versions,
            failing: Mutex::new(HashSet::new()),
            offline,
        })
    }

    /// Current head revision.
    pub fn snapshot(&self) -> Arc<TreeSnapshot> {
        Arc::clone(&self.head.read().tree)
    }

    /// Make every write touching `node` fail. Fault injection for tests.
    pub fn fail_writes_to(&self, node: RemoteNodeId) {
        self.failing.lock().insert(node);
    }

    pub fn clear_write_failures(&self) {
        self.failing.lock().clear();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable(format!("{} is offline", self.branch_ref)))
        } else {
            Ok(())
        }
    }

    /// Replace the head and deliver the diff to every listener.
    fn install(&self, previous: &TreeSnapshot, tree: Arc<TreeSnapshot>, version: VersionHash) {
        self.versions
            .write()
            .insert(version.clone(), Arc::clone(&tree));
        {
            let mut head = self.head.write();
            head.tree = Arc::clone(&tree);
            head.version = version.clone();
        }
        debug!(branch = %self.branch_ref, version = %version, "Installed new head");

        let listeners: Vec<Arc<dyn TreeDiffVisitor>> =
            self.listeners.read().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            if let Err(err) = diff_trees(previous, tree.as_ref(), listener.as_ref()) {
                debug!(branch = %self.branch_ref, error = %err, "Diff delivery failed");
            }
        }
    }
}

struct SnapshotRead(Arc<TreeSnapshot>);

impl RemoteRead for SnapshotRead {
    fn root(&self) -> RemoteNodeId {
        self.0.root()
    }
    fn contains(&self, id: RemoteNodeId) -> bool {
        self.0.contains(id)
    }
    fn concept(&self, id: RemoteNodeId) -> Result<ConceptId, StoreError> {
        self.0.concept(id)
    }
    fn parent(&self, id: RemoteNodeId) -> Result<Option<RemoteNodeId>, StoreError> {
        self.0.parent(id)
    }
    fn role_in_parent(&self, id: RemoteNodeId) -> Result<Option<String>, StoreError> {
        self.0.role_in_parent(id)
    }
    fn children(&self, id: RemoteNodeId, role: &str) -> Result<Vec<RemoteNodeId>, StoreError> {
        self.0.children(id, role)
    }
    fn all_children(&self, id: RemoteNodeId) -> Result<Vec<(String, RemoteNodeId)>, StoreError> {
        self.0.all_children(id)
    }
    fn property(&self, id: RemoteNodeId, role: &str) -> Result<Option<String>, StoreError> {
        self.0.property(id, role)
    }
    fn properties(&self, id: RemoteNodeId) -> Result<Vec<(String, String)>, StoreError> {
        self.0.properties(id)
    }
    fn reference(&self, id: RemoteNodeId, role: &str) -> Result<Option<RemoteRef>, StoreError> {
        self.0.reference(id, role)
    }
    fn references(&self, id: RemoteNodeId) -> Result<Vec<(String, RemoteRef)>, StoreError> {
        self.0.references(id)
    }
}

struct MemoryWrite<'a> {
    branch: &'a MemoryBranch,
    _writer: MutexGuard<'a, ()>,
    base: Arc<TreeSnapshot>,
    working: TreeSnapshot,
}

impl MemoryWrite<'_> {
    fn check_writable(&self, id: RemoteNodeId) -> Result<(), StoreError> {
        self.branch.check_online()?;
        if self.branch.failing.lock().contains(&id) {
            return Err(StoreError::Unavailable(format!("writes to {id} are failing")));
        }
        Ok(())
    }
}

impl RemoteRead for MemoryWrite<'_> {
    fn root(&self) -> RemoteNodeId {
        self.working.root()
    }
    fn contains(&self, id: RemoteNodeId) -> bool {
        self.working.contains(id)
    }
    fn concept(&self, id: RemoteNodeId) -> Result<ConceptId, StoreError> {
        self.working.concept(id)
    }
    fn parent(&self, id: RemoteNodeId) -> Result<Option<RemoteNodeId>, StoreError> {
        self.working.parent(id)
    }
    fn role_in_parent(&self, id: RemoteNodeId) -> Result<Option<String>, StoreError> {
        self.working.role_in_parent(id)
    }
    fn children(&self, id: RemoteNodeId, role: &str) -> Result<Vec<RemoteNodeId>, StoreError> {
        self.working.children(id, role)
    }
    fn all_children(&self, id: RemoteNodeId) -> Result<Vec<(String, RemoteNodeId)>, StoreError> {
        self.working.all_children(id)
    }
    fn property(&self, id: RemoteNodeId, role: &str) -> Result<Option<String>, StoreError> {
        self.working.property(id, role)
    }
    fn properties(&self, id: RemoteNodeId) -> Result<Vec<(String, String)>, StoreError> {
        self.working.properties(id)
    }
    fn reference(&self, id: RemoteNodeId, role: &str) -> Result<Option<RemoteRef>, StoreError> {
        self.working.reference(id, role)
    }
    fn references(&self, id: RemoteNodeId) -> Result<Vec<(String, RemoteRef)>, StoreError> {
        self.working.references(id)
    }
}

impl RemoteWrite for MemoryWrite<'_> {
    fn add_new_child(
        &mut self,
        parent: RemoteNodeId,
        role: &str,
        index: Option<usize>,
        concept: &ConceptId,
    ) -> Result<RemoteNodeId, StoreError> {
        self.check_writable(parent)?;
        self.working.insert_child(parent, role, index, concept)
    }

    fn move_child(
        &mut self,
        new_parent: RemoteNodeId,
        role: &str,
        index: Option<usize>,
        child: RemoteNodeId,
    ) -> Result<(), StoreError> {
        self.check_writable(child)?;
        self.working.move_node(new_parent, role, index, child)
    }

    fn delete_node(&mut self, id: RemoteNodeId) -> Result<(), StoreError> {
        self.check_writable(id)?;
        self.working.remove_subtree(id)
    }

    fn set_property(&mut self, id: RemoteNodeId, role: &str, value: Option<&str>)
        -> Result<(), StoreError> {
        self.check_writable(id)?;
        self.working.set_property(id, role, value)
    }

    fn set_reference(&mut self, id: RemoteNodeId, role: &str, target: Option<RemoteRef>)
        -> Result<(), StoreError> {
        self.check_writable(id)?;
        self.working.set_reference(id, role, target)
    }

    fn commit(self: Box<Self>) -> Result<VersionHash, StoreError> {
        let MemoryWrite {
            branch,
            _writer: writer,
            base,
            working,
        } = *self;
        if working == *base {
            return Ok(branch.head.read().version.clone());
        }
        let version = working.version()?;
        let tree = Arc::new(working);
        // release the writer before listeners run so they can open their own transactions
        drop(writer);
        branch.install(&base, tree, version.clone());
        Ok(version)
    }
}

impl RemoteBranch for MemoryBranch {
    fn branch_ref(&self) -> &BranchRef {
        &self.branch_ref
    }

    fn read(&self) -> Result<Box<dyn RemoteRead + '_>, StoreError> {
        self.check_online()?;
        Ok(Box::new(SnapshotRead(self.snapshot())))
    }

    fn write(&self) -> Result<Box<dyn RemoteWrite + '_>, StoreError> {
        self.check_online()?;
        let writer = self.writer.lock();
        let base = self.snapshot();
        let working = (*base).clone();
        Ok(Box::new(MemoryWrite {
            branch: self,
            _writer: writer,
            base,
            working,
        }))
    }

    fn head(&self) -> Result<VersionHash, StoreError> {
        Ok(self.head.read().version.clone())
    }

    fn add_diff_listener(&self, listener: Arc<dyn TreeDiffVisitor>) -> ListenerId {
        let id = ListenerId::next();
        self.listeners.write().push((id, listener));
        id
    }

    fn remove_diff_listener(&self, id: ListenerId) -> Result<(), StoreError> {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        if listeners.len() == before {
            return Err(StoreError::UnknownListener(id.as_u64()));
        }
        Ok(())
    }

    fn replay_since(&self, version: &VersionHash, visitor: &dyn TreeDiffVisitor)
        -> Result<(), StoreError> {
        let old = self
            .versions
            .read()
            .get(version)
            .cloned()
            .ok_or_else(|| StoreError::VersionNotFound(version.to_string()))?;
        let head = self.snapshot();
        diff_trees(old.as_ref(), head.as_ref(), visitor)
    }

    fn dispose(&self) {
        debug!(branch = %self.branch_ref, "Disposed branch handle");
    }
}

/// In-memory model server holding repositories of branches.
pub struct MemoryModelServer {
    url: String,
    branches: RwLock<BTreeMap<RepositoryId, BTreeMap<String, Arc<MemoryBranch>>>>,
    versions: Arc<VersionStore>,
    offline: Arc<AtomicBool>,
}

impl MemoryModelServer {
    pub fn new(url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            branches: RwLock::new(BTreeMap::new()),
            versions: Arc::new(RwLock::new(HashMap::new())),
            offline: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Get or create `branch`, creating its repository if needed.
    pub fn create_branch(&self, branch: &BranchRef) -> Result<Arc<MemoryBranch>, StoreError> {
        let mut branches = self.branches.write();
        let total: usize = branches.values().map(|b| b.len()).sum();
        let repository = branches.entry(branch.repository.clone()).or_default();
        if let Some(existing) = repository.get(&branch.branch) {
            return Ok(Arc::clone(existing));
        }
        let created = Arc::new(MemoryBranch::new(
            branch.clone(),
            (total as u64 + 1) * ID_RANGE,
            Arc::clone(&self.versions),
            Arc::clone(&self.offline),
        )?);
        repository.insert(branch.branch.clone(), Arc::clone(&created));
        info!(server = %self.url, branch = %branch, "Created branch");
        Ok(created)
    }

    pub fn branch(&self, branch: &BranchRef) -> Option<Arc<MemoryBranch>> {
        self.branches
            .read()
            .get(&branch.repository)
            .and_then(|r| r.get(&branch.branch))
            .cloned()
    }

    /// Simulate losing the connection to the server.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable(format!("{} is offline", self.url)))
        } else {
            Ok(())
        }
    }
}

impl RemoteClient for MemoryModelServer {
    fn server_url(&self) -> &str {
        &self.url
    }

    fn list_repositories(&self) -> Result<Vec<RepositoryId>, StoreError> {
        self.check_online()?;
        Ok(self.branches.read().keys().cloned().collect())
    }

    fn list_branches(&self, repository: &RepositoryId) -> Result<Vec<String>, StoreError> {
        self.check_online()?;
        self.branches
            .read()
            .get(repository)
            .map(|r| r.keys().cloned().collect())
            .ok_or_else(|| StoreError::RepositoryNotFound(repository.to_string()))
    }

    fn connect(&self, branch: &BranchRef) -> Result<Arc<dyn RemoteBranch>, StoreError> {
        self.check_online()?;
        let found: Arc<dyn RemoteBranch> = self
            .branch(branch)
            .ok_or_else(|| StoreError::BranchNotFound(branch.to_string()))?;
        Ok(found)
    }

    fn pull_version(&self, repository: &RepositoryId, version: &VersionHash)
        -> Result<(), StoreError> {
        self.check_online()?;
        if !self.branches.read().contains_key(repository) {
            return Err(StoreError::RepositoryNotFound(repository.to_string()));
        }
        if !self.versions.read().contains_key(version) {
            return Err(StoreError::VersionNotFound(version.to_string()));
        }
        Ok(())
    }

    fn push_version(&self, branch: &BranchRef, version: &VersionHash) -> Result<(), StoreError> {
        self.check_online()?;
        let target = self
            .branch(branch)
            .ok_or_else(|| StoreError::BranchNotFound(branch.to_string()))?;
        let tree = self
            .versions
            .read()
            .get(version)
            .cloned()
            .ok_or_else(|| StoreError::VersionNotFound(version.to_string()))?;
        let previous = target.snapshot();
        target.install(&previous, tree, version.clone());
        Ok(())
    }
}
