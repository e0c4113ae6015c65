//! Store collaborators
//!
//! The engine drives two stores it does not own: the editable local tree and the replicated
//! remote tree. Both are consumed through the traits in [`local`] and [`remote`]. The
//! in-memory implementations back the command line tool and the test suite.

pub mod diff;
pub mod local;
pub mod memory_local;
pub mod memory_remote;
pub mod remote;

pub use local::{
    DevKitDependency, LanguageDependency, ListenerScope, LocalChangeListener, LocalEdit,
    LocalModel, LocalModule, LocalNode, LocalRepository, ModuleDependency, NodeLocation,
};
pub use memory_local::MemoryLocalRepository;
pub use memory_remote::{MemoryBranch, MemoryModelServer};
pub use remote::{
    RemoteBranch, RemoteClient, RemoteRead, RemoteRef, RemoteWrite, TreeDiffVisitor,
};
