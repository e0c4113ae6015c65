//! Incremental change propagation
//!
//! Remote diffs arrive through [`RemoteChangeVisitor`]; each callback becomes one
//! `RemoteToLocal` scheduler task. Local edits are pushed by the store listeners into the
//! bounded channel of [`EditSink`] and a single pump thread turns them, in arrival order, into
//! `LocalToRemote` tasks.
//!
//! Concurrent edits of the same property on both sides are not merged: whichever task the
//! scheduler runs last wins.

mod local_to_remote;
mod remote_to_local;

pub use local_to_remote::EditSink;
pub use remote_to_local::RemoteChangeVisitor;
