//! Integration tests for the synchronization engine
//!
//! Every test runs a full session against the in-memory model server and local repository.

mod bulk_transform;
mod connection_registry;
mod deactivation;
mod persistence_restore;
mod propagation;
mod push_transform;
mod test_utils;
