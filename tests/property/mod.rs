//! Property-based tests for the identity map

mod identity_map;
