//! Connecting, switching branches and disconnecting

use super::test_utils::*;
use std::sync::Arc;
use treesync::types::BranchRef;
use treesync::SyncError;

#[tokio::test(flavor = "multi_thread")]
async fn connecting_twice_keeps_one_listener() {
    let fixture = Fixture::new();
    fixture.connect();
    fixture.connect();

    assert_eq!(fixture.branch.listener_count(), 1);
    assert_eq!(fixture.local.listener_count(), 1);
    assert_eq!(
        fixture.service.context().connection().branch_ref(),
        Some(fixture.branch_ref.clone())
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn switching_branches_disposes_the_previous_connection() {
    let fixture = Fixture::new();
    let feature = BranchRef::new("repo", "feature");
    let feature_branch = fixture.server.create_branch(&feature).unwrap();
    fixture.connect();

    fixture
        .service
        .connect(Arc::clone(&fixture.server) as _, &feature)
        .unwrap();

    assert_eq!(fixture.branch.listener_count(), 0);
    assert_eq!(feature_branch.listener_count(), 1);
    assert_eq!(fixture.local.listener_count(), 1);
    assert_eq!(fixture.service.context().connection().branch_ref(), Some(feature));
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_removes_both_listeners() {
    let fixture = Fixture::new();
    fixture.connect();

    fixture.service.disconnect();

    assert_eq!(fixture.branch.listener_count(), 0);
    assert_eq!(fixture.local.listener_count(), 0);
    assert!(matches!(
        fixture.service.context().branch(),
        Err(SyncError::NotConnected)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_server_reports_a_connection_failure() {
    let fixture = Fixture::new();
    fixture.server.set_offline(true);

    let result = fixture
        .service
        .connect(Arc::clone(&fixture.server) as _, &fixture.branch_ref);

    assert!(matches!(result, Err(SyncError::ConnectionFailure { .. })));
    assert!(!fixture.service.context().connection().is_connected());
    assert_eq!(fixture.notifier.errors().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_branch_is_rejected() {
    let fixture = Fixture::new();
    let missing = BranchRef::new("repo", "missing");

    let result = fixture
        .service
        .connect(Arc::clone(&fixture.server) as _, &missing);

    assert!(matches!(result, Err(SyncError::ConnectionFailure { .. })));
}
