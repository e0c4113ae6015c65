//! Saving session state and resuming it in a new session

use super::test_utils::*;
use std::sync::Arc;
use tempfile::TempDir;
use treesync::persistence::{PersistedState, StateStore};
use treesync::store::{LocalRepository, RemoteBranch, RemoteRead};
use treesync::types::{LocalNodeId, ModuleId};
use treesync::SyncError;

async fn bound_fixture() -> (Fixture, TwoModelModule) {
    let fixture = Fixture::new();
    let remote = build_two_model_module(&fixture);
    fixture.connect();
    fixture
        .service
        .bind_module_from_remote(&ModuleId::new("M"))
        .await
        .unwrap();
    fixture.service.settle().await;
    (fixture, remote)
}

#[tokio::test(flavor = "multi_thread")]
async fn saved_state_describes_the_session() {
    let (fixture, _remote) = bound_fixture().await;
    let temp = TempDir::new().unwrap();
    let store = StateStore::open(temp.path().join("state")).unwrap();

    fixture.service.save_state(&store).unwrap();
    let state = store.load().unwrap().unwrap();

    assert_eq!(state.client_url, SERVER_URL);
    assert_eq!(state.repository_id, "repo");
    assert_eq!(state.branch_name, "main");
    assert_eq!(state.module_ids, vec!["M".to_string()]);
    assert_eq!(state.local_version_hash, fixture.branch.head().unwrap().to_string());
    assert!(state.is_restorable());
}

#[tokio::test(flavor = "multi_thread")]
async fn restore_rebinds_and_catches_up_with_remote_changes() {
    let (fixture, remote) = bound_fixture().await;
    let temp = TempDir::new().unwrap();
    let store = StateStore::open(temp.path().join("state")).unwrap();
    fixture.service.save_state(&store).unwrap();
    fixture.service.shutdown().await.unwrap();

    // changed on the server while no session was running
    fixture.edit_remote(|write| {
        write.set_property(remote.root_b, "name", Some("beta2")).unwrap();
        add_entity(write, remote.root_a, "members", "late", Some("late"));
    });

    let resumed = fixture.restarted();
    let nodes = resumed.local.node_count();
    let state = store.load().unwrap().unwrap();
    let restored = resumed
        .service
        .restore(Arc::clone(&resumed.server) as _, &state)
        .await
        .unwrap();
    assert!(restored);
    resumed.service.settle().await;
    resumed.assert_no_errors();

    // no bulk transform ran: only the replayed addition is new
    assert_eq!(resumed.local.node_count(), nodes + 1);
    let beta = resumed.local.node(&LocalNodeId::new("b-root")).unwrap();
    assert_eq!(beta.properties.get("name").map(String::as_str), Some("beta2"));
    let late = resumed.local.node(&LocalNodeId::new("late")).unwrap();
    assert_eq!(late.parent, Some(LocalNodeId::new("a-root")));

    let names: Vec<String> = resumed
        .service
        .bindings()
        .iter()
        .map(|b| b.name().to_string())
        .collect();
    assert_eq!(
        names,
        vec!["Binding of Model 'M.A'", "Binding of Model 'M.B'", "Binding of Module 'M'"]
    );

    // the resumed session propagates local edits again
    resumed
        .local
        .set_property(&LocalNodeId::new("a-root"), "name", Some("after restore"))
        .unwrap();
    resumed.service.settle().await;
    assert_eq!(
        resumed
            .branch
            .read()
            .unwrap()
            .property(remote.root_a, "name")
            .unwrap()
            .as_deref(),
        Some("after restore")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn incomplete_state_is_not_restored() {
    let fixture = Fixture::new();
    let state = PersistedState {
        client_url: SERVER_URL.to_string(),
        repository_id: "repo".to_string(),
        branch_name: " ".to_string(),
        local_version_hash: "abc".to_string(),
        module_ids: vec!["M".to_string()],
        serialized_identity_map: String::new(),
    };

    let restored = fixture
        .service
        .restore(Arc::clone(&fixture.server) as _, &state)
        .await
        .unwrap();

    assert!(!restored);
    assert!(!fixture.service.context().connection().is_connected());
    fixture.assert_no_errors();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_restore_resets_the_session() {
    let (fixture, _remote) = bound_fixture().await;
    let mut state = fixture.service.snapshot_state().unwrap();
    fixture.service.shutdown().await.unwrap();
    state.module_ids.push("ghost".to_string());

    let resumed = fixture.restarted();
    let result = resumed
        .service
        .restore(Arc::clone(&resumed.server) as _, &state)
        .await;

    assert!(matches!(result, Err(SyncError::RestoreFailed(_))));
    assert!(!resumed.service.context().connection().is_connected());
    assert!(resumed.service.context().identity().is_empty());
    assert!(resumed.service.context().bindings().is_empty());
    assert_eq!(resumed.notifier.errors().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_version_fails_to_restore() {
    let (fixture, _remote) = bound_fixture().await;
    let mut state = fixture.service.snapshot_state().unwrap();
    fixture.service.shutdown().await.unwrap();
    state.local_version_hash = "0".repeat(64);

    let resumed = fixture.restarted();
    let result = resumed
        .service
        .restore(Arc::clone(&resumed.server) as _, &state)
        .await;

    assert!(matches!(result, Err(SyncError::ConnectionFailure { .. })));
    assert!(resumed.service.context().identity().is_empty());
}

#[test]
fn cleared_store_loads_nothing() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("state");
    let state = PersistedState {
        client_url: SERVER_URL.to_string(),
        repository_id: "repo".to_string(),
        branch_name: "main".to_string(),
        local_version_hash: "abc".to_string(),
        module_ids: vec!["M".to_string()],
        serialized_identity_map: "{}".to_string(),
    };
    {
        let store = StateStore::open(&path).unwrap();
        store.save(&state).unwrap();
    }
    let store = StateStore::open(&path).unwrap();
    assert_eq!(store.load().unwrap(), Some(state));
    store.clear().unwrap();
    assert_eq!(store.load().unwrap(), None);
}
