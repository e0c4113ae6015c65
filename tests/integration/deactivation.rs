//! Unbinding modules and models

use super::test_utils::*;
use treesync::binding::BindingState;
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
async fn unbinding_keeps_both_stores_and_forgets_the_mapping() {
    let (fixture, remote) = bound_fixture().await;
    let module = ModuleId::new("M");
    let binding = fixture.service.context().bindings().module_binding(&module).unwrap();

    fixture.service.unbind_module(&module, false).await.unwrap();

    assert_eq!(binding.state(), BindingState::Deactivated);
    assert!(fixture.service.context().bindings().is_empty());
    assert!(fixture.service.context().identity().is_empty());
    assert!(fixture.local.module(&module).is_some());
    assert!(fixture.branch.read().unwrap().contains(remote.module));

    // a second request completes at once
    fixture.service.unbind_module(&module, false).await.unwrap();
    fixture.assert_no_errors();
}

#[tokio::test(flavor = "multi_thread")]
async fn removal_from_remote_deletes_the_module_subtree() {
    let (fixture, remote) = bound_fixture().await;

    fixture
        .service
        .unbind_module(&ModuleId::new("M"), true)
        .await
        .unwrap();
    fixture.service.settle().await;

    let read = fixture.branch.read().unwrap();
    assert!(!read.contains(remote.module));
    assert!(!read.contains(remote.root_b));
    // the local copy stays
    assert!(fixture.local.node(&LocalNodeId::new("a-root")).is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_model_still_reaches_terminal_state() {
    let (fixture, remote) = bound_fixture().await;
    fixture.branch.fail_writes_to(remote.model_b);
    let module = ModuleId::new("M");

    let result = fixture.service.unbind_module(&module, true).await;

    assert!(matches!(result, Err(SyncError::DeactivationFailed { .. })));
    assert_eq!(fixture.notifier.errors().len(), 1);
    let bindings = fixture.service.context().bindings();
    assert!(bindings.is_empty());
    assert!(bindings.module_binding(&module).is_none());
    let identity = fixture.service.context().identity();
    assert!(!identity.is_mapped_local_module(&module));
    assert!(!identity.is_mapped_local_model(&model("M.B")));

    // A's removal went through; B and the module node were left in place
    let read = fixture.branch.read().unwrap();
    assert!(!read.contains(remote.model_a));
    assert!(read.contains(remote.model_b));
    assert!(read.contains(remote.module));
}

#[tokio::test(flavor = "multi_thread")]
async fn unbinding_one_model_leaves_the_module_bound() {
    let (fixture, remote) = bound_fixture().await;

    fixture.service.unbind_model(&model("M.A"), true).await.unwrap();
    fixture.service.settle().await;

    let bindings = fixture.service.context().bindings();
    assert!(bindings.model_binding(&model("M.A")).is_none());
    assert!(bindings.model_binding(&model("M.B")).is_some());
    assert!(bindings.module_binding(&ModuleId::new("M")).is_some());
    assert!(!fixture.branch.read().unwrap().contains(remote.model_a));
    // the module still lists the model locally
    assert!(fixture.local.model(&model("M.A")).is_some());
    fixture.assert_no_errors();
}

#[tokio::test(flavor = "multi_thread")]
async fn unbind_all_releases_every_module() {
    let fixture = Fixture::new();
    fixture.edit_remote(|write| {
        for name in ["X", "Y"] {
            let module = add_module(write, name);
            let model = add_model(write, module, &format!("{name}.m"));
            add_root(write, model, name, None);
        }
    });
    fixture.connect();
    for name in ["X", "Y"] {
        fixture
            .service
            .bind_module_from_remote(&ModuleId::new(name))
            .await
            .unwrap();
    }
    assert_eq!(fixture.service.bindings().len(), 4);

    fixture.service.unbind_all(false).await.unwrap();

    assert!(fixture.service.bindings().is_empty());
    assert!(fixture.service.context().identity().is_empty());
}
