//! Incremental propagation in both directions after a module is bound

use super::test_utils::*;
use treesync::concept::{properties, roles};
use treesync::store::{LocalRepository, NodeLocation, RemoteBranch, RemoteRead, RemoteRef};
use treesync::types::{LocalNodeId, ModuleId};

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
async fn remote_property_change_reaches_local_node() {
    let (fixture, remote) = bound_fixture().await;

    fixture.edit_remote(|write| {
        write.set_property(remote.root_a, "name", Some("alpha2")).unwrap();
        write.set_property(remote.root_a, "virtualPackage", Some("pkg")).unwrap();
    });
    fixture.service.settle().await;

    let node = fixture.local.node(&LocalNodeId::new("a-root")).unwrap();
    assert_eq!(node.properties.get("name").map(String::as_str), Some("alpha2"));
    assert!(!node.properties.contains_key("virtualPackage"));
    fixture.assert_no_errors();
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_subtree_with_forward_reference_is_added() {
    let (fixture, remote) = bound_fixture().await;

    let (parent, child) = fixture.edit_remote(|write| {
        let parent = add_entity(write, remote.root_b, "members", "outer", Some("outer"));
        let child = add_entity(write, parent, "members", "inner", Some("inner"));
        // points at a node created later in the same batch
        link(write, parent, "first", child);
        (parent, child)
    });
    fixture.service.settle().await;
    fixture.assert_no_errors();

    let identity = fixture.service.context().identity();
    assert_eq!(identity.get_local(parent), Some(LocalNodeId::new("outer")));
    assert_eq!(identity.get_local(child), Some(LocalNodeId::new("inner")));
    let outer = fixture.local.node(&LocalNodeId::new("outer")).unwrap();
    assert_eq!(outer.parent, Some(LocalNodeId::new("b-root")));
    assert_eq!(outer.references.get("first"), Some(&LocalNodeId::new("inner")));
    assert_eq!(identity.model_of_node(&LocalNodeId::new("inner")), Some(model("M.B")));
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_removal_and_move_are_mirrored() {
    let (fixture, remote) = bound_fixture().await;
    let child = LocalNodeId::derived_from(remote.child_a);

    // move the child of A's root under B's root
    fixture.edit_remote(|write| {
        write.move_child(remote.root_b, "members", None, remote.child_a).unwrap();
    });
    fixture.service.settle().await;
    let moved = fixture.local.node(&child).unwrap();
    assert_eq!(moved.parent, Some(LocalNodeId::new("b-root")));
    assert_eq!(moved.model, model("M.B"));
    assert_eq!(
        fixture.service.context().identity().model_of_node(&child),
        Some(model("M.B"))
    );

    fixture.edit_remote(|write| write.delete_node(remote.child_a).unwrap());
    fixture.service.settle().await;
    assert!(fixture.local.node(&child).is_none());
    assert!(!fixture.service.context().identity().is_mapped(remote.child_a));
    fixture.assert_no_errors();
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_model_removal_unbinds_and_deletes_locally() {
    let (fixture, remote) = bound_fixture().await;

    fixture.edit_remote(|write| write.delete_node(remote.model_a).unwrap());
    fixture.service.settle().await;

    assert!(fixture.local.model(&model("M.A")).is_none());
    assert!(fixture
        .service
        .context()
        .bindings()
        .model_binding(&model("M.A"))
        .is_none());
    assert!(!fixture
        .service
        .context()
        .identity()
        .is_mapped_local_node(&LocalNodeId::new("a-root")));
    // the module and its other model are untouched
    assert!(fixture.local.model(&model("M.B")).is_some());
    fixture.assert_no_errors();
}

#[tokio::test(flavor = "multi_thread")]
async fn local_property_edit_reaches_remote() {
    let (fixture, remote) = bound_fixture().await;

    fixture
        .local
        .set_property(&LocalNodeId::new("a-root"), "name", Some("edited"))
        .unwrap();
    fixture
        .local
        .set_property(&LocalNodeId::new("a-root"), "stereotype", Some("local only"))
        .unwrap();
    fixture.service.settle().await;

    let read = fixture.branch.read().unwrap();
    assert_eq!(read.property(remote.root_a, "name").unwrap().as_deref(), Some("edited"));
    assert_eq!(read.property(remote.root_a, "stereotype").unwrap(), None);
    fixture.assert_no_errors();
}

#[tokio::test(flavor = "multi_thread")]
async fn local_child_is_written_with_its_local_id() {
    let (fixture, remote) = bound_fixture().await;
    let new_node = LocalNodeId::new("fresh");

    fixture
        .local
        .create_node(
            &new_node,
            &entity(),
            NodeLocation::Child {
                parent: LocalNodeId::new("b-root"),
                role: "members".to_string(),
                index: None,
            },
        )
        .unwrap();
    fixture.local.set_property(&new_node, "name", Some("fresh")).unwrap();
    fixture
        .local
        .set_reference(&new_node, "target", Some(&LocalNodeId::new("a-root")))
        .unwrap();
    fixture.service.settle().await;
    fixture.assert_no_errors();

    let written = fixture
        .service
        .context()
        .identity()
        .get_remote(&new_node)
        .expect("new node is mapped");
    let read = fixture.branch.read().unwrap();
    assert_eq!(read.parent(written).unwrap(), Some(remote.root_b));
    assert_eq!(
        read.property(written, properties::LOCAL_ID).unwrap().as_deref(),
        Some("fresh")
    );
    assert_eq!(read.property(written, "name").unwrap().as_deref(), Some("fresh"));
    assert_eq!(
        read.reference(written, "target").unwrap(),
        Some(RemoteRef::Node(remote.root_a))
    );

    // the commit's own diff did not create a second local copy
    assert_eq!(
        fixture
            .service
            .context()
            .identity()
            .get_local(written),
        Some(new_node)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn local_root_removal_deletes_remote_subtree() {
    let (fixture, remote) = bound_fixture().await;

    fixture.local.delete_node(&LocalNodeId::new("a-root")).unwrap();
    fixture.service.settle().await;

    let read = fixture.branch.read().unwrap();
    assert!(!read.contains(remote.root_a));
    assert!(!read.contains(remote.child_a));
    assert!(read.children(remote.model_a, roles::ROOT_NODES).unwrap().is_empty());
    assert!(!fixture.service.context().identity().is_mapped(remote.child_a));
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_remote_delete_keeps_the_mapping() {
    let (fixture, remote) = bound_fixture().await;
    let child = LocalNodeId::derived_from(remote.child_a);
    fixture.branch.fail_writes_to(remote.root_a);

    fixture.local.delete_node(&LocalNodeId::new("a-root")).unwrap();
    fixture.service.settle().await;

    assert_eq!(fixture.notifier.errors().len(), 1);
    assert!(fixture.branch.read().unwrap().contains(remote.root_a));
    let identity = fixture.service.context().identity();
    assert_eq!(identity.get_local(remote.root_a), Some(LocalNodeId::new("a-root")));
    assert_eq!(identity.get_local(remote.child_a), Some(child));
    assert!(identity.is_consistent());
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_remote_move_keeps_the_node_in_its_model() {
    let (fixture, remote) = bound_fixture().await;
    let child = LocalNodeId::derived_from(remote.child_a);
    fixture.branch.fail_writes_to(remote.child_a);

    fixture
        .local
        .move_node(
            &child,
            NodeLocation::Child {
                parent: LocalNodeId::new("b-root"),
                role: "members".to_string(),
                index: None,
            },
        )
        .unwrap();
    fixture.service.settle().await;

    assert_eq!(fixture.notifier.errors().len(), 1);
    let read = fixture.branch.read().unwrap();
    assert_eq!(read.parent(remote.child_a).unwrap(), Some(remote.root_a));
    assert_eq!(
        fixture.service.context().identity().model_of_node(&child),
        Some(model("M.A"))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn edits_after_unbinding_are_not_mirrored() {
    let (fixture, remote) = bound_fixture().await;
    fixture
        .service
        .unbind_model(&model("M.A"), false)
        .await
        .unwrap();

    fixture
        .local
        .set_property(&LocalNodeId::new("a-root"), "name", Some("unbound"))
        .unwrap();
    fixture.service.settle().await;

    let read = fixture.branch.read().unwrap();
    assert_eq!(read.property(remote.root_a, "name").unwrap().as_deref(), Some("alpha"));
}
