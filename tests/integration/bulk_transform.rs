//! Remote → local bulk transform of whole modules

use super::test_utils::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use treesync::binding::{presentation_order, BindingState};
use treesync::concept::roles;
use treesync::scheduler::{SyncDirection, SyncLock};
use treesync::store::{LocalRepository, RemoteBranch, TreeDiffVisitor};
use treesync::transform::TransformOutcome;
use treesync::types::{LocalNodeId, ModuleId};
use treesync::SyncError;

#[tokio::test(flavor = "multi_thread")]
async fn module_with_cross_model_reference_is_materialized() {
    let fixture = Fixture::new();
    let remote = build_two_model_module(&fixture);
    fixture.connect();

    let outcome = fixture
        .service
        .bind_module_from_remote(&ModuleId::new("M"))
        .await
        .unwrap();
    assert_eq!(outcome, TransformOutcome::Transformed);
    fixture.service.settle().await;
    fixture.assert_no_errors();

    let identity = fixture.service.context().identity();
    let root_a = LocalNodeId::new("a-root");
    let root_b = LocalNodeId::new("b-root");
    assert_eq!(identity.get_remote(&root_a), Some(remote.root_a));
    assert_eq!(identity.get_remote(&root_b), Some(remote.root_b));
    assert_eq!(identity.get_model(remote.model_a), Some(model("M.A")));
    assert_eq!(identity.get_module(remote.module), Some(ModuleId::new("M")));

    // the reference crossing models was deferred and resolved after both models existed
    let local_b = fixture.local.node(&root_b).unwrap();
    assert_eq!(local_b.references.get("target"), Some(&root_a));
    assert!(fixture.service.context().references().is_empty());

    // the node without a local id got one derived from its remote id
    let child = LocalNodeId::derived_from(remote.child_a);
    let local_child = fixture.local.node(&child).unwrap();
    assert_eq!(local_child.parent, Some(root_a.clone()));
    assert_eq!(local_child.properties.get("name").map(String::as_str), Some("alpha.child"));

    // ignored properties never reach the local store
    assert!(!local_b.properties.contains_key("stereotype"));

    let module = fixture.local.module(&ModuleId::new("M")).unwrap();
    assert_eq!(module.models.len(), 2);
    assert!(identity.is_consistent());
}

#[tokio::test(flavor = "multi_thread")]
async fn bindings_are_created_and_presented_models_first() {
    let fixture = Fixture::new();
    build_two_model_module(&fixture);
    fixture.connect();

    fixture
        .service
        .bind_module_from_remote(&ModuleId::new("M"))
        .await
        .unwrap();

    let bindings = fixture.service.bindings();
    let names: Vec<&str> = bindings.iter().map(|b| b.name()).collect();
    assert_eq!(
        names,
        vec![
            "Binding of Model 'M.A'",
            "Binding of Model 'M.B'",
            "Binding of Module 'M'",
        ]
    );
    assert!(bindings.iter().all(|b| b.state() == BindingState::Activated));
    assert!(bindings
        .windows(2)
        .all(|pair| presentation_order(&pair[0], &pair[1]).is_le()));
}

#[tokio::test(flavor = "multi_thread")]
async fn binding_twice_reports_already_synchronized() {
    let fixture = Fixture::new();
    build_two_model_module(&fixture);
    fixture.connect();
    let module = ModuleId::new("M");

    fixture.service.bind_module_from_remote(&module).await.unwrap();
    let nodes = fixture.local.node_count();
    let again = fixture.service.bind_module_from_remote(&module).await.unwrap();

    assert_eq!(again, TransformOutcome::AlreadySynchronized);
    assert_eq!(fixture.local.node_count(), nodes);
}

#[tokio::test(flavor = "multi_thread")]
async fn shared_dependency_is_transformed_once() {
    let fixture = Fixture::new();
    let (core_model, core_root) = fixture.edit_remote(|write| {
        let core = add_module(write, "C");
        let core_model = add_model(write, core, "C.base");
        let core_root = add_root(write, core_model, "base", Some("c-root"));
        for name in ["M1", "M2"] {
            let module = add_module(write, name);
            add_dependency(write, module, "C");
            let model_id = format!("{name}.main");
            let model = add_model(write, module, &model_id);
            let root = add_root(write, model, name, None);
            link(write, root, "extends", core_root);
        }
        (core_model, core_root)
    });
    fixture.connect();

    let first = ModuleId::new("M1");
    let second = ModuleId::new("M2");
    let (a, b) = tokio::join!(
        fixture.service.bind_module_from_remote(&first),
        fixture.service.bind_module_from_remote(&second),
    );
    assert_eq!(a.unwrap(), TransformOutcome::Transformed);
    assert_eq!(b.unwrap(), TransformOutcome::Transformed);
    fixture.service.settle().await;
    fixture.assert_no_errors();

    let identity = fixture.service.context().identity();
    assert_eq!(identity.get_model(core_model), Some(model("C.base")));
    assert_eq!(identity.get_local(core_root), Some(LocalNodeId::new("c-root")));
    assert_eq!(fixture.local.module(&ModuleId::new("C")).unwrap().models.len(), 1);
    // three roots, one per model, and nothing duplicated
    assert_eq!(fixture.local.node_count(), 3);

    for name in ["M1", "M2"] {
        let module = fixture.local.module(&ModuleId::new(name)).unwrap();
        assert!(module.dependencies.contains_key(&ModuleId::new("C")));
        let root = fixture
            .local
            .find_node(&model(&format!("{name}.main")), "name", name)
            .unwrap();
        assert_eq!(root.references.get("extends"), Some(&LocalNodeId::new("c-root")));
    }
    assert!(fixture
        .service
        .context()
        .bindings()
        .module_binding(&ModuleId::new("C"))
        .is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn cyclic_module_dependencies_terminate() {
    let fixture = Fixture::new();
    fixture.edit_remote(|write| {
        let left = add_module(write, "left");
        let right = add_module(write, "right");
        add_dependency(write, left, "right");
        add_dependency(write, right, "left");
        add_model(write, left, "left.m");
        add_model(write, right, "right.m");
    });
    fixture.connect();

    let outcome = fixture
        .service
        .bind_module_from_remote(&ModuleId::new("left"))
        .await
        .unwrap();
    assert_eq!(outcome, TransformOutcome::Transformed);
    assert!(fixture.local.module(&ModuleId::new("right")).is_some());
    assert!(fixture.local.model(&model("right.m")).is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn cycle_between_sibling_dependencies_terminates() {
    let fixture = Fixture::new();
    fixture.edit_remote(|write| {
        let entry = add_module(write, "E");
        let c = add_module(write, "C");
        let d = add_module(write, "D");
        add_dependency(write, entry, "C");
        add_dependency(write, entry, "D");
        add_dependency(write, c, "D");
        add_dependency(write, d, "C");
        add_model(write, c, "C.m");
        add_model(write, d, "D.m");
    });
    fixture.connect();

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        fixture.service.bind_module_from_remote(&ModuleId::new("E")),
    )
    .await
    .expect("transform of E never finished")
    .unwrap();

    assert_eq!(outcome, TransformOutcome::Transformed);
    for module in ["E", "C", "D"] {
        assert!(fixture.local.module(&ModuleId::new(module)).is_some());
    }
    assert!(fixture.local.model(&model("C.m")).is_some());
    assert!(fixture.local.model(&model("D.m")).is_some());
    fixture.service.settle().await;
    fixture.assert_no_errors();
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_node_added_is_idempotent() {
    let fixture = Fixture::new();
    let remote = build_two_model_module(&fixture);
    fixture.connect();
    fixture
        .service
        .bind_module_from_remote(&ModuleId::new("M"))
        .await
        .unwrap();
    let nodes = fixture.local.node_count();
    let entries = fixture.service.context().identity().len();

    let visitor = fixture.service.context().remote_listener();
    for node in [remote.root_a, remote.child_a, remote.model_b, remote.module] {
        visitor.node_added(node);
        visitor.node_added(node);
    }
    fixture.service.settle().await;

    fixture.assert_no_errors();
    assert_eq!(fixture.local.node_count(), nodes);
    assert_eq!(fixture.service.context().identity().len(), entries);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_module_fails_and_notifies() {
    let fixture = Fixture::new();
    fixture.connect();

    let result = fixture
        .service
        .bind_module_from_remote(&ModuleId::new("missing"))
        .await;
    assert!(matches!(result, Err(SyncError::MappingInconsistency(_))));
    assert_eq!(fixture.notifier.errors().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn binding_requires_a_connection() {
    let fixture = Fixture::new();
    let result = fixture
        .service
        .bind_module_from_remote(&ModuleId::new("M"))
        .await;
    assert!(matches!(result, Err(SyncError::NotConnected)));
}

#[tokio::test(flavor = "multi_thread")]
async fn single_model_of_synchronized_module_can_be_bound() {
    let fixture = Fixture::new();
    let remote = build_two_model_module(&fixture);
    fixture.connect();
    fixture
        .service
        .bind_module_from_remote(&ModuleId::new("M"))
        .await
        .unwrap();

    // a model added while the connection was down is bound on demand
    fixture.service.disconnect();
    let late = fixture.edit_remote(|write| {
        let late = add_model(write, remote.module, "M.C");
        let root = add_root(write, late, "gamma", Some("c-root"));
        link(write, root, "target", remote.root_b);
        late
    });
    fixture.connect();
    fixture
        .service
        .bind_model_from_remote(&model("M.C"))
        .await
        .unwrap();

    assert_eq!(
        fixture.service.context().identity().get_model(late),
        Some(model("M.C"))
    );
    let root = fixture.local.node(&LocalNodeId::new("c-root")).unwrap();
    assert_eq!(root.references.get("target"), Some(&LocalNodeId::new("b-root")));
    assert!(fixture
        .service
        .context()
        .bindings()
        .model_binding(&model("M.C"))
        .is_some());
    let children = fixture
        .branch
        .read()
        .unwrap()
        .children(late, roles::ROOT_NODES)
        .unwrap();
    assert_eq!(children.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn blocking_bind_waits_for_the_whole_transform() {
    let fixture = Fixture::new();
    build_two_model_module(&fixture);
    fixture.connect();

    let outcome = tokio::task::block_in_place(|| {
        fixture
            .service
            .bind_module_from_remote_blocking(&ModuleId::new("M"), None)
    })
    .unwrap();

    assert_eq!(outcome, TransformOutcome::Transformed);
    assert!(fixture.local.model(&model("M.B")).is_some());
    assert!(fixture.service.context().bindings().module_binding(&ModuleId::new("M")).is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn blocking_bind_gives_up_after_its_timeout() {
    let fixture = Fixture::new();
    build_two_model_module(&fixture);
    fixture.connect();

    // keeps the local store locked until released
    let release = Arc::new(AtomicBool::new(false));
    let gate = Arc::clone(&release);
    let blocker = fixture.service.context().scheduler().enqueue(
        SyncLock::LocalWrite,
        SyncDirection::None,
        move || {
            while !gate.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        },
    );

    let timeout = Duration::from_millis(50);
    let result = tokio::task::block_in_place(|| {
        fixture
            .service
            .bind_module_from_remote_blocking(&ModuleId::new("M"), Some(timeout))
    });
    assert!(matches!(result, Err(SyncError::TimedOut(t)) if t == timeout));
    assert_eq!(fixture.notifier.errors().len(), 1);

    release.store(true, Ordering::SeqCst);
    blocker.join().await.unwrap();
    fixture.service.settle().await;
    assert!(fixture.local.module(&ModuleId::new("M")).is_some());
}
