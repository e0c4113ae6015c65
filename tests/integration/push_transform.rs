//! Local → remote bulk transform and the round trip into a second session

use super::test_utils::*;
use std::collections::HashMap;
use std::sync::Arc;
use treesync::concept::{properties, roles};
use treesync::store::{
    LocalRepository, ModuleDependency, NodeLocation, RemoteBranch, RemoteRead, RemoteRef,
};
use treesync::transform::{find_model, find_module, TransformOutcome};
use treesync::types::{BranchRef, LocalNodeId, ModuleId, RemoteNodeId};
use treesync::SyncError;

/// Local module `L` with one model holding a root and a child referring back to it.
fn build_local_module(fixture: &Fixture) {
    let local = &fixture.local;
    let module = ModuleId::new("L");
    let main = model("L.main");
    local.create_module(&module, "L").unwrap();
    local
        .add_module_dependency(
            &module,
            ModuleDependency {
                target: ModuleId::new("base"),
                name: "base".to_string(),
            },
        )
        .unwrap();
    local.create_model(&module, &main, "L.main").unwrap();
    local.set_model_property(&main, "stereotype", Some("tests")).unwrap();

    let root = LocalNodeId::new("l-root");
    local.create_node(&root, &entity(), NodeLocation::Root(main.clone())).unwrap();
    local.set_property(&root, "name", Some("root")).unwrap();
    let child = LocalNodeId::new("l-child");
    local
        .create_node(
            &child,
            &entity(),
            NodeLocation::Child {
                parent: root.clone(),
                role: "members".to_string(),
                index: None,
            },
        )
        .unwrap();
    local.set_property(&child, "name", Some("child")).unwrap();
    local.set_reference(&child, "owner", Some(&root)).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn local_module_is_written_in_remote_layout() {
    let fixture = Fixture::new();
    build_local_module(&fixture);
    fixture.connect();

    fixture
        .service
        .bind_module_from_local(&ModuleId::new("L"))
        .await
        .unwrap();
    fixture.service.settle().await;
    fixture.assert_no_errors();

    let read = fixture.branch.read().unwrap();
    let module = find_module(read.as_ref(), "L").unwrap().unwrap();
    let dependencies = read.children(module, roles::DEPENDENCIES).unwrap();
    assert_eq!(dependencies.len(), 1);
    assert_eq!(
        read.property(dependencies[0], properties::UUID).unwrap().as_deref(),
        Some("base")
    );

    let main = find_model(read.as_ref(), "L.main").unwrap().unwrap();
    assert_eq!(read.parent(main).unwrap(), Some(module));
    assert_eq!(read.property(main, "stereotype").unwrap(), None);
    let roots = read.children(main, roles::ROOT_NODES).unwrap();
    assert_eq!(roots.len(), 1);
    assert_eq!(
        read.property(roots[0], properties::LOCAL_ID).unwrap().as_deref(),
        Some("l-root")
    );
    let child = read.children(roots[0], "members").unwrap()[0];
    assert_eq!(read.reference(child, "owner").unwrap(), Some(RemoteRef::Node(roots[0])));

    let identity = fixture.service.context().identity();
    assert_eq!(identity.get_remote(&LocalNodeId::new("l-child")), Some(child));
    assert_eq!(identity.get_model(main), Some(model("L.main")));
    assert!(identity.is_consistent());

    let names: Vec<String> = fixture
        .service
        .bindings()
        .iter()
        .map(|b| b.name().to_string())
        .collect();
    assert_eq!(names, vec!["Binding of Model 'L.main'", "Binding of Module 'L'"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn pushing_twice_is_rejected() {
    let fixture = Fixture::new();
    build_local_module(&fixture);
    fixture.connect();
    let module = ModuleId::new("L");

    fixture.service.bind_module_from_local(&module).await.unwrap();
    let again = fixture.service.bind_module_from_local(&module).await;

    assert!(matches!(again, Err(SyncError::AlreadyOnRemote(_))));
    let read = fixture.branch.read().unwrap();
    assert_eq!(read.children(read.root(), roles::MODULES).unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_push_leaves_no_mapping_behind() {
    let fixture = Fixture::new();
    build_local_module(&fixture);
    fixture.connect();
    let root = fixture.branch.read().unwrap().root();
    fixture.branch.fail_writes_to(root);

    let result = fixture.service.bind_module_from_local(&ModuleId::new("L")).await;

    assert!(result.is_err());
    assert!(fixture.service.context().identity().is_empty());
    assert!(fixture.service.bindings().is_empty());
    assert_eq!(fixture.notifier.errors().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn pushed_module_round_trips_into_another_session() {
    let author = Fixture::new();
    build_local_module(&author);
    author.connect();
    author
        .service
        .bind_module_from_local(&ModuleId::new("L"))
        .await
        .unwrap();
    author.service.settle().await;

    let reader = Fixture::on_branch(
        Arc::clone(&author.server),
        author.branch_ref.clone(),
        Arc::clone(&author.branch),
    );
    reader.connect();
    let outcome = reader
        .service
        .bind_module_from_remote(&ModuleId::new("L"))
        .await
        .unwrap();
    assert_eq!(outcome, TransformOutcome::Transformed);
    reader.service.settle().await;
    reader.assert_no_errors();

    let child = reader.local.node(&LocalNodeId::new("l-child")).unwrap();
    assert_eq!(child.parent, Some(LocalNodeId::new("l-root")));
    assert_eq!(child.references.get("owner"), Some(&LocalNodeId::new("l-root")));
    assert_eq!(child.properties.get("name").map(String::as_str), Some("child"));
    let module = reader.local.module(&ModuleId::new("L")).unwrap();
    assert!(module.dependencies.contains_key(&ModuleId::new("base")));

    // an edit in one session shows up in the other
    author
        .local
        .set_property(&LocalNodeId::new("l-child"), "name", Some("renamed"))
        .unwrap();
    author.service.settle().await;
    reader.service.settle().await;
    let child = reader.local.node(&LocalNodeId::new("l-child")).unwrap();
    assert_eq!(child.properties.get("name").map(String::as_str), Some("renamed"));
}

/// One line per node of the subtree at `node`: its path, concept, properties other than
/// `ignored`, and references with their targets written as paths. Modules and models are
/// addressed by id, other children by position in their role.
fn canonical_tree(read: &dyn RemoteRead, node: RemoteNodeId, ignored: &[&str]) -> Vec<String> {
    let mut paths = HashMap::new();
    let mut visited = Vec::new();
    let mut stack = vec![(node, String::new())];
    while let Some((id, path)) = stack.pop() {
        let mut per_role: HashMap<String, usize> = HashMap::new();
        let mut children = Vec::new();
        for (role, child) in read.all_children(id).unwrap() {
            let index = per_role.entry(role.clone()).or_default();
            let key = match read.property(child, properties::ID).unwrap() {
                Some(id) => id,
                None => index.to_string(),
            };
            children.push((child, format!("{path}/{role}[{key}]")));
            *index += 1;
        }
        stack.extend(children.into_iter().rev());
        paths.insert(id, path);
        visited.push(id);
    }

    visited
        .iter()
        .map(|id| {
            let mut properties: Vec<String> = read
                .properties(*id)
                .unwrap()
                .into_iter()
                .filter(|(key, _)| !ignored.contains(&key.as_str()))
                .map(|(key, value)| format!("{key}={value}"))
                .collect();
            properties.sort();
            let mut references: Vec<String> = read
                .references(*id)
                .unwrap()
                .into_iter()
                .map(|(role, target)| match target {
                    RemoteRef::Node(target) => match paths.get(&target) {
                        Some(path) => format!("{role}->{path}"),
                        None => format!("{role}->outside {target}"),
                    },
                    RemoteRef::Foreign(target) => format!("{role}->foreign {target}"),
                })
                .collect();
            references.sort();
            format!(
                "{} {} {properties:?} {references:?}",
                paths[id],
                read.concept(*id).unwrap()
            )
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn pulled_module_pushed_to_a_clean_branch_matches_the_original() {
    let puller = Fixture::new();
    let original = build_two_model_module(&puller);
    puller.connect();
    puller
        .service
        .bind_module_from_remote(&ModuleId::new("M"))
        .await
        .unwrap();
    puller.service.settle().await;

    let clean_ref = BranchRef::new("repo", "clean");
    let clean = puller.server.create_branch(&clean_ref).unwrap();
    let pusher = Fixture::with_local(
        Arc::clone(&puller.server),
        clean_ref,
        Arc::clone(&clean),
        Arc::clone(&puller.local),
    );
    pusher.connect();
    pusher
        .service
        .bind_module_from_local(&ModuleId::new("M"))
        .await
        .unwrap();
    pusher.service.settle().await;
    puller.assert_no_errors();
    pusher.assert_no_errors();

    let ignored = ["stereotype", "virtualPackage", properties::LOCAL_ID];
    let source = puller.branch.read().unwrap();
    let copy = clean.read().unwrap();
    let copied_module = find_module(copy.as_ref(), "M").unwrap().unwrap();
    let expected = canonical_tree(source.as_ref(), original.module, &ignored);
    assert_eq!(canonical_tree(copy.as_ref(), copied_module, &ignored), expected);
    assert!(expected.iter().any(|line| line.contains("target->")));

    // every copied node names the local node it came from
    let copied = pusher.service.context().identity();
    for (local, original_node) in [
        (LocalNodeId::new("a-root"), original.root_a),
        (LocalNodeId::new("b-root"), original.root_b),
        (LocalNodeId::derived_from(original.child_a), original.child_a),
    ] {
        assert_eq!(
            puller.service.context().identity().get_local(original_node),
            Some(local.clone())
        );
        let remote = copied.get_remote(&local).unwrap();
        assert_eq!(
            copy.property(remote, properties::LOCAL_ID).unwrap().as_deref(),
            Some(local.as_str())
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn model_pushed_into_synchronized_module() {
    let fixture = Fixture::new();
    build_local_module(&fixture);
    fixture.connect();
    let module = ModuleId::new("L");
    fixture.service.bind_module_from_local(&module).await.unwrap();

    let extra = model("L.extra");
    fixture.local.create_model(&module, &extra, "L.extra").unwrap();
    fixture.service.settle().await;

    // the module binding may already have mirrored the new model
    match fixture.service.bind_model_from_local(&extra).await {
        Ok(()) | Err(SyncError::AlreadyOnRemote(_)) => {}
        Err(other) => panic!("unexpected failure: {other}"),
    }
    let read = fixture.branch.read().unwrap();
    assert!(find_model(read.as_ref(), "L.extra").unwrap().is_some());
    assert!(fixture.service.context().identity().is_mapped_local_model(&extra));
}
