//! Shared fixtures for integration tests
//!
//! A session wired to an in-memory model server and an in-memory local repository, plus
//! helpers to build remote trees in a single write transaction.

use std::sync::Arc;
use std::time::Duration;
use treesync::concept::{concepts, properties, roles, LanguageRepository};
use treesync::context::SyncSettings;
use treesync::notify::CollectingNotifier;
use treesync::store::{
    LocalRepository, MemoryBranch, MemoryLocalRepository, MemoryModelServer, RemoteBranch,
    RemoteRef, RemoteWrite,
};
use treesync::types::{BranchRef, ConceptId, ModelId, RemoteNodeId};
use treesync::{SchedulerConfig, SyncService};

pub const SERVER_URL: &str = "memory://integration";
pub const ENTITY: &str = "test.lang.Entity";

pub struct Fixture {
    pub server: Arc<MemoryModelServer>,
    pub branch_ref: BranchRef,
    pub branch: Arc<MemoryBranch>,
    pub local: Arc<MemoryLocalRepository>,
    pub languages: Arc<LanguageRepository>,
    pub notifier: Arc<CollectingNotifier>,
    pub service: SyncService,
}

impl Fixture {
    /// Fresh session with an empty `repo/main` branch. Must run inside a tokio runtime.
    pub fn new() -> Self {
        let server = MemoryModelServer::new(SERVER_URL);
        let branch_ref = BranchRef::new("repo", "main");
        let branch = server.create_branch(&branch_ref).unwrap();
        Self::on_branch(server, branch_ref, branch)
    }

    /// Session on an existing branch, with its own local repository.
    pub fn on_branch(
        server: Arc<MemoryModelServer>,
        branch_ref: BranchRef,
        branch: Arc<MemoryBranch>,
    ) -> Self {
        Self::with_local(server, branch_ref, branch, MemoryLocalRepository::new())
    }

    /// A second session over the same stores, as after a restart.
    pub fn restarted(&self) -> Self {
        Self::with_local(
            Arc::clone(&self.server),
            self.branch_ref.clone(),
            Arc::clone(&self.branch),
            Arc::clone(&self.local),
        )
    }

    pub fn with_local(
        server: Arc<MemoryModelServer>,
        branch_ref: BranchRef,
        branch: Arc<MemoryBranch>,
        local: Arc<MemoryLocalRepository>,
    ) -> Self {
        let languages = Arc::new(LanguageRepository::new());
        languages.register_concept(ENTITY, true);
        let notifier = Arc::new(CollectingNotifier::new());
        let settings = SyncSettings {
            poll_interval: Duration::from_millis(10),
            ..SyncSettings::default()
        };
        let service = SyncService::with_settings(
            SchedulerConfig {
                workers: 4,
                ..SchedulerConfig::default()
            },
            settings,
            Arc::clone(&local) as Arc<dyn LocalRepository>,
            Arc::clone(&languages),
            Arc::clone(&notifier) as _,
        )
        .unwrap();
        Self {
            server,
            branch_ref,
            branch,
            local,
            languages,
            notifier,
            service,
        }
    }

    pub fn connect(&self) {
        self.service
            .connect(Arc::clone(&self.server) as _, &self.branch_ref)
            .unwrap();
    }

    /// Run `edit` in one remote write transaction and commit it.
    pub fn edit_remote<R>(&self, edit: impl FnOnce(&mut dyn RemoteWrite) -> R) -> R {
        let mut write = self.branch.write().unwrap();
        let result = edit(write.as_mut());
        write.commit().unwrap();
        result
    }

    pub fn assert_no_errors(&self) {
        let errors = self.notifier.errors();
        assert!(errors.is_empty(), "unexpected failures: {errors:?}");
    }
}

pub fn entity() -> ConceptId {
    ConceptId::new(ENTITY)
}

pub fn add_module(write: &mut dyn RemoteWrite, id: &str) -> RemoteNodeId {
    let root = write.root();
    let module = write
        .add_new_child(root, roles::MODULES, None, &ConceptId::new(concepts::MODULE))
        .unwrap();
    write.set_property(module, properties::ID, Some(id)).unwrap();
    write.set_property(module, properties::NAME, Some(id)).unwrap();
    module
}

pub fn add_model(write: &mut dyn RemoteWrite, module: RemoteNodeId, id: &str) -> RemoteNodeId {
    let model = write
        .add_new_child(module, roles::MODELS, None, &ConceptId::new(concepts::MODEL))
        .unwrap();
    write.set_property(model, properties::ID, Some(id)).unwrap();
    write.set_property(model, properties::NAME, Some(id)).unwrap();
    model
}

pub fn add_dependency(
    write: &mut dyn RemoteWrite,
    module: RemoteNodeId,
    target: &str,
) -> RemoteNodeId {
    let dependency = write
        .add_new_child(
            module,
            roles::DEPENDENCIES,
            None,
            &ConceptId::new(concepts::MODULE_DEPENDENCY),
        )
        .unwrap();
    write.set_property(dependency, properties::UUID, Some(target)).unwrap();
    write.set_property(dependency, properties::NAME, Some(target)).unwrap();
    dependency
}

/// Plain node named `name`, optionally carrying its local id.
pub fn add_entity(
    write: &mut dyn RemoteWrite,
    parent: RemoteNodeId,
    role: &str,
    name: &str,
    local_id: Option<&str>,
) -> RemoteNodeId {
    let node = write.add_new_child(parent, role, None, &entity()).unwrap();
    write.set_property(node, "name", Some(name)).unwrap();
    if let Some(local_id) = local_id {
        write.set_property(node, properties::LOCAL_ID, Some(local_id)).unwrap();
    }
    node
}

pub fn add_root(
    write: &mut dyn RemoteWrite,
    model: RemoteNodeId,
    name: &str,
    local_id: Option<&str>,
) -> RemoteNodeId {
    add_entity(write, model, roles::ROOT_NODES, name, local_id)
}

pub fn link(write: &mut dyn RemoteWrite, source: RemoteNodeId, role: &str, target: RemoteNodeId) {
    write
        .set_reference(source, role, Some(RemoteRef::Node(target)))
        .unwrap();
}

/// Remote ids of the module `M` scenario: models `A` and `B`, `B`'s root refers to `A`'s root.
pub struct TwoModelModule {
    pub module: RemoteNodeId,
    pub model_a: RemoteNodeId,
    pub model_b: RemoteNodeId,
    pub root_a: RemoteNodeId,
    pub root_b: RemoteNodeId,
    pub child_a: RemoteNodeId,
}

pub fn build_two_model_module(fixture: &Fixture) -> TwoModelModule {
    fixture.edit_remote(|write| {
        let module = add_module(write, "M");
        let model_a = add_model(write, module, "M.A");
        let model_b = add_model(write, module, "M.B");
        let root_a = add_root(write, model_a, "alpha", Some("a-root"));
        let child_a = add_entity(write, root_a, "members", "alpha.child", None);
        // B is written first in reference order: its target lives in another model
        let root_b = add_root(write, model_b, "beta", Some("b-root"));
        link(write, root_b, "target", root_a);
        write.set_property(root_b, "stereotype", Some("ignored")).unwrap();
        TwoModelModule {
            module,
            model_a,
            model_b,
            root_a,
            root_b,
            child_a,
        }
    })
}

pub fn model(id: &str) -> ModelId {
    ModelId::new(id)
}
