//! Invariants of the identity map under arbitrary operation sequences

use proptest::prelude::*;
use std::collections::HashMap;
use treesync::types::{LocalNodeId, ModelId, ModuleId, RemoteNodeId};
use treesync::IdentityMap;

#[derive(Debug, Clone)]
enum Op {
    PutNode { local: u8, model: u8, remote: u8 },
    RemoveNode { local: u8 },
    RemoveModel { model: u8 },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..16, 0u8..3, 0u8..24)
            .prop_map(|(local, model, remote)| Op::PutNode { local, model, remote }),
        1 => (0u8..16).prop_map(|local| Op::RemoveNode { local }),
        1 => (0u8..3).prop_map(|model| Op::RemoveModel { model }),
    ]
}

fn node(i: u8) -> LocalNodeId {
    LocalNodeId::new(format!("n{i}"))
}

fn model(i: u8) -> ModelId {
    ModelId::new(format!("m{i}"))
}

/// Model remote ids live above the node range.
fn model_remote(i: u8) -> RemoteNodeId {
    RemoteNodeId::new(1_000 + u64::from(i))
}

fn populated_map() -> IdentityMap {
    let map = IdentityMap::new();
    let module = ModuleId::new("mod");
    map.put_module(module.clone(), RemoteNodeId::new(999)).unwrap();
    for i in 0..3 {
        map.put_model(model(i), &module, model_remote(i)).unwrap();
    }
    map
}

proptest! {
    #[test]
    fn mapping_stays_injective(ops in prop::collection::vec(op(), 0..64)) {
        let map = populated_map();
        // (local -> (remote, model)) as accepted by the map
        let mut expected: HashMap<u8, (u8, u8)> = HashMap::new();

        for op in ops {
            match op {
                Op::PutNode { local, model: m, remote } => {
                    let taken = expected.values().any(|(r, _)| *r == remote);
                    let accepted = match expected.get(&local) {
                        Some((r, owner)) => *r == remote && *owner == m,
                        None => !taken,
                    };
                    let result = map.put_node(node(local), &model(m), RemoteNodeId::new(u64::from(remote)));
                    if accepted {
                        prop_assert!(result.is_ok());
                        expected.insert(local, (remote, m));
                    } else if expected.get(&local).map(|(r, _)| *r) != Some(remote) {
                        prop_assert!(result.is_err());
                    }
                }
                Op::RemoveNode { local } => {
                    let removed = map.remove_node(&node(local));
                    prop_assert_eq!(
                        removed,
                        expected.remove(&local).map(|(r, _)| RemoteNodeId::new(u64::from(r)))
                    );
                }
                Op::RemoveModel { model: m } => {
                    map.remove_model(&model(m));
                    expected.retain(|_, (_, owner)| *owner != m);
                    // keep the model mapped for later puts
                    map.put_model(model(m), &ModuleId::new("mod"), model_remote(m)).unwrap();
                }
            }
            prop_assert!(map.is_consistent());
        }

        for (local, (remote, _)) in &expected {
            let remote = RemoteNodeId::new(u64::from(*remote));
            prop_assert_eq!(map.get_remote(&node(*local)), Some(remote));
            prop_assert_eq!(map.get_local(remote), Some(node(*local)));
        }
    }

    #[test]
    fn serialized_map_restores_identically(
        entries in prop::collection::hash_map(0u8..32, (0u8..64, 0u8..3), 0..32)
    ) {
        let map = populated_map();
        let mut used = std::collections::HashSet::new();
        for (local, (remote, m)) in &entries {
            if used.insert(*remote) {
                map.put_node(node(*local), &model(*m), RemoteNodeId::new(u64::from(*remote))).unwrap();
            }
        }

        let restored = IdentityMap::new();
        restored.deserialize(&map.serialize().unwrap()).unwrap();

        prop_assert_eq!(restored.len(), map.len());
        prop_assert!(restored.is_consistent());
        prop_assert_eq!(restored.snapshot(), map.snapshot());
        for local in entries.keys() {
            prop_assert_eq!(restored.get_remote(&node(*local)), map.get_remote(&node(*local)));
            prop_assert_eq!(restored.model_of_node(&node(*local)), map.model_of_node(&node(*local)));
        }
    }
}
