//! Difference between two revisions of a remote tree.

use super::remote::{RemoteRead, TreeDiffVisitor};
use crate::error::StoreError;
use crate::types::RemoteNodeId;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Deliver the changes from `old` to `new` to `visitor`.
///
/// Order: additions (parents before children), then containment, property, reference and
/// children changes of surviving nodes, then removals (parents before children).
pub fn diff_trees<A, B>(old: &A, new: &B, visitor: &dyn TreeDiffVisitor) -> Result<(), StoreError>
where
    A: RemoteRead + ?Sized,
    B: RemoteRead + ?Sized,
{
    let old_ids = old.subtree(old.root())?;
    let new_ids = new.subtree(new.root())?;
    let old_set: HashSet<RemoteNodeId> = old_ids.iter().copied().collect();
    let new_set: HashSet<RemoteNodeId> = new_ids.iter().copied().collect();

    for id in new_ids.iter().filter(|id| !old_set.contains(id)) {
        visitor.node_added(*id);
    }

    for id in new_ids.iter().copied().filter(|id| old_set.contains(id)) {
        if old.parent(id)? != new.parent(id)? || old.role_in_parent(id)? != new.role_in_parent(id)?
        {
            visitor.containment_changed(id);
        }

        let old_properties: BTreeMap<String, String> = old.properties(id)?.into_iter().collect();
        let new_properties: BTreeMap<String, String> = new.properties(id)?.into_iter().collect();
        for role in changed_keys(&old_properties, &new_properties) {
            visitor.property_changed(id, &role);
        }

        let old_references: BTreeMap<_, _> = old.references(id)?.into_iter().collect();
        let new_references: BTreeMap<_, _> = new.references(id)?.into_iter().collect();
        for role in changed_keys(&old_references, &new_references) {
            visitor.reference_changed(id, &role);
        }

        let old_children = group_by_role(old.all_children(id)?);
        let new_children = group_by_role(new.all_children(id)?);
        for role in changed_keys(&old_children, &new_children) {
            visitor.children_changed(id, &role);
        }
    }

    for id in old_ids.iter().filter(|id| !new_set.contains(id)) {
        visitor.node_removed(*id);
    }
    Ok(())
}

fn changed_keys<V: PartialEq>(old: &BTreeMap<String, V>, new: &BTreeMap<String, V>) -> Vec<String> {
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    keys.into_iter()
        .filter(|key| old.get(*key) != new.get(*key))
        .cloned()
        .collect()
}

fn group_by_role(children: Vec<(String, RemoteNodeId)>) -> BTreeMap<String, Vec<RemoteNodeId>> {
    let mut grouped: BTreeMap<String, Vec<RemoteNodeId>> = BTreeMap::new();
    for (role, child) in children {
        grouped.entry(role).or_default().push(child);
    }
    grouped
}
