// Observer arena - storage for observer metadata
//
// An ObserverNode holds the committed value of one reactive node plus its
// edges:
// - dependents: observers re-ingested after this one performs
// - dependencies: inverse of dependents, rebuilt by computed re-evaluation
// - subscribed_to: containers notified when this observer rerenders
//
// Edges are plain ids. Nothing here owns another node, so an edge can be
// dropped from either side without touching the node on the other end.

use std::sync::Weak;

use super::{Arena, ContainerId, NodeIndex};
use crate::hash::{FastIndexSet, new_index_set};
use crate::observer::ObserverHandler;
use crate::value::ObservedValue;

/// Unique identifier for an observer node in a runtime's arena.
///
/// When the owning [`Observer`](crate::Observer) is dropped its node is
/// removed and every copy of this id goes stale.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
pub struct ObserverId(pub(crate) NodeIndex);

/// Metadata for an observer stored in the arena.
pub struct ObserverNode {
    pub(crate) key: Option<String>,
    pub(crate) value: Option<ObservedValue>,
    pub(crate) previous_value: Option<ObservedValue>,
    pub(crate) dependents: FastIndexSet<ObserverId>,
    pub(crate) dependencies: FastIndexSet<ObserverId>,
    pub(crate) subscribed_to: FastIndexSet<ContainerId>,
    /// The State/Computed that owns this node. Weak, since the owner holds the node.
    pub(crate) handler: Option<Weak<dyn ObserverHandler>>,
}

impl ObserverNode {
    /// Node with an optional key and initial value, no edges.
    pub fn new(key: Option<String>, value: Option<ObservedValue>) -> Self {
        Self {
            key,
            previous_value: value.clone(),
            value,
            dependents: new_index_set(),
            dependencies: new_index_set(),
            subscribed_to: new_index_set(),
            handler: None,
        }
    }
}

pub(crate) type ObserverArena = Arena<ObserverNode>;

pub(crate) fn insert_observer(arena: &mut ObserverArena, node: ObserverNode) -> ObserverId {
    ObserverId(arena.insert(node))
}

/// Add `dependency -> dependent`, keeping both sides in sync.
///
/// Returns false when either id is stale or the edge already exists.
pub(crate) fn link(
    arena: &mut ObserverArena,
    dependency: ObserverId,
    dependent: ObserverId,
) -> bool {
    if !arena.contains(dependency.0) || !arena.contains(dependent.0) {
        return false;
    }
    let added = arena
        .get_mut(dependency.0)
        .is_some_and(|node| node.dependents.insert(dependent));
    if let Some(node) = arena.get_mut(dependent.0) {
        node.dependencies.insert(dependency);
    }
    added
}

/// Remove `dependency -> dependent` from both sides.
///
/// Either side may already be gone; whatever is left is cleaned up.
pub(crate) fn unlink(
    arena: &mut ObserverArena,
    dependency: ObserverId,
    dependent: ObserverId,
) -> bool {
    let removed = arena
        .get_mut(dependency.0)
        .is_some_and(|node| node.dependents.shift_remove(&dependent));
    if let Some(node) = arena.get_mut(dependent.0) {
        node.dependencies.shift_remove(&dependency);
    }
    removed
}

/// Remove a node and every graph edge pointing at it.
///
/// Container subscriptions are left to the caller, which holds the container arena.
pub(crate) fn remove_observer(arena: &mut ObserverArena, id: ObserverId) -> Option<ObserverNode> {
    let node = arena.remove(id.0)?;
    for dependency in &node.dependencies {
        if let Some(other) = arena.get_mut(dependency.0) {
            other.dependents.shift_remove(&id);
        }
    }
    for dependent in &node.dependents {
        if let Some(other) = arena.get_mut(dependent.0) {
            other.dependencies.shift_remove(&id);
        }
    }
    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symmetric(arena: &ObserverArena) -> bool {
        arena.iter().all(|(index, node)| {
            let id = ObserverId(index);
            node.dependents.iter().all(|dependent| {
                arena
                    .get(dependent.0)
                    .is_some_and(|other| other.dependencies.contains(&id))
            }) && node.dependencies.iter().all(|dependency| {
                arena
                    .get(dependency.0)
                    .is_some_and(|other| other.dependents.contains(&id))
            })
        })
    }

    #[test]
    fn link_is_symmetric_and_idempotent() {
        let mut arena = ObserverArena::new();
        let a = insert_observer(&mut arena, ObserverNode::new(None, None));
        let b = insert_observer(&mut arena, ObserverNode::new(None, None));

        assert!(link(&mut arena, a, b));
        assert!(!link(&mut arena, a, b));
        assert!(symmetric(&arena));

        assert!(unlink(&mut arena, a, b));
        assert!(!unlink(&mut arena, a, b));
        assert!(arena.get(a.0).unwrap().dependents.is_empty());
        assert!(arena.get(b.0).unwrap().dependencies.is_empty());
    }

    #[test]
    fn removing_a_node_severs_both_directions() {
        let mut arena = ObserverArena::new();
        let a = insert_observer(&mut arena, ObserverNode::new(None, None));
        let b = insert_observer(&mut arena, ObserverNode::new(None, None));
        let c = insert_observer(&mut arena, ObserverNode::new(None, None));
        link(&mut arena, a, b);
        link(&mut arena, b, c);

        assert!(remove_observer(&mut arena, b).is_some());
        assert!(arena.get(a.0).unwrap().dependents.is_empty());
        assert!(arena.get(c.0).unwrap().dependencies.is_empty());
        assert!(symmetric(&arena));
        assert!(!link(&mut arena, a, b));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Link(usize, usize),
            Unlink(usize, usize),
            Remove(usize),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                4 => (0..6usize, 0..6usize).prop_map(|(a, b)| Op::Link(a, b)),
                3 => (0..6usize, 0..6usize).prop_map(|(a, b)| Op::Unlink(a, b)),
                1 => (0..6usize).prop_map(Op::Remove),
            ]
        }

        proptest! {
            #[test]
            fn edges_stay_symmetric(ops in proptest::collection::vec(op(), 0..64)) {
                let mut arena = ObserverArena::new();
                let ids: Vec<_> = (0..6)
                    .map(|_| insert_observer(&mut arena, ObserverNode::new(None, None)))
                    .collect();

                for op in ops {
                    match op {
                        Op::Link(a, b) => { link(&mut arena, ids[a], ids[b]); }
                        Op::Unlink(a, b) => { unlink(&mut arena, ids[a], ids[b]); }
                        Op::Remove(a) => { remove_observer(&mut arena, ids[a]); }
                    }
                    prop_assert!(symmetric(&arena));
                }
            }
        }
    }
}
