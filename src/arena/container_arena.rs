// Container arena - storage for subscription container metadata
//
// A ContainerNode is the runtime-side state of one external consumer:
// readiness, the observers it listens to, optional selectors per observer,
// and the observers that changed since the last dispatch.

use super::{Arena, NodeIndex, ObserverId};
use crate::hash::{FastIndexMap, FastIndexSet, new_index_map, new_index_set};
use crate::subscription::{ContainerKind, Selector};

/// Unique identifier for a subscription container in a runtime's arena.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
pub struct ContainerId(pub(crate) NodeIndex);

/// Metadata for a subscription container stored in the arena.
pub struct ContainerNode {
    pub(crate) key: String,
    pub(crate) component_id: Option<String>,
    pub(crate) kind: ContainerKind,
    pub(crate) ready: bool,
    pub(crate) subscribers: FastIndexSet<ObserverId>,
    /// Payload key per observer for keyed (object based) subscriptions.
    pub(crate) subscriber_keys: FastIndexMap<ObserverId, String>,
    pub(crate) selectors: FastIndexMap<ObserverId, Vec<Selector>>,
    /// Cleared after every dispatch.
    pub(crate) updated_subscribers: FastIndexSet<ObserverId>,
}

impl ContainerNode {
    pub(crate) fn new(key: String, kind: ContainerKind, ready: bool) -> Self {
        Self {
            key,
            component_id: None,
            kind,
            ready,
            subscribers: new_index_set(),
            subscriber_keys: new_index_map(),
            selectors: new_index_map(),
            updated_subscribers: new_index_set(),
        }
    }

    /// Whether the subscription was declared with payload keys.
    pub fn is_object_based(&self) -> bool {
        !self.subscriber_keys.is_empty()
    }
}

pub(crate) type ContainerArena = Arena<ContainerNode>;

pub(crate) fn insert_container(arena: &mut ContainerArena, node: ContainerNode) -> ContainerId {
    ContainerId(arena.insert(node))
}
