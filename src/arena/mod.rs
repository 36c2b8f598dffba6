// Generational arenas for reactive node metadata
//
// Each Runtime owns two arenas:
// - Observer arena: ObserverNode (value, previous value, graph edges, subscriptions)
// - Container arena: ContainerNode (readiness, subscribers, selectors)
//
// Ids are (slab index, generation) pairs. Slab slots are reused after removal,
// so the generation is what keeps a stale id from resolving to a newer node.

pub mod container_arena;
pub mod observer_arena;

pub use container_arena::ContainerId;
pub use observer_arena::ObserverId;

use slab::Slab;

/// Index into an [`Arena`], valid only for the generation it was issued with.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
pub struct NodeIndex {
    index: u32,
    generation: u32,
}

impl NodeIndex {
    /// Slab slot.
    pub fn index(self) -> usize {
        self.index as usize
    }

    /// Generation the slot had when this index was issued.
    #[cfg(test)]
    pub(crate) fn generation(self) -> u32 {
        self.generation
    }
}

struct Slot<T> {
    generation: u32,
    value: T,
}

/// Slab storage whose indices go stale once their slot is removed.
pub struct Arena<T> {
    slots: Slab<Slot<T>>,
    generation: u32,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Empty arena.
    pub const fn new() -> Self {
        Self {
            slots: Slab::new(),
            generation: 0,
        }
    }

    /// Insert a value and return its index.
    pub fn insert(&mut self, value: T) -> NodeIndex {
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let entry = self.slots.vacant_entry();
        let index = entry.key() as u32;
        entry.insert(Slot { generation, value });
        NodeIndex { index, generation }
    }

    /// Borrow the value, `None` if the index is stale.
    pub fn get(&self, index: NodeIndex) -> Option<&T> {
        self.slots
            .get(index.index())
            .filter(|slot| slot.generation == index.generation)
            .map(|slot| &slot.value)
    }

    /// Mutably borrow the value, `None` if the index is stale.
    pub fn get_mut(&mut self, index: NodeIndex) -> Option<&mut T> {
        self.slots
            .get_mut(index.index())
            .filter(|slot| slot.generation == index.generation)
            .map(|slot| &mut slot.value)
    }

    /// Whether the index still resolves.
    pub fn contains(&self, index: NodeIndex) -> bool {
        self.get(index).is_some()
    }

    /// Remove the value. Stale indices return `None` and leave the slot alone.
    pub fn remove(&mut self, index: NodeIndex) -> Option<T> {
        if !self.contains(index) {
            return None;
        }
        Some(self.slots.remove(index.index()).value)
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the arena holds no values.
    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate live values with their indices.
    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = (NodeIndex, &T)> {
        self.slots.iter().map(|(index, slot)| {
            (
                NodeIndex {
                    index: index as u32,
                    generation: slot.generation,
                },
                &slot.value,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_index_does_not_alias_reused_slot() {
        let mut arena = Arena::new();
        let first = arena.insert("first");
        assert_eq!(arena.remove(first), Some("first"));

        let second = arena.insert("second");
        assert_eq!(first.index(), second.index());
        assert_ne!(first.generation(), second.generation());

        assert_eq!(arena.get(first), None);
        assert_eq!(arena.remove(first), None);
        assert_eq!(arena.get(second), Some(&"second"));
        assert_eq!(arena.len(), 1);
    }
}
