//! Zero-sized hash builder and the collection aliases built on it.
//!
//! Graph edges and subscription sets are keyed by small arena ids, so HashDoS
//! resistance buys nothing here. Every set is an `IndexSet` so iteration order
//! is insertion order, which keeps cascades and payloads deterministic.

use std::hash::BuildHasher;

use foldhash::fast::{FixedState, FoldHasher};
use indexmap::{IndexMap, IndexSet};

/// A zero-sized `BuildHasher` running foldhash with a fixed seed.
#[derive(Clone, Copy, Debug, Default)]
pub struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x9e37_79b9_7f4a_7c15).build_hasher()
    }
}

/// Insertion-ordered set using [`FastHashBuilder`].
pub type FastIndexSet<T> = IndexSet<T, FastHashBuilder>;

/// Insertion-ordered map using [`FastHashBuilder`].
pub type FastIndexMap<K, V> = IndexMap<K, V, FastHashBuilder>;

/// Empty [`FastIndexSet`].
pub fn new_index_set<T>() -> FastIndexSet<T> {
    IndexSet::with_hasher(FastHashBuilder)
}

/// Empty [`FastIndexMap`].
pub fn new_index_map<K, V>() -> FastIndexMap<K, V> {
    IndexMap::with_hasher(FastHashBuilder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_is_zero_sized_and_deterministic() {
        assert_eq!(std::mem::size_of::<FastHashBuilder>(), 0);
        assert_eq!(
            FastHashBuilder.hash_one("observer"),
            FastHashBuilder.hash_one("observer")
        );
    }

    #[test]
    fn index_set_keeps_insertion_order() {
        let mut set = new_index_set();
        set.insert(3u32);
        set.insert(1);
        set.insert(3);
        set.insert(2);
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![3, 1, 2]);
    }
}
