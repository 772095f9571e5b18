//! In-memory overlay of count deltas accumulated since the snapshot watermark.

use crate::types::{CountsKey, KeyPrefix};
use std::collections::btree_map;
use std::collections::BTreeMap;

/// Mapping from key to delta, iterated in key order.
///
/// Keys whose delta returns to zero are removed, so `len` counts keys with an
/// effective change.
#[derive(Clone, Debug, Default)]
pub struct DiffLayer {
    deltas: BTreeMap<CountsKey, i64>,
}

impl DiffLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delta for a key, 0 if absent.
    pub fn get(&self, key: &CountsKey) -> i64 {
        self.deltas.get(key).copied().unwrap_or(0)
    }

    /// Add `delta` to the key's accumulated value.
    pub fn apply_delta(&mut self, key: CountsKey, delta: i64) {
        if delta == 0 {
            return;
        }
        match self.deltas.entry(key) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(delta);
            }
            btree_map::Entry::Occupied(mut slot) => {
                let value = slot.get_mut();
                *value = value.wrapping_add(delta);
                if *value == 0 {
                    slot.remove();
                }
            }
        }
    }

    /// Fold every delta of `other` into this layer.
    pub fn absorb(&mut self, other: &DiffLayer) {
        for (key, delta) in other.iter() {
            self.apply_delta(key, delta);
        }
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// All deltas in key order.
    pub fn iter(&self) -> impl Iterator<Item = (CountsKey, i64)> + '_ {
        self.deltas.iter().map(|(k, v)| (*k, *v))
    }

    /// Deltas under a prefix, in key order.
    pub fn range(&self, prefix: KeyPrefix) -> impl Iterator<Item = (CountsKey, i64)> + '_ {
        self.deltas
            .iter()
            .skip_while(move |(k, _)| prefix.locate(k) == std::cmp::Ordering::Less)
            .take_while(move |(k, _)| prefix.matches(k))
            .map(|(k, v)| (*k, *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ANY_LABEL;

    #[test]
    fn test_apply_and_get() {
        let mut diff = DiffLayer::new();
        assert_eq!(diff.get(&CountsKey::node(1)), 0);

        diff.apply_delta(CountsKey::node(1), 3);
        diff.apply_delta(CountsKey::node(1), 2);
        diff.apply_delta(CountsKey::node(2), -1);

        assert_eq!(diff.get(&CountsKey::node(1)), 5);
        assert_eq!(diff.get(&CountsKey::node(2)), -1);
        assert_eq!(diff.len(), 2);
    }

    #[test]
    fn test_cancelling_deltas_remove_key() {
        let mut diff = DiffLayer::new();
        diff.apply_delta(CountsKey::node(1), 4);
        diff.apply_delta(CountsKey::node(1), -4);
        diff.apply_delta(CountsKey::node(2), 0);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_iteration_follows_key_order() {
        let mut diff = DiffLayer::new();
        diff.apply_delta(CountsKey::relationship(1, 2, ANY_LABEL), 1);
        diff.apply_delta(CountsKey::node(9), 1);
        diff.apply_delta(CountsKey::relationship(0, 1, 0), 1);
        diff.apply_delta(CountsKey::all_nodes(), 1);

        let keys: Vec<_> = diff.iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            vec![
                CountsKey::all_nodes(),
                CountsKey::node(9),
                CountsKey::relationship(0, 1, 0),
                CountsKey::relationship(1, 2, ANY_LABEL),
            ]
        );

        let type2: Vec<_> = diff.range(KeyPrefix::RelationshipType(2)).collect();
        assert_eq!(type2, vec![(CountsKey::relationship(1, 2, ANY_LABEL), 1)]);
        assert_eq!(diff.range(KeyPrefix::Nodes).count(), 2);
    }

    #[test]
    fn test_absorb() {
        let mut a = DiffLayer::new();
        a.apply_delta(CountsKey::node(1), 2);
        let mut b = DiffLayer::new();
        b.apply_delta(CountsKey::node(1), -2);
        b.apply_delta(CountsKey::node(3), 7);

        a.absorb(&b);
        assert_eq!(a.get(&CountsKey::node(1)), 0);
        assert_eq!(a.get(&CountsKey::node(3)), 7);
        assert_eq!(a.len(), 1);
    }
}
