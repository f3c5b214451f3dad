//! Right-biased map merging for labels, annotations, node selectors and
//! resource lists

use std::collections::BTreeMap;

/// Merge maps in order; a key in a later map replaces the same key from an
/// earlier one. `None` entries are skipped. Inputs are never mutated.
pub fn merge_maps<'a, K, V, I>(maps: I) -> BTreeMap<K, V>
where
    I: IntoIterator<Item = Option<&'a BTreeMap<K, V>>>,
    K: Ord + Clone + 'a,
    V: Clone + 'a,
{
    let mut merged = BTreeMap::new();
    for map in maps.into_iter().flatten() {
        for (key, value) in map {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Like [`merge_maps`] but yields `None` when the result is empty, matching
/// the optional map fields of the Kubernetes API types.
pub fn merge_optional<'a, K, V, I>(maps: I) -> Option<BTreeMap<K, V>>
where
    I: IntoIterator<Item = Option<&'a BTreeMap<K, V>>>,
    K: Ord + Clone + 'a,
    V: Clone + 'a,
{
    let merged = merge_maps(maps);
    (!merged.is_empty()).then_some(merged)
}
