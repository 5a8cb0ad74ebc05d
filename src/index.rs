//! Table indexes and the bulk-operation index set.
//!
//! This module provides:
//! - [`IndexSpec`]: the scheme an index is built from (columns, uniqueness,
//!   ordering)
//! - [`TableIndex`]: one index over the heap, a tagged store per
//!   {unique, non-unique} × {ordered, hash} variant
//! - [`IndexSet`]: the ordered collection of a table's indexes, with one
//!   designated primary-key index, fronted by the bulk operations the table
//!   facade drives
//!
//! Indexes store [`SlotAddr`] handles keyed by the order-preserving encoding
//! in [`key`]. They never own tuple data: any operation that moves tuple
//! bytes must rewrite the affected entries through
//! [`IndexSet::rewrite_address_all`].

pub mod key;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use crate::heap::SlotAddr;
use crate::tuple::Tuple;

use key::IndexKey;

/// The scheme an index is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    /// Index name, unique within its table.
    pub name: String,
    /// Keyed column positions, in key order.
    pub columns: Vec<usize>,
    /// Whether two active tuples may share a key.
    pub unique: bool,
    /// Whether the index maintains key order (tree) or not (hash).
    pub ordered: bool,
}

impl IndexSpec {
    /// Creates a unique ordered index scheme.
    pub fn unique_ordered(name: &str, columns: Vec<usize>) -> Self {
        Self {
            name: name.to_string(),
            columns,
            unique: true,
            ordered: true,
        }
    }

    /// Creates a unique hash index scheme.
    pub fn unique_hash(name: &str, columns: Vec<usize>) -> Self {
        Self {
            name: name.to_string(),
            columns,
            unique: true,
            ordered: false,
        }
    }

    /// Creates a non-unique ordered index scheme.
    pub fn multi_ordered(name: &str, columns: Vec<usize>) -> Self {
        Self {
            name: name.to_string(),
            columns,
            unique: false,
            ordered: true,
        }
    }

    /// Creates a non-unique hash index scheme.
    pub fn multi_hash(name: &str, columns: Vec<usize>) -> Self {
        Self {
            name: name.to_string(),
            columns,
            unique: false,
            ordered: false,
        }
    }
}

/// Entry storage, tagged per index variant.
///
/// Non-unique variants keep their address sets ordered so scans and rewrites
/// are deterministic.
enum IndexStore {
    UniqueOrdered(BTreeMap<IndexKey, SlotAddr>),
    UniqueHash(HashMap<IndexKey, SlotAddr>),
    MultiOrdered(BTreeMap<IndexKey, BTreeSet<SlotAddr>>),
    MultiHash(HashMap<IndexKey, BTreeSet<SlotAddr>>),
}

/// One index over a table's heap.
pub struct TableIndex {
    spec: IndexSpec,
    store: IndexStore,
    entries: usize,
}

impl TableIndex {
    /// Builds an empty index from its scheme.
    pub fn build(spec: IndexSpec) -> Self {
        let store = match (spec.unique, spec.ordered) {
            (true, true) => IndexStore::UniqueOrdered(BTreeMap::new()),
            (true, false) => IndexStore::UniqueHash(HashMap::new()),
            (false, true) => IndexStore::MultiOrdered(BTreeMap::new()),
            (false, false) => IndexStore::MultiHash(HashMap::new()),
        };
        Self {
            spec,
            store,
            entries: 0,
        }
    }

    /// Returns the index scheme.
    pub fn spec(&self) -> &IndexSpec {
        &self.spec
    }

    /// Returns the index name.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries
    }

    /// Returns true if the index has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    fn key_of(&self, tuple: &Tuple) -> IndexKey {
        IndexKey::from_tuple(tuple, &self.spec.columns)
    }

    /// Adds an entry for the tuple at the given address.
    ///
    /// Returns false without mutating if a unique variant already holds the
    /// key under a different address.
    pub fn add_entry(&mut self, tuple: &Tuple, addr: SlotAddr) -> bool {
        let key = self.key_of(tuple);
        let inserted = match &mut self.store {
            IndexStore::UniqueOrdered(map) => match map.entry(key) {
                std::collections::btree_map::Entry::Vacant(e) => {
                    e.insert(addr);
                    true
                }
                std::collections::btree_map::Entry::Occupied(_) => false,
            },
            IndexStore::UniqueHash(map) => match map.entry(key) {
                std::collections::hash_map::Entry::Vacant(e) => {
                    e.insert(addr);
                    true
                }
                std::collections::hash_map::Entry::Occupied(_) => false,
            },
            IndexStore::MultiOrdered(map) => map.entry(key).or_default().insert(addr),
            IndexStore::MultiHash(map) => map.entry(key).or_default().insert(addr),
        };
        if inserted {
            self.entries += 1;
        }
        inserted
    }

    /// Removes the entry for the tuple at the given address.
    ///
    /// Returns false if no such entry exists; the caller decides whether
    /// that is corruption.
    pub fn delete_entry(&mut self, tuple: &Tuple, addr: SlotAddr) -> bool {
        let key = self.key_of(tuple);
        let removed = match &mut self.store {
            IndexStore::UniqueOrdered(map) => match map.get(&key).copied() {
                Some(stored) if stored == addr => {
                    map.remove(&key);
                    true
                }
                _ => false,
            },
            IndexStore::UniqueHash(map) => match map.get(&key).copied() {
                Some(stored) if stored == addr => {
                    map.remove(&key);
                    true
                }
                _ => false,
            },
            IndexStore::MultiOrdered(map) => {
                let mut removed = false;
                if let Some(set) = map.get_mut(&key) {
                    removed = set.remove(&addr);
                    if removed && set.is_empty() {
                        map.remove(&key);
                    }
                }
                removed
            }
            IndexStore::MultiHash(map) => {
                let mut removed = false;
                if let Some(set) = map.get_mut(&key) {
                    removed = set.remove(&addr);
                    if removed && set.is_empty() {
                        map.remove(&key);
                    }
                }
                removed
            }
        };
        if removed {
            self.entries -= 1;
        }
        removed
    }

    /// Moves the entry from the old tuple's key to the new tuple's key,
    /// keeping the same address.
    pub fn replace_entry(&mut self, old: &Tuple, new: &Tuple, addr: SlotAddr) -> bool {
        if !self.delete_entry(old, addr) {
            return false;
        }
        if !self.add_entry(new, addr) {
            // Put the old entry back so a failed replace leaves the index
            // unchanged.
            self.add_entry(old, addr);
            return false;
        }
        true
    }

    /// Repoints the entry for the tuple's key from `old_addr` to `new_addr`.
    pub fn set_new_address(&mut self, tuple: &Tuple, old_addr: SlotAddr, new_addr: SlotAddr) -> bool {
        let key = self.key_of(tuple);
        match &mut self.store {
            IndexStore::UniqueOrdered(map) => repoint_unique(map.get_mut(&key), old_addr, new_addr),
            IndexStore::UniqueHash(map) => repoint_unique(map.get_mut(&key), old_addr, new_addr),
            IndexStore::MultiOrdered(map) => {
                repoint_multi(map.get_mut(&key), old_addr, new_addr)
            }
            IndexStore::MultiHash(map) => repoint_multi(map.get_mut(&key), old_addr, new_addr),
        }
    }

    /// Returns true if any entry exists under the tuple's key.
    pub fn exists(&self, tuple: &Tuple) -> bool {
        let key = self.key_of(tuple);
        match &self.store {
            IndexStore::UniqueOrdered(map) => map.contains_key(&key),
            IndexStore::UniqueHash(map) => map.contains_key(&key),
            IndexStore::MultiOrdered(map) => map.contains_key(&key),
            IndexStore::MultiHash(map) => map.contains_key(&key),
        }
    }

    /// Returns the address stored under the probe tuple's key.
    ///
    /// Non-unique variants return the lowest address.
    pub fn get(&self, probe: &Tuple) -> Option<SlotAddr> {
        let key = self.key_of(probe);
        match &self.store {
            IndexStore::UniqueOrdered(map) => map.get(&key).copied(),
            IndexStore::UniqueHash(map) => map.get(&key).copied(),
            IndexStore::MultiOrdered(map) => {
                map.get(&key).and_then(|set| set.iter().next().copied())
            }
            IndexStore::MultiHash(map) => {
                map.get(&key).and_then(|set| set.iter().next().copied())
            }
        }
    }

    /// Returns true if the two tuples encode different keys for this index.
    pub fn key_changed(&self, old: &Tuple, new: &Tuple) -> bool {
        self.key_of(old) != self.key_of(new)
    }

    /// Suggested pre-sizing for an expected entry count.
    pub fn ensure_capacity(&mut self, n: usize) {
        match &mut self.store {
            IndexStore::UniqueHash(map) => map.reserve(n.saturating_sub(map.len())),
            IndexStore::MultiHash(map) => map.reserve(n.saturating_sub(map.len())),
            // Tree variants have nothing useful to pre-size.
            IndexStore::UniqueOrdered(_) | IndexStore::MultiOrdered(_) => {}
        }
    }

    /// Returns every stored address in key order.
    ///
    /// Hash variants sort their keys first; the content hash walk relies on
    /// a canonical order regardless of variant.
    pub fn addrs_in_key_order(&self) -> Vec<SlotAddr> {
        match &self.store {
            IndexStore::UniqueOrdered(map) => map.values().copied().collect(),
            IndexStore::MultiOrdered(map) => {
                map.values().flat_map(|set| set.iter().copied()).collect()
            }
            IndexStore::UniqueHash(map) => {
                let mut pairs: Vec<_> = map.iter().collect();
                pairs.sort_by(|a, b| a.0.cmp(b.0));
                pairs.into_iter().map(|(_, &addr)| addr).collect()
            }
            IndexStore::MultiHash(map) => {
                let mut pairs: Vec<_> = map.iter().collect();
                pairs.sort_by(|a, b| a.0.cmp(b.0));
                pairs
                    .into_iter()
                    .flat_map(|(_, set)| set.iter().copied())
                    .collect()
            }
        }
    }
}

fn repoint_unique(slot: Option<&mut SlotAddr>, old_addr: SlotAddr, new_addr: SlotAddr) -> bool {
    match slot {
        Some(stored) if *stored == old_addr => {
            *stored = new_addr;
            true
        }
        _ => false,
    }
}

fn repoint_multi(
    set: Option<&mut BTreeSet<SlotAddr>>,
    old_addr: SlotAddr,
    new_addr: SlotAddr,
) -> bool {
    match set {
        Some(set) => set.remove(&old_addr) && set.insert(new_addr),
        None => false,
    }
}

/// The ordered collection of one table's indexes.
///
/// Bulk operations iterate every index; the rollback loop inside
/// [`insert_all`](IndexSet::insert_all) walks indexes in the reverse of the
/// forward insertion order, so partially-inserted state unwinds
/// symmetrically.
#[derive(Default)]
pub struct IndexSet {
    indexes: Vec<TableIndex>,
    primary: Option<usize>,
}

impl IndexSet {
    /// Creates an empty index set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an index built from the scheme. At most one index may be
    /// designated primary, and it must be unique.
    ///
    /// # Panics
    ///
    /// Panics on a duplicate name, a second primary, or a non-unique
    /// primary.
    pub fn add(&mut self, spec: IndexSpec, primary: bool) {
        assert!(
            self.find(&spec.name).is_none(),
            "duplicate index name '{}'",
            spec.name
        );
        if primary {
            assert!(self.primary.is_none(), "table already has a primary index");
            assert!(spec.unique, "primary index '{}' must be unique", spec.name);
            self.primary = Some(self.indexes.len());
        }
        self.indexes.push(TableIndex::build(spec));
    }

    /// Returns the number of indexes.
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    /// Returns true if the table has no indexes.
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Returns the designated primary-key index, if any.
    pub fn primary(&self) -> Option<&TableIndex> {
        self.primary.map(|i| &self.indexes[i])
    }

    /// Iterates the indexes in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &TableIndex> {
        self.indexes.iter()
    }

    /// Returns the position of the named index.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.indexes.iter().position(|i| i.name() == name)
    }

    /// Returns the named index.
    pub fn get(&self, name: &str) -> Option<&TableIndex> {
        self.find(name).map(|i| &self.indexes[i])
    }

    /// Inserts an entry for the tuple into every index.
    ///
    /// On a unique violation, every entry inserted by this call is removed
    /// again, in reverse order, before the failing index's position is
    /// returned.
    pub fn insert_all(&mut self, tuple: &Tuple, addr: SlotAddr) -> Result<(), usize> {
        for i in 0..self.indexes.len() {
            if !self.indexes[i].add_entry(tuple, addr) {
                debug!(
                    index = self.indexes[i].name(),
                    %addr,
                    "unique violation, rolling back partial index inserts"
                );
                for j in (0..i).rev() {
                    self.indexes[j].delete_entry(tuple, addr);
                }
                return Err(i);
            }
        }
        Ok(())
    }

    /// Removes the tuple's entry from every index.
    ///
    /// # Panics
    ///
    /// A missing entry is index corruption and fatal.
    pub fn delete_all(&mut self, tuple: &Tuple, addr: SlotAddr) {
        for index in &mut self.indexes {
            assert!(
                index.delete_entry(tuple, addr),
                "failed to delete tuple {} from index '{}'",
                addr,
                index.name(),
            );
        }
    }

    /// Moves every index entry from the old tuple's key to the new tuple's
    /// key at the same address.
    ///
    /// # Panics
    ///
    /// Failure to replace is index corruption and fatal; callers gate key
    /// collisions through [`try_update_check`](Self::try_update_check)
    /// first.
    pub fn replace_all(&mut self, old: &Tuple, new: &Tuple, addr: SlotAddr) {
        for index in &mut self.indexes {
            assert!(
                index.replace_entry(old, new, addr),
                "failed to move index entry {} in '{}'",
                addr,
                index.name(),
            );
        }
    }

    /// For each unique index whose key would change from `old` to `new`,
    /// verifies the new key is absent. Returns false without mutating if any
    /// unique index would collide.
    pub fn try_update_check(&self, old: &Tuple, new: &Tuple) -> bool {
        for index in &self.indexes {
            if !index.spec().unique || !index.key_changed(old, new) {
                continue;
            }
            if index.exists(new) {
                debug!(
                    index = index.name(),
                    "unique index rejects key change"
                );
                return false;
            }
        }
        true
    }

    /// Repoints every index entry for the tuple's key at a new address
    /// (anti-cache eviction and merge).
    ///
    /// # Panics
    ///
    /// Failure to repoint is index corruption and fatal.
    pub fn rewrite_address_all(&mut self, tuple: &Tuple, old_addr: SlotAddr, new_addr: SlotAddr) {
        for index in &mut self.indexes {
            assert!(
                index.set_new_address(tuple, old_addr, new_addr),
                "failed to repoint index entry {} -> {} in '{}'",
                old_addr,
                new_addr,
                index.name(),
            );
        }
    }

    /// Suggested pre-sizing across every index.
    pub fn ensure_capacity(&mut self, n: usize) {
        for index in &mut self.indexes {
            index.ensure_capacity(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::Datum;

    fn row(id: i64, group: i64) -> Tuple {
        Tuple::new(vec![Datum::Int64(id), Datum::Int64(group)])
    }

    fn set() -> IndexSet {
        let mut s = IndexSet::new();
        s.add(IndexSpec::unique_ordered("pk", vec![0]), true);
        s.add(IndexSpec::multi_hash("by_group", vec![1]), false);
        s
    }

    #[test]
    fn test_add_and_lookup() {
        let mut idx = TableIndex::build(IndexSpec::unique_ordered("pk", vec![0]));
        let a = SlotAddr::new(0, 0);
        assert!(idx.add_entry(&row(1, 10), a));
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.get(&row(1, 99)), Some(a));
        assert!(idx.exists(&row(1, 0)));
        assert!(!idx.exists(&row(2, 0)));
    }

    #[test]
    fn test_unique_rejects_duplicate_key() {
        let mut idx = TableIndex::build(IndexSpec::unique_hash("pk", vec![0]));
        assert!(idx.add_entry(&row(1, 10), SlotAddr::new(0, 0)));
        assert!(!idx.add_entry(&row(1, 20), SlotAddr::new(0, 1)));
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.get(&row(1, 0)), Some(SlotAddr::new(0, 0)));
    }

    #[test]
    fn test_multi_allows_duplicate_key() {
        let mut idx = TableIndex::build(IndexSpec::multi_ordered("by_group", vec![1]));
        let a = SlotAddr::new(0, 0);
        let b = SlotAddr::new(0, 1);
        assert!(idx.add_entry(&row(1, 10), a));
        assert!(idx.add_entry(&row(2, 10), b));
        assert_eq!(idx.len(), 2);
        // Lowest address wins the point lookup.
        assert_eq!(idx.get(&row(0, 10)), Some(a));

        assert!(idx.delete_entry(&row(1, 10), a));
        assert_eq!(idx.get(&row(0, 10)), Some(b));
        assert!(idx.delete_entry(&row(2, 10), b));
        assert!(idx.is_empty());
        assert!(!idx.exists(&row(0, 10)));
    }

    #[test]
    fn test_delete_wrong_address_fails() {
        let mut idx = TableIndex::build(IndexSpec::unique_ordered("pk", vec![0]));
        idx.add_entry(&row(1, 10), SlotAddr::new(0, 0));
        assert!(!idx.delete_entry(&row(1, 10), SlotAddr::new(0, 9)));
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn test_replace_entry_failure_restores_old() {
        let mut idx = TableIndex::build(IndexSpec::unique_ordered("pk", vec![0]));
        let a = SlotAddr::new(0, 0);
        let b = SlotAddr::new(0, 1);
        idx.add_entry(&row(1, 10), a);
        idx.add_entry(&row(2, 10), b);

        // Moving key 1 onto occupied key 2 fails and leaves both entries.
        assert!(!idx.replace_entry(&row(1, 10), &row(2, 10), a));
        assert_eq!(idx.get(&row(1, 0)), Some(a));
        assert_eq!(idx.get(&row(2, 0)), Some(b));
    }

    #[test]
    fn test_set_new_address() {
        let mut idx = TableIndex::build(IndexSpec::unique_ordered("pk", vec![0]));
        let a = SlotAddr::new(0, 0);
        let s = SlotAddr::surrogate(0, 0);
        idx.add_entry(&row(1, 10), a);

        assert!(idx.set_new_address(&row(1, 10), a, s));
        assert_eq!(idx.get(&row(1, 0)), Some(s));
        // Stale old address no longer matches.
        assert!(!idx.set_new_address(&row(1, 10), a, SlotAddr::new(0, 5)));
    }

    #[test]
    fn test_insert_all_rolls_back_on_violation() {
        // Non-unique index registered ahead of the primary, so a primary
        // violation leaves a partial insert to unwind.
        let mut s = IndexSet::new();
        s.add(IndexSpec::multi_hash("by_group", vec![1]), false);
        s.add(IndexSpec::unique_ordered("pk", vec![0]), true);

        let a = SlotAddr::new(0, 0);
        let b = SlotAddr::new(0, 1);
        s.insert_all(&row(1, 10), a).unwrap();

        let failing = s.insert_all(&row(1, 10), b).unwrap_err();
        assert_eq!(failing, 1);
        assert_eq!(s.get("pk").unwrap().len(), 1);
        assert_eq!(s.get("by_group").unwrap().len(), 1);
        assert_eq!(s.get("by_group").unwrap().get(&row(0, 10)), Some(a));
    }

    #[test]
    fn test_try_update_check() {
        let mut s = set();
        s.insert_all(&row(1, 10), SlotAddr::new(0, 0)).unwrap();
        s.insert_all(&row(2, 20), SlotAddr::new(0, 1)).unwrap();

        // Key unchanged: fine even though it exists.
        assert!(s.try_update_check(&row(1, 10), &row(1, 99)));
        // Key changes to a free value: fine.
        assert!(s.try_update_check(&row(1, 10), &row(3, 10)));
        // Key changes onto an occupied value: rejected.
        assert!(!s.try_update_check(&row(1, 10), &row(2, 10)));
    }

    #[test]
    fn test_replace_all_and_delete_all() {
        let mut s = set();
        let a = SlotAddr::new(0, 0);
        s.insert_all(&row(1, 10), a).unwrap();

        s.replace_all(&row(1, 10), &row(5, 30), a);
        assert_eq!(s.get("pk").unwrap().get(&row(5, 0)), Some(a));
        assert!(!s.get("pk").unwrap().exists(&row(1, 0)));

        s.delete_all(&row(5, 30), a);
        assert!(s.get("pk").unwrap().is_empty());
        assert!(s.get("by_group").unwrap().is_empty());
    }

    #[test]
    #[should_panic(expected = "failed to delete tuple")]
    fn test_delete_all_missing_entry_is_fatal() {
        let mut s = set();
        s.delete_all(&row(1, 10), SlotAddr::new(0, 0));
    }

    #[test]
    fn test_addrs_in_key_order_hash_variant() {
        let mut idx = TableIndex::build(IndexSpec::unique_hash("pk", vec![0]));
        for (i, id) in [30i64, 10, 20].iter().enumerate() {
            idx.add_entry(&row(*id, 0), SlotAddr::new(0, i as u32));
        }
        let addrs = idx.addrs_in_key_order();
        assert_eq!(
            addrs,
            vec![SlotAddr::new(0, 1), SlotAddr::new(0, 2), SlotAddr::new(0, 0)]
        );
    }

    #[test]
    #[should_panic(expected = "must be unique")]
    fn test_non_unique_primary_rejected() {
        let mut s = IndexSet::new();
        s.add(IndexSpec::multi_ordered("pk", vec![0]), true);
    }
}
