//! Replicated Maps
//!
//! Authority-owned key/value tables mirrored to every participant.
//!
//! The role is a type parameter:
//! - [`Owner`] tables are written by the authority and record every write as
//!   a [`MapOp`] until the node flushes them into a broadcast.
//! - [`Mirror`] tables have no write API; only the participant dispatch can
//!   feed them ops received from the authority.
//!
//! Uses BTreeMap so snapshots and iteration come out in key order.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use serde::{Serialize, Deserialize};

/// Marker for the side that may write a table.
pub trait ReplicaRole {}

/// Authority-side role: writable, records changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Owner;

/// Participant-side role: read-only cache fed by replication.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mirror;

impl ReplicaRole for Owner {}
impl ReplicaRole for Mirror {}

/// One replicated change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapOp<K, V> {
    /// Insert or overwrite an entry.
    Set(K, V),
    /// Remove an entry.
    Remove(K),
    /// Remove every entry.
    Clear,
}

/// A replicated key/value table.
#[derive(Debug, Clone)]
pub struct ReplicatedMap<K, V, R: ReplicaRole = Owner> {
    entries: BTreeMap<K, V>,
    changes: Vec<MapOp<K, V>>,
    _role: PhantomData<R>,
}

impl<K: Ord + Clone, V: Clone, R: ReplicaRole> Default for ReplicatedMap<K, V, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V: Clone, R: ReplicaRole> ReplicatedMap<K, V, R> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            changes: Vec::new(),
            _role: PhantomData,
        }
    }

    /// Look up an entry.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Ord + Clone, V: Clone> ReplicatedMap<K, V, Owner> {
    /// Insert or overwrite an entry.
    pub fn insert(&mut self, key: K, value: V) {
        self.entries.insert(key.clone(), value.clone());
        self.changes.push(MapOp::Set(key, value));
    }

    /// Remove an entry. Returns the old value if present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let old = self.entries.remove(key);
        if old.is_some() {
            self.changes.push(MapOp::Remove(key.clone()));
        }
        old
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        // Anything queued before a clear is moot
        self.changes.clear();
        self.changes.push(MapOp::Clear);
    }

    /// Take the changes recorded since the last drain.
    pub fn drain_changes(&mut self) -> Vec<MapOp<K, V>> {
        std::mem::take(&mut self.changes)
    }

    /// Full state as ops, for a participant that just connected.
    pub fn snapshot(&self) -> Vec<MapOp<K, V>> {
        let mut ops = Vec::with_capacity(self.entries.len() + 1);
        ops.push(MapOp::Clear);
        ops.extend(self.entries.iter().map(|(k, v)| MapOp::Set(k.clone(), v.clone())));
        ops
    }
}

impl<K: Ord + Clone, V: Clone> ReplicatedMap<K, V, Mirror> {
    /// Apply one op received from the authority.
    pub(crate) fn apply(&mut self, op: MapOp<K, V>) {
        match op {
            MapOp::Set(k, v) => {
                self.entries.insert(k, v);
            }
            MapOp::Remove(k) => {
                self.entries.remove(&k);
            }
            MapOp::Clear => self.entries.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_records_changes() {
        let mut map: ReplicatedMap<u32, String> = ReplicatedMap::new();
        map.insert(1, "a".to_string());
        map.insert(2, "b".to_string());
        map.remove(&1);

        assert_eq!(map.len(), 1);
        assert_eq!(
            map.drain_changes(),
            vec![
                MapOp::Set(1, "a".to_string()),
                MapOp::Set(2, "b".to_string()),
                MapOp::Remove(1),
            ]
        );
        assert!(map.drain_changes().is_empty());
    }

    #[test]
    fn test_remove_missing_records_nothing() {
        let mut map: ReplicatedMap<u32, u32> = ReplicatedMap::new();
        assert!(map.remove(&9).is_none());
        assert!(map.drain_changes().is_empty());
    }

    #[test]
    fn test_clear_supersedes_queued_changes() {
        let mut map: ReplicatedMap<u32, u32> = ReplicatedMap::new();
        map.insert(1, 10);
        map.clear();
        map.insert(2, 20);

        assert_eq!(map.drain_changes(), vec![MapOp::Clear, MapOp::Set(2, 20)]);
    }

    #[test]
    fn test_mirror_converges() {
        let mut owner: ReplicatedMap<u32, u32> = ReplicatedMap::new();
        let mut mirror: ReplicatedMap<u32, u32, Mirror> = ReplicatedMap::new();

        owner.insert(1, 10);
        owner.insert(2, 20);
        owner.insert(1, 11);
        owner.remove(&2);
        owner.insert(3, 30);

        for op in owner.drain_changes() {
            mirror.apply(op);
        }

        let owned: Vec<_> = owner.iter().collect();
        let mirrored: Vec<_> = mirror.iter().collect();
        assert_eq!(owned, mirrored);
    }

    #[test]
    fn test_snapshot_resets_stale_mirror() {
        let mut owner: ReplicatedMap<u32, u32> = ReplicatedMap::new();
        owner.insert(1, 10);

        let mut mirror: ReplicatedMap<u32, u32, Mirror> = ReplicatedMap::new();
        mirror.apply(MapOp::Set(99, 99));

        for op in owner.snapshot() {
            mirror.apply(op);
        }

        assert_eq!(mirror.len(), 1);
        assert_eq!(mirror.get(&1), Some(&10));
        assert_eq!(mirror.get(&99), None);
    }
}
