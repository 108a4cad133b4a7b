// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded map with least-recently-used eviction
//!
//! This contains a very simple implementation of a capacity-bounded map,
//! with keys of type `K` and values of type `V`. When an insert would exceed
//! the capacity, the entry that was touched least recently is evicted.
//! Lookups through [`LruMap::get`] count as touches; [`LruMap::peek`] does
//! not.
//!
//! # Design goals
//!
//! 1. Predictable worst-case memory: the map never holds more than
//!    `capacity` entries.
//! 2. Pinning: individual entries can be marked as not evictable, for
//!    records that are authoritative rather than cached. Pinned entries
//!    still count against capacity; an insert into a map whose entries are
//!    all pinned will panic rather than silently grow.
//! 3. Code clarity -- recency is a plain queue of keys, no intrusive lists.
//!
//! Non-goals: O(1) recency updates. The recency queue is scanned linearly,
//! which is fine at the small capacities this is used for (default 128).

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    pinned: bool,
}

/// A capacity-bounded LRU map.
#[derive(Debug)]
pub struct LruMap<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Keys in recency order: front is least recently used.
    recency: VecDeque<K>,
    capacity: usize,
}

impl<K: Copy + Eq + Hash, V> LruMap<K, V> {
    /// Creates an empty map bounded to `capacity` entries.
    ///
    /// A zero capacity is nonsense and will panic.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            entries: HashMap::new(),
            recency: VecDeque::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: K) -> bool {
        self.entries.contains_key(&key)
    }

    /// Inserts `value` for `key`, touching the entry. If the map is at
    /// capacity, the least recently used unpinned entry is evicted first.
    ///
    /// Returns the evicted `(key, value)` pair, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        self.insert_inner(key, value, false)
    }

    /// Like [`LruMap::insert`], but the entry is pinned: it will never be
    /// chosen for eviction until [`LruMap::unpin`] or removal.
    pub fn insert_pinned(&mut self, key: K, value: V) -> Option<(K, V)> {
        self.insert_inner(key, value, true)
    }

    fn insert_inner(&mut self, key: K, value: V, pinned: bool) -> Option<(K, V)> {
        let mut evicted = None;
        if !self.entries.contains_key(&key) && self.entries.len() == self.capacity
        {
            let victim = self
                .recency
                .iter()
                .copied()
                .find(|k| !self.entries[k].pinned);
            // All-pinned is a capacity planning bug, not a cache miss.
            let victim = victim.expect("lrumap: every entry pinned");
            self.recency.retain(|k| *k != victim);
            let e = self.entries.remove(&victim).unwrap();
            evicted = Some((victim, e.value));
        }

        self.touch(key);
        self.entries.insert(key, Entry { value, pinned });
        evicted
    }

    /// Gets the value for `key`, touching the entry.
    pub fn get(&mut self, key: K) -> Option<&V> {
        if self.entries.contains_key(&key) {
            self.touch(key);
        }
        self.entries.get(&key).map(|e| &e.value)
    }

    /// Gets the value for `key` without touching the entry.
    pub fn peek(&self, key: K) -> Option<&V> {
        self.entries.get(&key).map(|e| &e.value)
    }

    /// Removes the entry for `key`, returning its value.
    pub fn remove(&mut self, key: K) -> Option<V> {
        let e = self.entries.remove(&key)?;
        self.recency.retain(|k| *k != key);
        Some(e.value)
    }

    /// Clears the pinned flag for `key`, making it evictable again.
    pub fn unpin(&mut self, key: K) {
        if let Some(e) = self.entries.get_mut(&key) {
            e.pinned = false;
        }
    }

    /// Removes every entry satisfying `pred`. Used for cache maintenance
    /// sweeps.
    pub fn retain(&mut self, mut pred: impl FnMut(&K, &V) -> bool) {
        let entries = &mut self.entries;
        entries.retain(|k, e| pred(k, &e.value));
        self.recency.retain(|k| entries.contains_key(k));
    }

    fn touch(&mut self, key: K) {
        self.recency.retain(|k| *k != key);
        self.recency.push_back(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut uut = LruMap::new(4);
        assert!(uut.is_empty());
        uut.insert(1, "a");
        uut.insert(2, "b");
        assert_eq!(uut.get(1), Some(&"a"));
        assert_eq!(uut.get(3), None);
        assert_eq!(uut.len(), 2);
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut uut = LruMap::new(2);
        uut.insert(1, "a");
        uut.insert(2, "b");

        // Touch 1 so that 2 is now the oldest.
        uut.get(1);

        let evicted = uut.insert(3, "c");
        assert_eq!(evicted, Some((2, "b")));
        assert!(uut.contains(1));
        assert!(uut.contains(3));
    }

    #[test]
    fn peek_does_not_touch() {
        let mut uut = LruMap::new(2);
        uut.insert(1, "a");
        uut.insert(2, "b");

        // Peek at 1; it stays oldest and gets evicted.
        uut.peek(1);

        let evicted = uut.insert(3, "c");
        assert_eq!(evicted, Some((1, "a")));
    }

    #[test]
    fn pinned_entries_survive_pressure() {
        let mut uut = LruMap::new(2);
        uut.insert_pinned(1, "a");
        uut.insert(2, "b");
        let evicted = uut.insert(3, "c");
        assert_eq!(evicted, Some((2, "b")));
        assert!(uut.contains(1));

        uut.unpin(1);
        let evicted = uut.insert(4, "d");
        assert_eq!(evicted, Some((1, "a")));
    }

    #[test]
    #[should_panic]
    fn all_pinned_insert_panics() {
        let mut uut = LruMap::new(1);
        uut.insert_pinned(1, "a");
        uut.insert(2, "b");
    }

    #[test]
    fn reinsert_updates_value_in_place() {
        let mut uut = LruMap::new(2);
        uut.insert(1, "a");
        uut.insert(1, "a2");
        assert_eq!(uut.len(), 1);
        assert_eq!(uut.get(1), Some(&"a2"));
    }

    #[test]
    fn remove_round_trips() {
        let mut uut = LruMap::new(2);
        uut.insert(1, "a");
        assert_eq!(uut.remove(1), Some("a"));
        assert_eq!(uut.remove(1), None);
        assert!(uut.is_empty());
    }

    #[test]
    fn retain_sweeps() {
        let mut uut = LruMap::new(4);
        for k in 0..4 {
            uut.insert(k, k * 10);
        }
        uut.retain(|k, _| k % 2 == 0);
        assert_eq!(uut.len(), 2);
        assert!(uut.contains(0));
        assert!(!uut.contains(1));
    }
}
