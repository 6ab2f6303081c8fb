//! Bounded cache of full blocks, keyed by header hash.
//!
//! Implements the [Adaptive Replacement Cache](https://www.usenix.org/conference/fast-03/arc-self-tuning-low-overhead-replacement-cache)
//! (ARC) policy. Resident entries live in one of two lists:
//!
//! * `recent` (T1): entries seen exactly once since they were last admitted.
//! * `frequent` (T2): entries seen at least twice.
//!
//! Two "ghost" lists (`recent_ghosts` (B1) and `frequent_ghosts` (B2)) remember the keys (not the
//! values) recently evicted from T1 and T2. A hit in a ghost list means that list was too small,
//! so the target size `p` of T1 is adjusted toward it. This lets the cache favor recency or
//! frequency depending on the observed workload (a one-off scan of new blocks cannot flush blocks
//! that are being looked up repeatedly).
//!
//! Each list is ordered from least to most recently used. All operations are `O(capacity)` in the
//! worst case, which is acceptable for the small capacities used by consensus.

use std::{
    collections::{HashMap, VecDeque},
    hash::Hash,
    num::NonZeroUsize,
};

/// Default number of blocks retained.
pub const DEFAULT_CAPACITY: usize = 200;

/// Keys ordered from least to most recently used.
#[derive(Debug)]
struct Recency<K> {
    order: VecDeque<K>,
}

impl<K: Eq + Clone> Recency<K> {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn contains(&self, key: &K) -> bool {
        self.order.iter().any(|k| k == key)
    }

    fn remove(&mut self, key: &K) -> bool {
        match self.order.iter().position(|k| k == key) {
            Some(index) => {
                self.order.remove(index);
                true
            }
            None => false,
        }
    }

    /// Inserts `key` as most recently used (moving it if already present).
    fn touch(&mut self, key: K) {
        self.remove(&key);
        self.order.push_back(key);
    }

    fn pop_oldest(&mut self) -> Option<K> {
        self.order.pop_front()
    }
}

/// Adaptive replacement cache.
#[derive(Debug)]
pub struct Cache<K, V> {
    capacity: usize,

    /// Target size of `recent`.
    p: usize,

    recent: Recency<K>,
    frequent: Recency<K>,
    recent_ghosts: Recency<K>,
    frequent_ghosts: Recency<K>,

    values: HashMap<K, V>,
}

impl<K: Eq + Hash + Clone, V> Cache<K, V> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity: capacity.get(),
            p: 0,
            recent: Recency::new(),
            frequent: Recency::new(),
            recent_ghosts: Recency::new(),
            frequent_ghosts: Recency::new(),
            values: HashMap::new(),
        }
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns true if `key` is resident (does not update recency).
    pub fn contains(&self, key: &K) -> bool {
        self.values.contains_key(key)
    }

    /// Returns the value of `key` without updating recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.values.get(key)
    }

    /// Returns the value of `key`, promoting it to the frequent list.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.promote(key)?;
        self.values.get(key)
    }

    /// Returns a mutable reference to the value of `key`, promoting it to the frequent list.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.promote(key)?;
        self.values.get_mut(key)
    }

    fn promote(&mut self, key: &K) -> Option<()> {
        if !self.values.contains_key(key) {
            return None;
        }
        self.recent.remove(key);
        self.frequent.touch(key.clone());
        Some(())
    }

    /// Inserts `key` with `value`.
    ///
    /// Returns the key of the resident entry evicted to make room, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<K> {
        // Resident: update value and treat as a second access
        if self.values.contains_key(&key) {
            self.recent.remove(&key);
            self.frequent.touch(key.clone());
            self.values.insert(key, value);
            return None;
        }

        // Ghost hit in B1: favor recency
        if self.recent_ghosts.contains(&key) {
            let delta = if self.frequent_ghosts.len() > self.recent_ghosts.len() {
                self.frequent_ghosts.len() / self.recent_ghosts.len()
            } else {
                1
            };
            self.p = (self.p + delta).min(self.capacity);
            let evicted = self.make_room(false);
            self.recent_ghosts.remove(&key);
            self.frequent.touch(key.clone());
            self.values.insert(key, value);
            return evicted;
        }

        // Ghost hit in B2: favor frequency
        if self.frequent_ghosts.contains(&key) {
            let delta = if self.recent_ghosts.len() > self.frequent_ghosts.len() {
                self.recent_ghosts.len() / self.frequent_ghosts.len()
            } else {
                1
            };
            self.p = self.p.saturating_sub(delta);
            let evicted = self.make_room(true);
            self.frequent_ghosts.remove(&key);
            self.frequent.touch(key.clone());
            self.values.insert(key, value);
            return evicted;
        }

        // Brand new key
        let evicted = self.make_room(false);
        if self.recent_ghosts.len() > self.capacity - self.p {
            self.recent_ghosts.pop_oldest();
        }
        if self.frequent_ghosts.len() > self.p {
            self.frequent_ghosts.pop_oldest();
        }
        self.recent.touch(key.clone());
        self.values.insert(key, value);
        evicted
    }

    /// Removes `key` from the cache (including ghost lists).
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.recent.remove(key);
        self.frequent.remove(key);
        self.recent_ghosts.remove(key);
        self.frequent_ghosts.remove(key);
        self.values.remove(key)
    }

    /// Evicts one resident entry if the cache is full.
    fn make_room(&mut self, frequent_ghost_hit: bool) -> Option<K> {
        if self.recent.len() + self.frequent.len() < self.capacity {
            return None;
        }
        self.replace(frequent_ghost_hit)
    }

    /// Moves the least recently used entry of T1 or T2 to its ghost list.
    fn replace(&mut self, frequent_ghost_hit: bool) -> Option<K> {
        let recent = self.recent.len();
        let from_recent =
            recent > 0 && (recent > self.p || (recent == self.p && frequent_ghost_hit));
        let evicted = if from_recent {
            let key = self.recent.pop_oldest()?;
            self.recent_ghosts.touch(key.clone());
            if self.recent_ghosts.len() > self.capacity {
                self.recent_ghosts.pop_oldest();
            }
            key
        } else {
            let key = self.frequent.pop_oldest()?;
            self.frequent_ghosts.touch(key.clone());
            if self.frequent_ghosts.len() > self.capacity {
                self.frequent_ghosts.pop_oldest();
            }
            key
        };
        self.values.remove(&evicted);
        Some(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> Cache<u64, String> {
        Cache::new(NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn test_insert_and_get() {
        let mut c = cache(4);
        assert!(c.is_empty());
        assert_eq!(c.insert(1, "one".into()), None);
        assert_eq!(c.insert(2, "two".into()), None);
        assert_eq!(c.get(&1).map(String::as_str), Some("one"));
        assert_eq!(c.peek(&2).map(String::as_str), Some("two"));
        assert_eq!(c.get(&3), None);
        assert_eq!(c.len(), 2);

        // Overwrite
        c.insert(1, "uno".into());
        assert_eq!(c.get(&1).map(String::as_str), Some("uno"));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_bounded() {
        let mut c = cache(3);
        for i in 0..100 {
            c.insert(i, i.to_string());
            assert!(c.len() <= 3);
        }
        assert_eq!(c.len(), 3);
        assert!(c.contains(&99));
        assert!(!c.contains(&0));
    }

    #[test]
    fn test_evicts_least_recent_of_single_use() {
        let mut c = cache(2);
        c.insert(1, "a".into());
        c.insert(2, "b".into());
        assert_eq!(c.insert(3, "c".into()), Some(1));
        assert!(!c.contains(&1));
        assert!(c.contains(&2));
        assert!(c.contains(&3));
    }

    #[test]
    fn test_frequent_entries_survive_scan() {
        let mut c = cache(4);
        c.insert(1, "hot".into());
        c.insert(2, "warm".into());

        // Access twice so they move to the frequent list
        assert!(c.get(&1).is_some());
        assert!(c.get(&2).is_some());

        // Scan through many one-off entries
        for i in 100..120 {
            c.insert(i, "scan".into());
        }
        assert!(c.contains(&1));
        assert!(c.contains(&2));
        assert_eq!(c.len(), 4);
    }

    #[test]
    fn test_ghost_hit_adapts_target() {
        let mut c = cache(2);
        c.insert(1, "a".into());
        c.insert(2, "b".into());
        c.insert(3, "c".into()); // evicts 1 into the recent ghost list
        assert!(!c.contains(&1));
        assert_eq!(c.p, 0);

        // Re-admitting a ghost grows the recency target and lands in the frequent list
        c.insert(1, "a".into());
        assert!(c.contains(&1));
        assert_eq!(c.p, 1);
        assert!(c.frequent.contains(&1));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_get_mut_updates_in_place() {
        let mut c = cache(2);
        c.insert(7, "x".into());
        c.get_mut(&7).unwrap().push('y');
        assert_eq!(c.peek(&7).map(String::as_str), Some("xy"));
        assert!(c.get_mut(&8).is_none());
    }

    #[test]
    fn test_remove() {
        let mut c = cache(2);
        c.insert(1, "a".into());
        assert_eq!(c.remove(&1), Some("a".into()));
        assert!(c.is_empty());
        assert_eq!(c.remove(&1), None);
    }
}
