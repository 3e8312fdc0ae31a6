//! Plain least-recently-used eviction.
use std::collections::HashMap;
use std::hash::Hash;

use ahash::RandomState;

use crate::eviction::check_capacity;
use crate::recency_list::RecencyList;
use crate::EvictionCache;

/// Reads and writes move an entry to the front; a full cache evicts from the back.
pub struct LruCache<K, V> {
    capacity: usize,
    index: HashMap<K, usize, RandomState>,
    list: RecencyList<(K, V)>,
}

impl<K: Hash + Eq + Clone, V> LruCache<K, V> {
    /// # Panics
    ///
    /// If `capacity` is 0.
    pub fn new(capacity: usize) -> LruCache<K, V> {
        check_capacity(capacity);
        LruCache {
            capacity,
            index: Default::default(),
            list: RecencyList::new(),
        }
    }

    /// Look up a key without counting it as a use.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let i = *self.index.get(key)?;
        Some(&self.list.get(i).1)
    }

    /// Entries from most to least recently used.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.list.iter().map(|(_, (k, v))| (k, v))
    }
}

impl<K: Hash + Eq + Clone, V> EvictionCache<K, V> for LruCache<K, V> {
    fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    fn get(&mut self, key: &K) -> Option<&V> {
        let i = *self.index.get(key)?;
        self.list.move_to_front(i);
        Some(&self.list.get(i).1)
    }

    fn add(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&i) = self.index.get(&key) {
            self.list.get_mut(i).1 = value;
            self.list.move_to_front(i);
            return None;
        }

        let mut evicted = None;
        if self.list.len() >= self.capacity {
            if let Some((old_key, old_value)) = self.list.pop_back() {
                self.index.remove(&old_key);
                evicted = Some((old_key, old_value));
            }
        }
        let i = self.list.push_front((key.clone(), value));
        self.index.insert(key, i);
        evicted
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let i = self.index.remove(key)?;
        Some(self.list.remove(i).1)
    }

    fn len(&self) -> usize {
        self.list.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
