//! LRU-K: recency plus a capped access count, so that entries used often survive a burst of one-off entries.
use std::collections::HashMap;
use std::hash::Hash;

use ahash::RandomState;

use crate::eviction::check_capacity;
use crate::recency_list::RecencyList;
use crate::EvictionCache;

struct Entry<K, V> {
    key: K,
    value: V,
    count: u32,
}

/// Every access makes the entry the most recent and advances every counter still below `k`, the accessed entry's
/// included.  Counters never exceed `k`.
///
/// Eviction removes the entry with the lowest counter, the least recent one on ties, and then ages every remaining
/// counter by one so that entries which were hot long ago eventually become evictable.
pub struct LruKCache<K, V> {
    capacity: usize,
    k: u32,
    index: HashMap<K, usize, RandomState>,
    list: RecencyList<Entry<K, V>>,
}

impl<K: Hash + Eq + Clone, V> LruKCache<K, V> {
    /// A `k` of 0 is treated as 1.
    ///
    /// # Panics
    ///
    /// If `capacity` is 0.
    pub fn new(capacity: usize, k: u32) -> LruKCache<K, V> {
        check_capacity(capacity);
        LruKCache {
            capacity,
            k: k.max(1),
            index: Default::default(),
            list: RecencyList::new(),
        }
    }

    pub fn k(&self) -> u32 {
        self.k
    }

    /// The access counter of a key, without touching it.
    pub fn access_count(&self, key: &K) -> Option<u32> {
        let i = *self.index.get(key)?;
        Some(self.list.get(i).count)
    }

    fn touch(&mut self, index: usize) {
        let k = self.k;
        for entry in self.list.iter_mut() {
            if entry.count < k {
                entry.count += 1;
            }
        }
        self.list.move_to_front(index);
    }

    fn evict(&mut self) -> Option<(K, V)> {
        // Walk from the least recent end so ties go to the oldest entry.
        let mut victim: Option<(usize, u32)> = None;
        let mut cur = self.list.back();
        while let Some(i) = cur {
            let count = self.list.get(i).count;
            if victim.map_or(true, |(_, best)| count < best) {
                victim = Some((i, count));
            }
            cur = self.list.prev(i);
        }

        let (index, _) = victim?;
        let entry = self.list.remove(index);
        self.index.remove(&entry.key);
        for other in self.list.iter_mut() {
            other.count = other.count.saturating_sub(1);
        }
        Some((entry.key, entry.value))
    }
}

impl<K: Hash + Eq + Clone, V> EvictionCache<K, V> for LruKCache<K, V> {
    fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    fn get(&mut self, key: &K) -> Option<&V> {
        let i = *self.index.get(key)?;
        self.touch(i);
        Some(&self.list.get(i).value)
    }

    fn add(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&i) = self.index.get(&key) {
            self.list.get_mut(i).value = value;
            self.touch(i);
            return None;
        }

        let evicted = if self.list.len() >= self.capacity {
            self.evict()
        } else {
            None
        };
        let i = self.list.push_front(Entry {
            key: key.clone(),
            value,
            count: 0,
        });
        self.index.insert(key, i);
        self.touch(i);
        evicted
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let i = self.index.remove(key)?;
        Some(self.list.remove(i).value)
    }

    fn len(&self) -> usize {
        self.list.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_advances_counters_below_k() {
        let mut cache = LruKCache::new(3, 2);
        cache.add("a", 1);
        cache.add("b", 2);
        assert_eq!(cache.access_count(&"a"), Some(2));
        assert_eq!(cache.access_count(&"b"), Some(1));

        cache.get(&"a");
        assert_eq!(cache.access_count(&"a"), Some(2));
        assert_eq!(cache.access_count(&"b"), Some(2));

        cache.add("c", 3);
        assert_eq!(cache.access_count(&"c"), Some(1));

        // The lowest counter goes, then the rest age by one before the new entry's access advances them again.
        assert_eq!(cache.add("d", 4), Some(("c", 3)));
        assert_eq!(cache.access_count(&"a"), Some(2));
        assert_eq!(cache.access_count(&"b"), Some(2));
        assert_eq!(cache.access_count(&"d"), Some(1));
    }

    #[test]
    fn test_ties_evict_least_recent() {
        let mut cache = LruKCache::new(2, 1);
        cache.add(1, "a");
        cache.add(2, "b");
        cache.get(&1);
        assert_eq!(cache.add(3, "c"), Some((2, "b")));
        assert_eq!(cache.access_count(&1), Some(1));
        assert_eq!(cache.access_count(&3), Some(1));
    }

    #[test]
    fn test_counter_is_capped() {
        let mut cache = LruKCache::new(2, 3);
        cache.add(1, ());
        for _ in 0..10 {
            cache.get(&1);
        }
        assert_eq!(cache.access_count(&1), Some(3));

        let mut zero = LruKCache::new(1, 0);
        assert_eq!(zero.k(), 1);
        zero.add(1, ());
        assert_eq!(zero.add(2, ()), Some((1, ())));
        assert_eq!(zero.len(), 1);
    }

    #[test]
    fn test_replace_touches() {
        let mut cache = LruKCache::new(2, 2);
        cache.add(1, "a");
        cache.add(2, "b");
        assert_eq!(cache.add(1, "c"), None);
        assert_eq!(cache.access_count(&1), Some(2));
        assert_eq!(cache.add(3, "d"), Some((2, "b")));
        assert_eq!(cache.get(&1), Some(&"c"));
    }
}
