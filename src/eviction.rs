//! Fixed-capacity key-value stores with interchangeable eviction policies.
//!
//! All policies share the [EvictionCache] contract: `len() <= capacity()` at all times, eviction happens inside
//! [EvictionCache::add] before the new entry goes in, and the key just added or read is always retrievable right
//! after the call.  Which other keys survive is up to the policy.
use std::hash::Hash;

use crate::*;

pub trait EvictionCache<K, V> {
    fn contains(&self, key: &K) -> bool;

    /// Look up a key, counting the access for the policy.
    fn get(&mut self, key: &K) -> Option<&V>;

    /// Insert or replace a value.  Returns the entry evicted to make room, if any.
    fn add(&mut self, key: K, value: V) -> Option<(K, V)>;

    fn remove(&mut self, key: &K) -> Option<V>;

    fn len(&self) -> usize;

    fn capacity(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Choice of eviction policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CachePolicy {
    Lru,
    /// Frequency-aware LRU, counting up to `k` accesses per entry.
    LruK { k: u32 },
    Arc,
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::Lru
    }
}

impl CachePolicy {
    /// Build an empty cache.
    ///
    /// # Panics
    ///
    /// If `capacity` is 0.
    pub fn build<K, V>(self, capacity: usize) -> Box<dyn EvictionCache<K, V>>
    where
        K: Hash + Eq + Clone + 'static,
        V: 'static,
    {
        match self {
            CachePolicy::Lru => Box::new(LruCache::new(capacity)),
            CachePolicy::LruK { k } => Box::new(LruKCache::new(capacity, k)),
            CachePolicy::Arc => Box::new(ArcCache::new(capacity)),
        }
    }
}

pub(crate) fn check_capacity(capacity: usize) {
    assert!(capacity > 0, "Cache capacity must be greater than zero");
}
