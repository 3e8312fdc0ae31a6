//! A simplified adaptive replacement cache.
//!
//! Live entries sit in T1 (seen once) or T2 (seen at least twice).  Evicted keys are remembered without their values
//! in the ghost lists B1 and B2, each bounded to the cache capacity.  A key coming back from a ghost list goes
//! straight to T2.
//!
//! Eviction trims T1 when T1 exceeds the capacity or any ghost is remembered, and T2 otherwise.  There is no adaptive
//! target as in the published algorithm.
use std::collections::HashMap;
use std::hash::Hash;

use ahash::RandomState;

use crate::eviction::check_capacity;
use crate::recency_list::RecencyList;
use crate::EvictionCache;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Location {
    T1(usize),
    T2(usize),
    B1(usize),
    B2(usize),
}

pub struct ArcCache<K, V> {
    capacity: usize,
    index: HashMap<K, Location, RandomState>,
    t1: RecencyList<(K, V)>,
    t2: RecencyList<(K, V)>,
    b1: RecencyList<K>,
    b2: RecencyList<K>,
}

impl<K: Hash + Eq + Clone, V> ArcCache<K, V> {
    /// # Panics
    ///
    /// If `capacity` is 0.
    pub fn new(capacity: usize) -> ArcCache<K, V> {
        check_capacity(capacity);
        ArcCache {
            capacity,
            index: Default::default(),
            t1: RecencyList::new(),
            t2: RecencyList::new(),
            b1: RecencyList::new(),
            b2: RecencyList::new(),
        }
    }

    /// Number of keys seen once and seen more often, for diagnostics.
    pub fn split(&self) -> (usize, usize) {
        (self.t1.len(), self.t2.len())
    }

    pub fn ghost_len(&self) -> usize {
        self.b1.len() + self.b2.len()
    }

    /// Move a live entry to the front of T2.
    fn promote(&mut self, location: Location) -> usize {
        let i = match location {
            Location::T1(i) => {
                let entry = self.t1.remove(i);
                self.t2.push_front(entry)
            }
            Location::T2(i) => {
                self.t2.move_to_front(i);
                i
            }
            _ => panic!("Only live entries can be promoted"),
        };
        let key = self.t2.get(i).0.clone();
        self.index.insert(key, Location::T2(i));
        i
    }

    fn remember(&mut self, key: K, from_t1: bool) {
        let ghosts = if from_t1 { &mut self.b1 } else { &mut self.b2 };
        if ghosts.len() >= self.capacity {
            if let Some(old) = ghosts.pop_back() {
                self.index.remove(&old);
            }
        }
        let i = ghosts.push_front(key.clone());
        let location = if from_t1 {
            Location::B1(i)
        } else {
            Location::B2(i)
        };
        self.index.insert(key, location);
    }

    /// Evict one live entry into its ghost list.
    fn replace(&mut self) -> Option<(K, V)> {
        // T1 is also the victim when T2 has nothing to give.
        let from_t1 = !self.t1.is_empty()
            && (self.t1.len() > self.capacity || self.ghost_len() > 0 || self.t2.is_empty());
        let (key, value) = if from_t1 {
            self.t1.pop_back()?
        } else {
            self.t2.pop_back()?
        };
        self.index.remove(&key);
        self.remember(key.clone(), from_t1);
        Some((key, value))
    }

    fn forget_ghost(&mut self, location: Location) {
        match location {
            Location::B1(i) => {
                self.b1.remove(i);
            }
            Location::B2(i) => {
                self.b2.remove(i);
            }
            _ => panic!("Not a ghost"),
        }
    }
}

impl<K: Hash + Eq + Clone, V> EvictionCache<K, V> for ArcCache<K, V> {
    fn contains(&self, key: &K) -> bool {
        matches!(
            self.index.get(key),
            Some(Location::T1(_)) | Some(Location::T2(_))
        )
    }

    fn get(&mut self, key: &K) -> Option<&V> {
        let location = *self.index.get(key)?;
        match location {
            Location::T1(_) | Location::T2(_) => {
                let i = self.promote(location);
                Some(&self.t2.get(i).1)
            }
            Location::B1(_) | Location::B2(_) => None,
        }
    }

    fn add(&mut self, key: K, value: V) -> Option<(K, V)> {
        let location = self.index.get(&key).copied();
        let to_t2 = match location {
            Some(l @ Location::T1(_)) | Some(l @ Location::T2(_)) => {
                let i = self.promote(l);
                self.t2.get_mut(i).1 = value;
                return None;
            }
            Some(l @ Location::B1(_)) | Some(l @ Location::B2(_)) => {
                self.forget_ghost(l);
                true
            }
            None => false,
        };
        self.index.remove(&key);

        let evicted = if self.len() >= self.capacity {
            self.replace()
        } else {
            None
        };

        let location = if to_t2 {
            Location::T2(self.t2.push_front((key.clone(), value)))
        } else {
            Location::T1(self.t1.push_front((key.clone(), value)))
        };
        self.index.insert(key, location);
        evicted
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        match self.index.get(key).copied()? {
            Location::T1(i) => {
                self.index.remove(key);
                Some(self.t1.remove(i).1)
            }
            Location::T2(i) => {
                self.index.remove(key);
                Some(self.t2.remove(i).1)
            }
            // Ghosts have no value to hand back; keep them as history.
            Location::B1(_) | Location::B2(_) => None,
        }
    }

    fn len(&self) -> usize {
        self.t1.len() + self.t2.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_hits_promote() {
        let mut cache = ArcCache::new(3);
        cache.add(1, "a");
        cache.add(2, "b");
        assert_eq!(cache.split(), (2, 0));
        assert_eq!(cache.get(&1), Some(&"a"));
        assert_eq!(cache.split(), (1, 1));
        cache.add(2, "c");
        assert_eq!(cache.split(), (0, 2));
        assert_eq!(cache.get(&2), Some(&"c"));
    }

    #[test]
    fn test_t2_is_trimmed_without_history() {
        let mut cache = ArcCache::new(2);
        cache.add(1, 1);
        cache.add(2, 2);
        cache.get(&1);
        assert_eq!(cache.split(), (1, 1));
        assert_eq!(cache.add(3, 3), Some((1, 1)));
        assert_eq!(cache.split(), (2, 0));
        assert_eq!(cache.ghost_len(), 1);
    }

    #[test]
    fn test_ghosts_make_t1_the_victim() {
        let mut cache = ArcCache::new(2);
        cache.add(0, 0);
        cache.get(&0);
        cache.add(1, 1);
        assert_eq!(cache.add(2, 2), Some((0, 0)));

        // With history remembered, new entries push out T1.
        assert_eq!(cache.add(3, 3), Some((1, 1)));
        assert_eq!(cache.split(), (2, 0));

        assert_eq!(cache.add(0, 0), Some((2, 2)));
        assert_eq!(cache.split(), (1, 1));
        assert!(cache.contains(&0));
        assert!(cache.contains(&3));
    }

    #[test]
    fn test_ghost_hit_goes_to_t2() {
        let mut cache = ArcCache::new(1);
        cache.add(1, ());
        assert_eq!(cache.add(2, ()), Some((1, ())));
        assert!(!cache.contains(&1));
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.ghost_len(), 1);

        // 1 was seen before, so coming back it counts as frequent.
        assert_eq!(cache.add(1, ()), Some((2, ())));
        assert_eq!(cache.split(), (0, 1));
        assert!(cache.contains(&1));
        assert!(cache.ghost_len() <= 2);
    }

    #[test]
    fn test_ghosts_are_bounded() {
        let mut cache = ArcCache::new(2);
        for i in 0..100 {
            cache.add(i, i);
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.ghost_len() <= 4);
        assert!(cache.index.len() <= 6);
    }
}
