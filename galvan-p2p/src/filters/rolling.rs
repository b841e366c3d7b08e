//! Rolling "recently seen" cache.
//!
//! An LRU over hashable keys: inserting past capacity forgets the
//! oldest entries, giving a rolling window of recent items. Used for
//! per-peer known-inventory sets, known-address sets and the global
//! recently-confirmed-transactions filter.

use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;

/// LRU-backed rolling membership cache.
pub struct SeenCache<K: Hash + Eq> {
    cache: LruCache<K, ()>,
}

impl<K: Hash + Eq> SeenCache<K> {
    /// Create a cache remembering up to `capacity` recent keys.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is nonzero");
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Insert a key, treating it as most recent.
    pub fn insert(&mut self, key: K) {
        self.cache.put(key, ());
    }

    /// Membership test without refreshing recency.
    pub fn contains(&self, key: &K) -> bool {
        self.cache.contains(key)
    }

    /// Insert if absent. Returns true when the key was new.
    pub fn check_and_insert(&mut self, key: K) -> bool {
        if self.cache.contains(&key) {
            false
        } else {
            self.cache.put(key, ());
            true
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

impl<K: Hash + Eq> std::fmt::Debug for SeenCache<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeenCache")
            .field("len", &self.cache.len())
            .field("cap", &self.cache.cap())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_and_insert() {
        let mut cache: SeenCache<[u8; 32]> = SeenCache::new(100);
        let hash = [1u8; 32];

        assert!(cache.check_and_insert(hash));
        assert!(!cache.check_and_insert(hash));
        assert!(cache.contains(&hash));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_rolls_out_oldest() {
        let mut cache: SeenCache<u32> = SeenCache::new(2);
        cache.insert(1);
        cache.insert(2);
        cache.insert(3);

        assert!(!cache.contains(&1));
        assert!(cache.contains(&2));
        assert!(cache.contains(&3));
    }

    #[test]
    fn test_zero_capacity_clamps() {
        let mut cache: SeenCache<u32> = SeenCache::new(0);
        cache.insert(1);
        assert!(cache.contains(&1));
    }
}
