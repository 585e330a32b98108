//! Bounded FIFO-eviction cache used by the Route Manager (spec §4.D) for
//! `manifestCache`, `gtypeCache`, and `healthCache` (each capped at 1000).
//!
//! Grounded on the reference gateway's `ResponseCache` (`cache.rs`): a
//! `DashMap` of entries plus atomic hit/miss counters. That cache evicts by
//! TTL; this one evicts the oldest-inserted entry once the cap is hit
//! (spec says "FIFO eviction", not time-based), so insertion order is
//! tracked in a side `Mutex<VecDeque<K>>` rather than reusing the TTL sweep.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

/// A bounded cache with FIFO eviction once `capacity` is exceeded.
pub struct BoundedCache<K, V> {
    entries: DashMap<K, V>,
    order: Mutex<VecDeque<K>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time counters for a [`BoundedCache`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Successful `get` calls.
    pub hits: u64,
    /// `get` calls that found nothing.
    pub misses: u64,
    /// Entries evicted to stay within capacity.
    pub evictions: u64,
    /// Current entry count.
    pub len: usize,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache capped at `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Insert or overwrite `key`. Overwriting an existing key does not move
    /// it in the eviction order.
    pub fn put(&self, key: K, value: V) {
        use dashmap::mapref::entry::Entry;
        let is_new = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut e) => {
                e.insert(value);
                false
            }
            Entry::Vacant(e) => {
                e.insert(value);
                true
            }
        };
        if is_new {
            let mut order = self.order.lock();
            order.push_back(key);
            while order.len() > self.capacity {
                if let Some(oldest) = order.pop_front() {
                    self.entries.remove(&oldest);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Fetch `key`, recording a hit or miss.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.entries.get(key) {
            Some(v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(v.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Current snapshot of counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            len: self.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_once_over_capacity() {
        let cache: BoundedCache<u32, &str> = BoundedCache::new(2);
        cache.put(1, "a");
        cache.put(2, "b");
        cache.put(3, "c");
        assert!(cache.get(&1).is_none());
        assert_eq!(cache.get(&2), Some("b"));
        assert_eq!(cache.get(&3), Some("c"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn overwrite_does_not_change_eviction_order() {
        let cache: BoundedCache<u32, &str> = BoundedCache::new(2);
        cache.put(1, "a");
        cache.put(2, "b");
        cache.put(1, "a2"); // overwrite, 1 stays oldest
        cache.put(3, "c"); // should evict 1, not 2
        assert!(cache.get(&1).is_none());
        assert_eq!(cache.get(&2), Some("b"));
    }

    #[test]
    fn tracks_hit_and_miss_counts() {
        let cache: BoundedCache<u32, &str> = BoundedCache::new(10);
        cache.put(1, "a");
        cache.get(&1);
        cache.get(&2);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }
}
