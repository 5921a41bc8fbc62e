//! A bounded, TTL-evicting cache keyed by 32-byte hash, used to dedupe
//! concurrent in-flight requests keyed by URL or id hash (spec §4.3's
//! concurrency note on `/keys` fetches).
//!
//! Capacity and TTL are both enforced on insert: expired entries are swept
//! first, then the oldest remaining entry is evicted if still over capacity.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Bounded cache for pending work with TTL and max-size eviction.
pub struct BoundedPendingCache<T> {
    map: HashMap<[u8; 32], (T, Instant)>,
    max_size: usize,
    ttl: Duration,
}

impl<T> BoundedPendingCache<T> {
    pub fn new(max_size: usize, ttl_secs: u64) -> Self {
        Self {
            map: HashMap::new(),
            max_size,
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    pub fn get(&self, hash: &[u8; 32]) -> Option<&T> {
        self.map
            .get(hash)
            .filter(|(_, t)| t.elapsed() < self.ttl)
            .map(|(v, _)| v)
    }

    pub fn insert(&mut self, hash: [u8; 32], value: T) {
        let now = Instant::now();
        self.map
            .retain(|_, (_, t)| now.duration_since(*t) < self.ttl);
        while self.map.len() >= self.max_size && !self.map.is_empty() {
            let oldest = self
                .map
                .iter()
                .min_by_key(|(_, (_, t))| *t)
                .map(|(h, _)| *h);
            if let Some(h) = oldest {
                self.map.remove(&h);
            } else {
                break;
            }
        }
        self.map.insert(hash, (value, now));
    }

    pub fn remove(&mut self, hash: &[u8; 32]) -> Option<T> {
        self.map.remove(hash).map(|(v, _)| v)
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_cache_insert_and_get() {
        let mut cache = BoundedPendingCache::new(10, 3600);
        let hash = [1u8; 32];
        cache.insert(hash, "hello");
        assert_eq!(cache.get(&hash), Some(&"hello"));
    }

    #[test]
    fn test_pending_cache_evicts_oldest() {
        let mut cache = BoundedPendingCache::new(2, 3600);
        cache.insert([1u8; 32], "a");
        cache.insert([2u8; 32], "b");
        cache.insert([3u8; 32], "c");
        assert!(cache.get(&[1u8; 32]).is_none());
        assert_eq!(cache.get(&[3u8; 32]), Some(&"c"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_pending_cache_remove() {
        let mut cache = BoundedPendingCache::new(10, 3600);
        cache.insert([1u8; 32], 42);
        assert_eq!(cache.remove(&[1u8; 32]), Some(42));
        assert!(cache.get(&[1u8; 32]).is_none());
    }
}
