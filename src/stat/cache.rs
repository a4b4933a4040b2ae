//! Bounded per-value counter maps with least-recently-accessed eviction.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;

struct Slot<V> {
    value: Arc<V>,
    stamp: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, Slot<V>>,
    recency: BTreeMap<u64, K>,
    next_stamp: u64,
}

/// `value → counter` map used by hot-key rules. Capacity is a hard bound:
/// inserting into a full map evicts the least-recently-accessed value, so
/// an unbounded key space cannot grow the map without limit.
pub struct LruCounterMap<K, V> {
    capacity: usize,
    inner: Mutex<Inner<K, V>>,
}

impl<K: Eq + Hash + Clone, V> LruCounterMap<K, V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_stamp: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let stamp = inner.next_stamp;
        inner.next_stamp += 1;
        let slot = inner.entries.get_mut(key)?;
        let old = std::mem::replace(&mut slot.stamp, stamp);
        let value = Arc::clone(&slot.value);
        inner.recency.remove(&old);
        inner.recency.insert(stamp, key.clone());
        Some(value)
    }

    /// Fetch the counter for `key`, creating it with `init` if absent.
    /// The boolean reports whether this call created it.
    pub fn get_or_insert_with(&self, key: &K, init: impl FnOnce() -> V) -> (Arc<V>, bool) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let stamp = inner.next_stamp;
        inner.next_stamp += 1;

        if let Some(slot) = inner.entries.get_mut(key) {
            let old = std::mem::replace(&mut slot.stamp, stamp);
            let value = Arc::clone(&slot.value);
            inner.recency.remove(&old);
            inner.recency.insert(stamp, key.clone());
            return (value, false);
        }

        if inner.entries.len() >= self.capacity {
            if let Some((_, evicted)) = inner.recency.pop_first() {
                inner.entries.remove(&evicted);
            }
        }

        let value = Arc::new(init());
        inner.entries.insert(
            key.clone(),
            Slot {
                value: Arc::clone(&value),
                stamp,
            },
        );
        inner.recency.insert(stamp, key.clone());
        (value, true)
    }

    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let slot = inner.entries.remove(key)?;
        inner.recency.remove(&slot.stamp);
        Some(slot.value)
    }

    pub fn clear(&self) {
        let mut guard = self.inner.lock();
        guard.entries.clear();
        guard.recency.clear();
    }
}

impl<K, V> std::fmt::Debug for LruCounterMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruCounterMap")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn capacity_is_a_hard_bound() {
        let map: LruCounterMap<u32, AtomicU64> = LruCounterMap::new(3);
        for key in 0..10 {
            map.get_or_insert_with(&key, || AtomicU64::new(0));
        }
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn eviction_removes_the_least_recently_accessed() {
        let map: LruCounterMap<&str, AtomicU64> = LruCounterMap::new(2);
        map.get_or_insert_with(&"a", || AtomicU64::new(1));
        map.get_or_insert_with(&"b", || AtomicU64::new(2));
        // Touch "a" so "b" is now the coldest.
        map.get(&"a");
        map.get_or_insert_with(&"c", || AtomicU64::new(3));

        assert!(map.get(&"a").is_some());
        assert!(map.get(&"b").is_none());
        assert!(map.get(&"c").is_some());
    }

    #[test]
    fn counters_are_shared_not_replaced() {
        let map: LruCounterMap<&str, AtomicU64> = LruCounterMap::new(4);
        let (counter, created) = map.get_or_insert_with(&"k", || AtomicU64::new(0));
        assert!(created);
        counter.fetch_add(5, Ordering::Relaxed);

        let (again, created) = map.get_or_insert_with(&"k", || AtomicU64::new(0));
        assert!(!created);
        assert_eq!(again.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn remove_frees_a_slot() {
        let map: LruCounterMap<&str, AtomicU64> = LruCounterMap::new(1);
        map.get_or_insert_with(&"x", || AtomicU64::new(0));
        map.remove(&"x");
        assert!(map.is_empty());
        map.get_or_insert_with(&"y", || AtomicU64::new(0));
        assert!(map.get(&"y").is_some());
    }
}
