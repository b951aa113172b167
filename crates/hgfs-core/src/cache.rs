// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fixed-capacity LRU cache
//!
//! String key to value, strict least-recently-used eviction, O(1)
//! amortized operations: a hash map indexes into a slab of entries that
//! are chained into an intrusive doubly linked list ordered by recency.
//! The owner is expected to wrap the cache in its own `Mutex`; the
//! removal callback runs under that lock and must not block.

use std::collections::HashMap;

/// Invoked with an entry's key and value before eviction frees it.
pub type RemovalCallback<V> = Box<dyn Fn(&str, &V) + Send + Sync>;

const NIL: usize = usize::MAX;

struct Slot<V> {
    key: String,
    value: V,
    prev: usize,
    next: usize,
}

pub struct LruCache<V> {
    capacity: usize,
    map: HashMap<String, usize>,
    slots: Vec<Option<Slot<V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    on_evict: Option<RemovalCallback<V>>,
}

impl<V> LruCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            on_evict: None,
        }
    }

    pub fn with_removal_callback(capacity: usize, cb: RemovalCallback<V>) -> Self {
        let mut cache = Self::new(capacity);
        cache.on_evict = Some(cb);
        cache
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slots[idx].as_ref().unwrap();
            (slot.prev, slot.next)
        };
        if prev != NIL {
            self.slots[prev].as_mut().unwrap().next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].as_mut().unwrap().prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn link_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let slot = self.slots[idx].as_mut().unwrap();
            slot.prev = NIL;
            slot.next = old_head;
        }
        if old_head != NIL {
            self.slots[old_head].as_mut().unwrap().prev = idx;
        } else {
            self.tail = idx;
        }
        self.head = idx;
    }

    fn evict_tail(&mut self) {
        let idx = self.tail;
        debug_assert_ne!(idx, NIL);
        self.unlink(idx);
        let slot = self.slots[idx].take().unwrap();
        self.map.remove(&slot.key);
        self.free.push(idx);
        if let Some(cb) = &self.on_evict {
            cb(&slot.key, &slot.value);
        }
    }

    /// Inserts or updates an entry, moving it to the most-recently-used
    /// position. Inserting past capacity evicts the least-recently-used
    /// entry through the removal callback first.
    ///
    /// Capacity zero is legal: the value is "evicted" immediately and the
    /// cache stays empty.
    pub fn put(&mut self, key: &str, value: V) {
        if self.capacity == 0 {
            if let Some(cb) = &self.on_evict {
                cb(key, &value);
            }
            return;
        }
        if let Some(&idx) = self.map.get(key) {
            self.slots[idx].as_mut().unwrap().value = value;
            self.unlink(idx);
            self.link_front(idx);
            return;
        }
        if self.map.len() == self.capacity {
            self.evict_tail();
        }
        let slot = Slot {
            key: key.to_string(),
            value,
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.map.insert(key.to_string(), idx);
        self.link_front(idx);
    }

    /// Returns the value for `key`, refreshing its recency on a hit.
    pub fn get(&mut self, key: &str) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.unlink(idx);
        self.link_front(idx);
        Some(&self.slots[idx].as_ref().unwrap().value)
    }

    /// Removes an entry without invoking the removal callback (the caller
    /// already owns the value's resources). Returns whether it existed.
    pub fn invalidate(&mut self, key: &str) -> bool {
        let Some(idx) = self.map.remove(key) else {
            return false;
        };
        self.unlink(idx);
        self.slots[idx] = None;
        self.free.push(idx);
        true
    }

    /// Drops every entry. The removal callback is not invoked; this is the
    /// teardown path where the underlying resources are already going away.
    pub fn clear(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("c", 3);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b"), Some(&2));
        assert_eq!(cache.get("c"), Some(&3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn get_refreshes_recency() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        // touching "a" makes "b" the eviction victim
        assert_eq!(cache.get("a"), Some(&1));
        cache.put("c", 3);
        assert_eq!(cache.get("a"), Some(&1));
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("c"), Some(&3));
    }

    #[test]
    fn duplicate_put_updates_in_place() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("a", 10);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a"), Some(&10));
        // the refreshed entry must survive one more insert
        cache.put("b", 2);
        cache.put("c", 3);
        assert!(cache.get("a").is_none() || cache.get("b").is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn eviction_invokes_callback() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let seen = evicted.clone();
        let mut cache = LruCache::with_removal_callback(
            1,
            Box::new(move |key, value: &usize| {
                assert_eq!(key, "a");
                assert_eq!(*value, 1);
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(evicted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalidate_skips_callback() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let seen = evicted.clone();
        let mut cache = LruCache::with_removal_callback(
            4,
            Box::new(move |_, _: &usize| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        cache.put("a", 1);
        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        assert_eq!(evicted.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn zero_capacity_put_is_legal() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let seen = evicted.clone();
        let mut cache = LruCache::with_removal_callback(
            0,
            Box::new(move |_, _: &usize| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        cache.put("a", 1);
        assert!(cache.is_empty());
        assert!(cache.get("a").is_none());
        assert_eq!(evicted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_skips_callback_and_resets() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let seen = evicted.clone();
        let mut cache = LruCache::with_removal_callback(
            4,
            Box::new(move |_, _: &usize| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        cache.put("a", 1);
        cache.put("b", 2);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(evicted.load(Ordering::SeqCst), 0);
        // reusable after clear
        cache.put("c", 3);
        assert_eq!(cache.get("c"), Some(&3));
    }

    #[test]
    fn slot_reuse_after_invalidate() {
        let mut cache = LruCache::new(3);
        for round in 0..10 {
            let key = format!("k{}", round);
            cache.put(&key, round);
            assert!(cache.invalidate(&key));
        }
        assert!(cache.is_empty());
        // internal slab should not have grown past one live slot
        assert!(cache.slots.len() <= 1);
    }
}
