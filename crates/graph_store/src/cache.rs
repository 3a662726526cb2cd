//! Bounded key-value cache guarding cross-shard node fetches.
//!
//! Three eviction policies, all O(1) per operation:
//! - `Lru`: hash index plus a doubly-linked recency list.
//! - `Lfu`: frequency-ordered buckets, each holding its own recency list.
//! - `LfuOpt`: a fixed set of frequency tiers plus an unbounded overflow
//!   tier. Keys hot enough to climb past the top tier migrate to overflow
//!   and are never evicted, which trades strict LFU ordering for lower
//!   bookkeeping cost under stable access patterns. Capacity planning must
//!   account for overflow residents: once every entry has migrated there,
//!   inserts of new keys are silently dropped.
//!
//! Caches are not internally synchronized; the remote-fetch coordinator
//! serializes access behind its own mutex. Linked lists are index-based over
//! a slot arena, so there is no unsafe pointer juggling.

use std::collections::HashMap;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

const NIL: usize = usize::MAX;

/// Eviction policy, fixed for the lifetime of a cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    Lru,
    Lfu,
    LfuOpt,
}

/// Bounded key-value store. A `lookup` miss is an expected condition and
/// simply returns `None`; the caller treats it as "must fetch remotely".
pub trait EvictionCache<K, V>: Send {
    /// Entries currently held, never exceeding the capacity.
    fn size(&self) -> usize;
    fn capacity(&self) -> usize;
    fn contains(&self, key: &K) -> bool;
    /// Insert or update. At capacity with no evictable entry the new entry
    /// is silently dropped (only reachable under `LfuOpt`).
    fn insert(&mut self, key: K, value: V);
    /// Fetch a clone of the cached value, updating recency/frequency state.
    fn lookup(&mut self, key: &K) -> Option<V>;
}

/// Build a cache for the requested policy.
pub fn new_cache<K, V>(policy: Policy, limit: usize) -> Box<dyn EvictionCache<K, V>>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    match policy {
        Policy::Lru => Box::new(LruCache::new(limit)),
        Policy::Lfu => Box::new(LfuCache::new(limit)),
        Policy::LfuOpt => Box::new(LfuOptCache::new(limit)),
    }
}

// ---------------------------------------------------------------- LRU

struct LruSlot<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

pub struct LruCache<K, V> {
    limit: usize,
    map: HashMap<K, usize>,
    slots: Vec<LruSlot<K, V>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "cache needs a nonzero capacity");
        Self {
            limit,
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        if prev != NIL {
            self.slots[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn attach_front(&mut self, idx: usize) {
        self.slots[idx].prev = NIL;
        self.slots[idx].next = self.head;
        if self.head != NIL {
            self.slots[self.head].prev = idx;
        } else {
            self.tail = idx;
        }
        self.head = idx;
    }

    fn alloc(&mut self, key: K, value: V) -> usize {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = LruSlot {
                key,
                value,
                prev: NIL,
                next: NIL,
            };
            idx
        } else {
            self.slots.push(LruSlot {
                key,
                value,
                prev: NIL,
                next: NIL,
            });
            self.slots.len() - 1
        }
    }
}

impl<K, V> EvictionCache<K, V> for LruCache<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Clone + Send,
{
    fn size(&self) -> usize {
        self.map.len()
    }

    fn capacity(&self) -> usize {
        self.limit
    }

    fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    fn insert(&mut self, key: K, value: V) {
        if let Some(&idx) = self.map.get(&key) {
            self.slots[idx].value = value;
            self.detach(idx);
            self.attach_front(idx);
            return;
        }
        let idx = self.alloc(key.clone(), value);
        self.attach_front(idx);
        self.map.insert(key, idx);
        if self.map.len() > self.limit {
            let victim = self.tail;
            self.detach(victim);
            self.map.remove(&self.slots[victim].key);
            self.free.push(victim);
        }
    }

    fn lookup(&mut self, key: &K) -> Option<V> {
        let idx = *self.map.get(key)?;
        self.detach(idx);
        self.attach_front(idx);
        Some(self.slots[idx].value.clone())
    }
}

// ---------------------------------------------------------------- LFU

struct LfuEntry<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
    bucket: usize,
}

struct LfuBucket {
    use_count: u64,
    head: usize,
    tail: usize,
    prev: usize,
    next: usize,
}

pub struct LfuCache<K, V> {
    limit: usize,
    map: HashMap<K, usize>,
    entries: Vec<LfuEntry<K, V>>,
    free_entries: Vec<usize>,
    buckets: Vec<LfuBucket>,
    free_buckets: Vec<usize>,
    /// Bucket with the lowest use count.
    first_bucket: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> LfuCache<K, V> {
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "cache needs a nonzero capacity");
        Self {
            limit,
            map: HashMap::new(),
            entries: Vec::new(),
            free_entries: Vec::new(),
            buckets: Vec::new(),
            free_buckets: Vec::new(),
            first_bucket: NIL,
        }
    }

    fn alloc_entry(&mut self, entry: LfuEntry<K, V>) -> usize {
        if let Some(idx) = self.free_entries.pop() {
            self.entries[idx] = entry;
            idx
        } else {
            self.entries.push(entry);
            self.entries.len() - 1
        }
    }

    /// Allocate a bucket with `use_count`, linked after `prev` (NIL means
    /// the new bucket becomes the first).
    fn alloc_bucket(&mut self, use_count: u64, prev: usize) -> usize {
        let next = if prev == NIL {
            self.first_bucket
        } else {
            self.buckets[prev].next
        };
        let bucket = LfuBucket {
            use_count,
            head: NIL,
            tail: NIL,
            prev,
            next,
        };
        let idx = if let Some(idx) = self.free_buckets.pop() {
            self.buckets[idx] = bucket;
            idx
        } else {
            self.buckets.push(bucket);
            self.buckets.len() - 1
        };
        if prev == NIL {
            self.first_bucket = idx;
        } else {
            self.buckets[prev].next = idx;
        }
        if next != NIL {
            self.buckets[next].prev = idx;
        }
        idx
    }

    fn release_bucket_if_empty(&mut self, b: usize) {
        if self.buckets[b].head != NIL {
            return;
        }
        let (prev, next) = (self.buckets[b].prev, self.buckets[b].next);
        if prev != NIL {
            self.buckets[prev].next = next;
        } else {
            self.first_bucket = next;
        }
        if next != NIL {
            self.buckets[next].prev = prev;
        }
        self.free_buckets.push(b);
    }

    fn detach_entry(&mut self, e: usize) {
        let b = self.entries[e].bucket;
        let (prev, next) = (self.entries[e].prev, self.entries[e].next);
        if prev != NIL {
            self.entries[prev].next = next;
        } else {
            self.buckets[b].head = next;
        }
        if next != NIL {
            self.entries[next].prev = prev;
        } else {
            self.buckets[b].tail = prev;
        }
    }

    fn push_front(&mut self, b: usize, e: usize) {
        let head = self.buckets[b].head;
        self.entries[e].bucket = b;
        self.entries[e].prev = NIL;
        self.entries[e].next = head;
        if head != NIL {
            self.entries[head].prev = e;
        } else {
            self.buckets[b].tail = e;
        }
        self.buckets[b].head = e;
    }

    /// Move an entry to the bucket for `use + 1`, creating it if needed and
    /// releasing the old bucket if it emptied.
    fn increase(&mut self, e: usize) {
        let b = self.entries[e].bucket;
        let use_next = self.buckets[b].use_count + 1;
        let next_b = self.buckets[b].next;
        let target = if next_b != NIL && self.buckets[next_b].use_count == use_next {
            next_b
        } else {
            self.alloc_bucket(use_next, b)
        };
        self.detach_entry(e);
        self.push_front(target, e);
        self.release_bucket_if_empty(b);
    }

    /// Drop the least-recently-touched entry of the lowest-frequency bucket.
    fn evict(&mut self) {
        let b = self.first_bucket;
        if b == NIL {
            return;
        }
        let victim = self.buckets[b].tail;
        self.detach_entry(victim);
        self.map.remove(&self.entries[victim].key);
        self.free_entries.push(victim);
        self.release_bucket_if_empty(b);
    }
}

impl<K, V> EvictionCache<K, V> for LfuCache<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Clone + Send,
{
    fn size(&self) -> usize {
        self.map.len()
    }

    fn capacity(&self) -> usize {
        self.limit
    }

    fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    fn insert(&mut self, key: K, value: V) {
        if let Some(&e) = self.map.get(&key) {
            self.entries[e].value = value;
            self.increase(e);
            return;
        }
        if self.map.len() == self.limit {
            self.evict();
        }
        let target = if self.first_bucket != NIL && self.buckets[self.first_bucket].use_count == 1
        {
            self.first_bucket
        } else {
            self.alloc_bucket(1, NIL)
        };
        let e = self.alloc_entry(LfuEntry {
            key: key.clone(),
            value,
            prev: NIL,
            next: NIL,
            bucket: target,
        });
        self.push_front(target, e);
        self.map.insert(key, e);
    }

    fn lookup(&mut self, key: &K) -> Option<V> {
        let e = *self.map.get(key)?;
        self.increase(e);
        Some(self.entries[e].value.clone())
    }
}

// ---------------------------------------------------------------- LFUOpt

/// Number of bounded frequency tiers before an entry migrates to overflow.
const OPT_TIERS: usize = 10;

struct OptEntry<K, V> {
    key: K,
    value: V,
    use_count: usize,
    prev: usize,
    next: usize,
}

pub struct LfuOptCache<K, V> {
    limit: usize,
    map: HashMap<K, usize>,
    overflow: HashMap<K, V>,
    entries: Vec<OptEntry<K, V>>,
    free: Vec<usize>,
    /// (head, tail) per frequency tier.
    tiers: [(usize, usize); OPT_TIERS],
}

impl<K: Eq + Hash + Clone, V: Clone> LfuOptCache<K, V> {
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "cache needs a nonzero capacity");
        Self {
            limit,
            map: HashMap::new(),
            overflow: HashMap::new(),
            entries: Vec::new(),
            free: Vec::new(),
            tiers: [(NIL, NIL); OPT_TIERS],
        }
    }

    fn detach(&mut self, e: usize) {
        let tier = self.entries[e].use_count;
        let (prev, next) = (self.entries[e].prev, self.entries[e].next);
        if prev != NIL {
            self.entries[prev].next = next;
        } else {
            self.tiers[tier].0 = next;
        }
        if next != NIL {
            self.entries[next].prev = prev;
        } else {
            self.tiers[tier].1 = prev;
        }
    }

    fn push_front(&mut self, tier: usize, e: usize) {
        let head = self.tiers[tier].0;
        self.entries[e].use_count = tier;
        self.entries[e].prev = NIL;
        self.entries[e].next = head;
        if head != NIL {
            self.entries[head].prev = e;
        } else {
            self.tiers[tier].1 = e;
        }
        self.tiers[tier].0 = e;
    }

    /// Evict from the lowest occupied tier; a no-op when every resident has
    /// migrated to overflow.
    fn evict(&mut self) {
        for tier in 0..OPT_TIERS {
            let victim = self.tiers[tier].1;
            if victim != NIL {
                self.detach(victim);
                self.map.remove(&self.entries[victim].key);
                self.free.push(victim);
                return;
            }
        }
    }
}

impl<K, V> EvictionCache<K, V> for LfuOptCache<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Clone + Send,
{
    fn size(&self) -> usize {
        self.map.len() + self.overflow.len()
    }

    fn capacity(&self) -> usize {
        self.limit
    }

    fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key) || self.overflow.contains_key(key)
    }

    fn insert(&mut self, key: K, value: V) {
        if let Some(existing) = self.overflow.get_mut(&key) {
            *existing = value;
            return;
        }
        if let Some(&e) = self.map.get(&key) {
            self.entries[e].value = value;
            return;
        }
        if self.size() == self.limit {
            if self.map.is_empty() {
                // Everything is pinned in overflow; drop the newcomer.
                return;
            }
            self.evict();
        }
        let e = if let Some(idx) = self.free.pop() {
            self.entries[idx] = OptEntry {
                key: key.clone(),
                value,
                use_count: 0,
                prev: NIL,
                next: NIL,
            };
            idx
        } else {
            self.entries.push(OptEntry {
                key: key.clone(),
                value,
                use_count: 0,
                prev: NIL,
                next: NIL,
            });
            self.entries.len() - 1
        };
        self.push_front(0, e);
        self.map.insert(key, e);
    }

    fn lookup(&mut self, key: &K) -> Option<V> {
        if let Some(value) = self.overflow.get(key) {
            return Some(value.clone());
        }
        let e = *self.map.get(key)?;
        let value = self.entries[e].value.clone();
        if self.entries[e].use_count + 1 < OPT_TIERS {
            let next_tier = self.entries[e].use_count + 1;
            self.detach(e);
            self.push_front(next_tier, e);
        } else {
            self.detach(e);
            self.map.remove(key);
            self.overflow.insert(key.clone(), value.clone());
            self.free.push(e);
        }
        Some(value)
    }
}
