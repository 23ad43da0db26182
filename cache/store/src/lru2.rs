//! Sharded two-queue LRU store.
//!
//! Keys hash (BKDR) onto a power-of-two set of shards. Each shard owns two
//! fixed-capacity sub-caches: L1 admits every write, L2 holds entries that
//! were read at least once. A read hit in L1 promotes the entry to L2; a
//! hit in L2 refreshes its recency.
//!
//! Each sub-cache is an array of pre-allocated slots threaded onto an
//! index-based doubly-linked list: `dlnk[i] = [pred, suc]` with slot 0 as
//! the head/tail sentinel and payload slots addressed 1-based. Inserting
//! into a full sub-cache replaces the tail slot in place, so the hot path
//! never allocates. Deleting zeroes the slot's expiration stamp and parks
//! the slot at the tail for reuse.

use crate::{EvictionCallback, Measured, Options, Store, StoreError, spawn_cleanup};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const PRED: usize = 0;
const SUC: usize = 1;

/// Expiration stamp for entries that never expire. Slots with a stamp of
/// zero are vacant or deleted.
const NEVER: i64 = i64::MAX;

/// Coarse monotonic clock: nanoseconds since first use.
mod clock {
    use std::sync::OnceLock;
    use std::time::Instant;

    static START: OnceLock<Instant> = OnceLock::new();

    pub fn now() -> i64 {
        let start = *START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as i64 + 1
    }
}

/// BKDR string hash.
fn bkdr_hash(key: &str) -> u32 {
    let mut hash: u32 = 0;
    for byte in key.bytes() {
        hash = hash.wrapping_mul(131).wrapping_add(byte as u32);
    }
    hash
}

/// Smallest power-of-two-minus-one mask covering `cap`.
fn mask_of_next_pow2(cap: u16) -> u16 {
    if cap > 0 && cap & (cap - 1) == 0 {
        return cap - 1;
    }
    let mut cap = cap;
    cap |= cap >> 1;
    cap |= cap >> 2;
    cap |= cap >> 4;
    cap | (cap >> 8)
}

struct Node<V> {
    key: String,
    value: Option<V>,
    expire_at: i64,
}

/// Fixed-capacity sub-cache over pre-allocated slots.
struct SubCache<V> {
    dlnk: Vec<[u16; 2]>,
    slots: Vec<Node<V>>,
    map: HashMap<String, u16>,
    last: u16,
}

impl<V: Measured + Clone> SubCache<V> {
    fn with_capacity(cap: u16) -> Self {
        let cap = cap.max(1);
        let mut slots = Vec::new();
        slots.resize_with(cap as usize, || Node {
            key: String::new(),
            value: None,
            expire_at: 0,
        });
        Self {
            dlnk: vec![[0, 0]; cap as usize + 1],
            slots,
            map: HashMap::with_capacity(cap as usize),
            last: 0,
        }
    }

    /// Insert or update. Returns true for a fresh insertion. When the
    /// sub-cache is full the tail slot is replaced in place; a still-live
    /// tail is reported to `on_evicted`.
    fn put(
        &mut self,
        key: &str,
        value: V,
        expire_at: i64,
        on_evicted: Option<&EvictionCallback<V>>,
        now: i64,
    ) -> bool {
        if let Some(&idx) = self.map.get(key) {
            let node = &mut self.slots[idx as usize - 1];
            node.value = Some(value);
            node.expire_at = expire_at;
            self.adjust(idx, PRED, SUC);
            return false;
        }

        if self.last as usize == self.slots.len() {
            let tail_idx = self.dlnk[0][PRED];
            let tail = &mut self.slots[tail_idx as usize - 1];
            let old_key = std::mem::take(&mut tail.key);
            let old_value = tail.value.take();

            if let (Some(cb), Some(old_value)) = (on_evicted, old_value.as_ref())
                && tail.expire_at > 0
                && now < tail.expire_at
            {
                cb(&old_key, old_value);
            }

            let tail = &mut self.slots[tail_idx as usize - 1];
            tail.key = key.to_string();
            tail.value = Some(value);
            tail.expire_at = expire_at;

            self.map.remove(&old_key);
            self.map.insert(key.to_string(), tail_idx);
            self.adjust(tail_idx, PRED, SUC);
            return true;
        }

        self.last += 1;
        let idx = self.last;
        if self.map.is_empty() {
            self.dlnk[0][PRED] = idx;
        } else {
            let head = self.dlnk[0][SUC];
            self.dlnk[head as usize][PRED] = idx;
        }
        self.dlnk[idx as usize] = [0, self.dlnk[0][SUC]];
        self.dlnk[0][SUC] = idx;

        self.map.insert(key.to_string(), idx);
        let node = &mut self.slots[idx as usize - 1];
        node.key = key.to_string();
        node.value = Some(value);
        node.expire_at = expire_at;
        true
    }

    /// Move slot `idx` to the list head (`p = PRED`) or tail (`p = SUC`).
    fn adjust(&mut self, idx: u16, p: usize, s: usize) {
        if self.dlnk[idx as usize][p] == 0 {
            return;
        }
        let prev = self.dlnk[idx as usize][p];
        let next = self.dlnk[idx as usize][s];
        self.dlnk[next as usize][p] = prev;
        self.dlnk[prev as usize][s] = next;

        let head = self.dlnk[0][s];
        self.dlnk[idx as usize][p] = 0;
        self.dlnk[idx as usize][s] = head;
        self.dlnk[head as usize][p] = idx;
        self.dlnk[0][s] = idx;
    }

    /// Look up a live entry, refreshing its recency.
    fn get(&mut self, key: &str) -> Option<(V, i64)> {
        let &idx = self.map.get(key)?;
        let node = &self.slots[idx as usize - 1];
        if node.expire_at <= 0 {
            return None;
        }
        let found = node.value.clone().map(|v| (v, node.expire_at));
        self.adjust(idx, PRED, SUC);
        found
    }

    /// Mark a live entry deleted and park its slot at the tail for reuse.
    /// Returns the entry's value and former expiration stamp.
    fn del(&mut self, key: &str) -> Option<(V, i64)> {
        let &idx = self.map.get(key)?;
        let node = &mut self.slots[idx as usize - 1];
        if node.expire_at <= 0 {
            return None;
        }
        let expire_at = node.expire_at;
        node.expire_at = 0;
        let value = node.value.clone();
        self.adjust(idx, SUC, PRED);
        value.map(|v| (v, expire_at))
    }

    /// Visit live entries in recency order. Deleted slots are parked at
    /// the tail, so the walk stops at the first dead slot.
    fn walk(&self, mut f: impl FnMut(&str, &V, i64) -> bool) {
        let mut idx = self.dlnk[0][SUC];
        while idx != 0 {
            let node = &self.slots[idx as usize - 1];
            if node.expire_at <= 0 {
                return;
            }
            let Some(value) = &node.value else {
                return;
            };
            if !f(&node.key, value, node.expire_at) {
                return;
            }
            idx = self.dlnk[idx as usize][SUC];
        }
    }
}

struct Shard<V> {
    l1: SubCache<V>,
    l2: SubCache<V>,
}

struct Inner<V> {
    shards: Vec<Mutex<Shard<V>>>,
    mask: u32,
    on_evicted: Option<EvictionCallback<V>>,
    closed: AtomicBool,
}

/// Sharded two-queue LRU store.
pub struct Lru2Store<V: Measured + Clone + Send + Sync + 'static> {
    inner: Arc<Inner<V>>,
    shutdown: Mutex<Option<crossbeam_channel::Sender<()>>>,
}

impl<V: Measured + Clone + Send + Sync + 'static> Lru2Store<V> {
    /// Create a store and start its background expiration sweeper.
    pub fn new(opts: Options<V>) -> Self {
        let bucket_count = if opts.bucket_count == 0 {
            16
        } else {
            opts.bucket_count
        };
        let cap_per_bucket = if opts.cap_per_bucket == 0 {
            1024
        } else {
            opts.cap_per_bucket
        };
        let level2_cap = if opts.level2_cap == 0 {
            1024
        } else {
            opts.level2_cap
        };
        let cleanup_interval = if opts.cleanup_interval.is_zero() {
            Duration::from_secs(60)
        } else {
            opts.cleanup_interval
        };

        let mask = mask_of_next_pow2(bucket_count);
        let mut shards = Vec::with_capacity(mask as usize + 1);
        for _ in 0..=mask {
            shards.push(Mutex::new(Shard {
                l1: SubCache::with_capacity(cap_per_bucket),
                l2: SubCache::with_capacity(level2_cap),
            }));
        }

        let inner = Arc::new(Inner {
            shards,
            mask: mask as u32,
            on_evicted: opts.on_evicted,
            closed: AtomicBool::new(false),
        });

        let shutdown = spawn_cleanup(
            "lru2-cleanup",
            Arc::downgrade(&inner),
            cleanup_interval,
            |inner: &Inner<V>| inner.sweep_expired(),
        );

        Self {
            inner,
            shutdown: Mutex::new(Some(shutdown)),
        }
    }

    fn shard_for(&self, key: &str) -> &Mutex<Shard<V>> {
        let idx = bkdr_hash(key) & self.inner.mask;
        &self.inner.shards[idx as usize]
    }
}

impl<V: Measured + Clone + Send + Sync + 'static> Inner<V> {
    /// Delete from both queues. Fires the eviction callback when a
    /// still-live entry was removed. Caller holds the shard lock.
    fn delete_locked(&self, shard: &mut Shard<V>, key: &str, now: i64) -> bool {
        let from_l1 = shard.l1.del(key);
        let from_l2 = shard.l2.del(key);

        let live = from_l1
            .as_ref()
            .or(from_l2.as_ref())
            .filter(|(_, expire_at)| now < *expire_at);

        match live {
            Some((value, _)) => {
                if let Some(cb) = &self.on_evicted {
                    cb(key, value);
                }
                true
            }
            None => false,
        }
    }

    /// Drop expired entries from every shard. No callbacks: an expired
    /// entry is no longer live.
    fn sweep_expired(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            let now = clock::now();

            let mut expired = Vec::new();
            shard.l1.walk(|key: &str, _value: &V, expire_at: i64| {
                if now >= expire_at {
                    expired.push(key.to_string());
                }
                true
            });
            shard.l2.walk(|key: &str, _value: &V, expire_at: i64| {
                if now >= expire_at {
                    expired.push(key.to_string());
                }
                true
            });

            for key in expired {
                shard.l1.del(&key);
                shard.l2.del(&key);
            }
        }
    }
}

impl<V: Measured + Clone + Send + Sync + 'static> Store<V> for Lru2Store<V> {
    fn get(&self, key: &str) -> Option<V> {
        if self.inner.closed.load(Ordering::Acquire) {
            return None;
        }

        let mut shard = self.shard_for(key).lock();
        let now = clock::now();

        // An L1 hit always leaves L1: either promoted to L2 or, when
        // expired, dropped.
        if let Some((value, expire_at)) = shard.l1.del(key) {
            if now >= expire_at {
                return None;
            }
            let on_evicted = self.inner.on_evicted.as_ref();
            shard.l2.put(key, value.clone(), expire_at, on_evicted, now);
            return Some(value);
        }

        if let Some((value, expire_at)) = shard.l2.get(key) {
            if now >= expire_at {
                shard.l2.del(key);
                return None;
            }
            return Some(value);
        }

        None
    }

    fn set(&self, key: &str, value: V) -> Result<(), StoreError> {
        self.set_with_expiration(key, value, Duration::ZERO)
    }

    fn set_with_expiration(&self, key: &str, value: V, ttl: Duration) -> Result<(), StoreError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }

        let now = clock::now();
        let expire_at = if ttl.is_zero() {
            NEVER
        } else {
            now.saturating_add(ttl.as_nanos() as i64)
        };

        let mut shard = self.shard_for(key).lock();
        let on_evicted = self.inner.on_evicted.as_ref();
        shard.l1.put(key, value, expire_at, on_evicted, now);
        Ok(())
    }

    fn delete(&self, key: &str) -> bool {
        let mut shard = self.shard_for(key).lock();
        let now = clock::now();
        self.inner.delete_locked(&mut shard, key, now)
    }

    fn clear(&self) {
        for shard in &self.inner.shards {
            let mut shard = shard.lock();
            let now = clock::now();

            let mut keys = Vec::new();
            shard.l1.walk(|key, _value, _expire_at| {
                keys.push(key.to_string());
                true
            });
            shard.l2.walk(|key, _value, _expire_at| {
                keys.push(key.to_string());
                true
            });

            for key in keys {
                self.inner.delete_locked(&mut shard, &key, now);
            }
        }
    }

    fn len(&self) -> usize {
        let mut count = 0;
        for shard in &self.inner.shards {
            let shard = shard.lock();
            shard.l1.walk(|_, _, _| {
                count += 1;
                true
            });
            shard.l2.walk(|_, _, _| {
                count += 1;
                true
            });
        }
        count
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn small_opts() -> Options<String> {
        Options::new()
            .with_bucket_count(1)
            .with_cap_per_bucket(4)
            .with_level2_cap(2)
    }

    #[test]
    fn test_get_miss_and_hit() {
        let store = Lru2Store::new(Options::default());

        assert!(store.get("missing").is_none());
        store.set("k", "v".to_string()).unwrap();
        assert_eq!(store.get("k").as_deref(), Some("v"));
        // Second read comes from L2.
        assert_eq!(store.get("k").as_deref(), Some("v"));
        store.close();
    }

    #[test]
    fn test_expired_entry_is_missing() {
        let store = Lru2Store::new(Options::default());

        store
            .set_with_expiration("k", "v".to_string(), Duration::from_millis(1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.get("k").is_none());
        store.close();
    }

    #[test]
    fn test_expired_in_l2_is_missing() {
        let store = Lru2Store::new(Options::default());

        store
            .set_with_expiration("k", "v".to_string(), Duration::from_millis(20))
            .unwrap();
        // Promote to L2 while live.
        assert!(store.get("k").is_some());
        std::thread::sleep(Duration::from_millis(30));
        assert!(store.get("k").is_none());
        store.close();
    }

    #[test]
    fn test_set_updates_in_place() {
        let store = Lru2Store::new(small_opts());

        store.set("k", "old".to_string()).unwrap();
        store.set("k", "new".to_string()).unwrap();
        assert_eq!(store.get("k").as_deref(), Some("new"));
        assert_eq!(store.len(), 1);
        store.close();
    }

    #[test]
    fn test_full_l1_replaces_tail() {
        let evicted: Arc<PlMutex<Vec<String>>> = Arc::new(PlMutex::new(Vec::new()));
        let seen = evicted.clone();
        let store = Lru2Store::new(small_opts().with_on_evicted(Arc::new(
            move |key: &str, _value: &String| {
                seen.lock().push(key.to_string());
            },
        )));

        for i in 0..4 {
            store.set(&format!("key-{i}"), format!("value-{i}")).unwrap();
        }
        // L1 is full; the next insert replaces the coldest slot (key-0).
        store.set("key-4", "value-4".to_string()).unwrap();

        assert!(store.get("key-0").is_none());
        assert_eq!(*evicted.lock(), vec!["key-0".to_string()]);
        store.close();
    }

    #[test]
    fn test_promotion_keeps_hot_entry() {
        let store = Lru2Store::new(small_opts());

        store.set("hot", "v".to_string()).unwrap();
        // Promote to L2.
        assert!(store.get("hot").is_some());

        // Churn enough inserts through L1 to replace every L1 slot.
        for i in 0..8 {
            store.set(&format!("cold-{i}"), "x".to_string()).unwrap();
        }

        assert_eq!(store.get("hot").as_deref(), Some("v"));
        store.close();
    }

    #[test]
    fn test_delete() {
        let evicted: Arc<PlMutex<Vec<(String, String)>>> = Arc::new(PlMutex::new(Vec::new()));
        let seen = evicted.clone();
        let store = Lru2Store::new(Options::<String>::default().with_on_evicted(Arc::new(
            move |key: &str, value: &String| {
                seen.lock().push((key.to_string(), value.clone()));
            },
        )));

        store.set("k", "v".to_string()).unwrap();
        assert!(store.delete("k"));
        assert!(!store.delete("k"));
        assert!(store.get("k").is_none());
        assert_eq!(*evicted.lock(), vec![("k".to_string(), "v".to_string())]);
        store.close();
    }

    #[test]
    fn test_delete_promoted_entry() {
        let store = Lru2Store::new(Options::default());

        store.set("k", "v".to_string()).unwrap();
        assert!(store.get("k").is_some());
        assert!(store.delete("k"));
        assert!(store.get("k").is_none());
        store.close();
    }

    #[test]
    fn test_clear_and_len() {
        let store = Lru2Store::new(Options::default());

        for i in 0..10 {
            store.set(&format!("key-{i}"), "v".to_string()).unwrap();
        }
        assert_eq!(store.len(), 10);

        store.clear();
        assert_eq!(store.len(), 0);
        assert!(store.get("key-3").is_none());
        store.close();
    }

    #[test]
    fn test_background_cleanup_removes_expired() {
        let store = Lru2Store::new(
            Options::default().with_cleanup_interval(Duration::from_millis(10)),
        );

        store
            .set_with_expiration("k", "v".to_string(), Duration::from_millis(1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(store.len(), 0);
        store.close();
    }

    #[test]
    fn test_close_is_idempotent() {
        let store = Lru2Store::new(Options::default());
        store.set("k", "v".to_string()).unwrap();

        store.close();
        store.close();

        assert!(store.get("k").is_none());
        assert_eq!(store.set("x", "y".to_string()), Err(StoreError::Closed));
    }

    #[test]
    fn test_keys_spread_across_shards() {
        let mut hit = std::collections::HashSet::new();
        let mask = mask_of_next_pow2(16) as u32;
        for i in 0..1000 {
            hit.insert(bkdr_hash(&format!("key-{i}")) & mask);
        }
        // All 16 shards should see traffic.
        assert_eq!(hit.len(), 16);
    }

    #[test]
    fn test_mask_of_next_pow2() {
        assert_eq!(mask_of_next_pow2(1), 0);
        assert_eq!(mask_of_next_pow2(2), 1);
        assert_eq!(mask_of_next_pow2(3), 3);
        assert_eq!(mask_of_next_pow2(16), 15);
        assert_eq!(mask_of_next_pow2(17), 31);
    }

    #[test]
    fn test_concurrent_access() {
        let store = Arc::new(Lru2Store::new(Options::default()));
        let mut handles = Vec::new();

        for w in 0..4 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let key = format!("key-{}", i % 20);
                    store.set(&key, format!("value-{w}-{i}")).unwrap();
                    store.get(&key);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        for i in 0..20 {
            assert!(store.get(&format!("key-{i}")).is_some());
        }
        store.close();
    }
}
