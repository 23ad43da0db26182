//! Single-list LRU store.
//!
//! Entries live in an index-linked slab: a `Vec` of slots carrying
//! prev/next indices, with freed slots kept on a free list so steady-state
//! churn does not allocate. The list front is the least-recently-used
//! entry; `get` and `set` move the touched entry to the back.

use crate::{EvictionCallback, Measured, Options, Store, StoreError, spawn_cleanup};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Sentinel index for "no slot".
const NIL: usize = usize::MAX;

struct Slot<V> {
    key: String,
    value: Option<V>,
    expire_at: Option<Instant>,
    prev: usize,
    next: usize,
}

struct State<V> {
    slots: Vec<Slot<V>>,
    free: Vec<usize>,
    map: HashMap<String, usize>,
    head: usize,
    tail: usize,
    used_bytes: usize,
    max_bytes: usize,
}

struct Inner<V> {
    state: Mutex<State<V>>,
    on_evicted: Option<EvictionCallback<V>>,
    closed: AtomicBool,
}

/// Byte-budgeted LRU store with per-entry expiration.
pub struct LruStore<V: Measured + Clone + Send + Sync + 'static> {
    inner: Arc<Inner<V>>,
    shutdown: Mutex<Option<crossbeam_channel::Sender<()>>>,
}

impl<V: Measured + Clone + Send + Sync + 'static> LruStore<V> {
    /// Create a store and start its background expiration sweeper.
    pub fn new(opts: Options<V>) -> Self {
        let mut cleanup_interval = opts.cleanup_interval;
        if cleanup_interval.is_zero() {
            cleanup_interval = Duration::from_secs(60);
        }

        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                slots: Vec::new(),
                free: Vec::new(),
                map: HashMap::new(),
                head: NIL,
                tail: NIL,
                used_bytes: 0,
                max_bytes: opts.max_bytes,
            }),
            on_evicted: opts.on_evicted,
            closed: AtomicBool::new(false),
        });

        let shutdown = spawn_cleanup(
            "lru-cleanup",
            Arc::downgrade(&inner),
            cleanup_interval,
            |inner: &Inner<V>| {
                let mut state = inner.state.lock();
                inner.evict(&mut state);
            },
        );

        Self {
            inner,
            shutdown: Mutex::new(Some(shutdown)),
        }
    }

    /// Expiration deadline for `key`, if one is set.
    pub fn get_expiration(&self, key: &str) -> Option<Instant> {
        let state = self.inner.state.lock();
        let idx = *state.map.get(key)?;
        state.slots[idx].expire_at
    }

    /// Replace the expiration of an existing entry. A zero `ttl` removes
    /// the deadline. Returns whether the entry exists.
    pub fn update_expiration(&self, key: &str, ttl: Duration) -> bool {
        let mut state = self.inner.state.lock();
        let Some(&idx) = state.map.get(key) else {
            return false;
        };
        state.slots[idx].expire_at = expire_at_for(ttl);
        true
    }

    /// Bytes currently charged against the budget.
    pub fn used_bytes(&self) -> usize {
        self.inner.state.lock().used_bytes
    }

    /// Current byte budget. 0 means unbounded.
    pub fn max_bytes(&self) -> usize {
        self.inner.state.lock().max_bytes
    }

    /// Replace the byte budget and trim immediately if the new budget is
    /// exceeded.
    pub fn set_max_bytes(&self, max_bytes: usize) {
        let mut state = self.inner.state.lock();
        state.max_bytes = max_bytes;
        if max_bytes > 0 {
            self.inner.evict(&mut state);
        }
    }
}

fn expire_at_for(ttl: Duration) -> Option<Instant> {
    if ttl.is_zero() {
        None
    } else {
        Some(Instant::now() + ttl)
    }
}

impl<V: Measured + Clone + Send + Sync + 'static> Store<V> for LruStore<V> {
    fn get(&self, key: &str) -> Option<V> {
        if self.inner.closed.load(Ordering::Acquire) {
            return None;
        }

        let mut state = self.inner.state.lock();
        let idx = *state.map.get(key)?;

        if let Some(deadline) = state.slots[idx].expire_at
            && Instant::now() >= deadline
        {
            self.inner.remove_slot(&mut state, idx);
            return None;
        }

        let value = state.slots[idx].value.clone();
        state.move_to_back(idx);
        value
    }

    fn set(&self, key: &str, value: V) -> Result<(), StoreError> {
        self.set_with_expiration(key, value, Duration::ZERO)
    }

    fn set_with_expiration(&self, key: &str, value: V, ttl: Duration) -> Result<(), StoreError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }

        let expire_at = expire_at_for(ttl);
        let mut state = self.inner.state.lock();

        if let Some(&idx) = state.map.get(key) {
            let new_size = value.size();
            let slot = &mut state.slots[idx];
            let old_size = slot.value.as_ref().map(Measured::size).unwrap_or(0);
            slot.value = Some(value);
            slot.expire_at = expire_at;
            state.used_bytes = state.used_bytes + new_size - old_size;
            state.move_to_back(idx);
            return Ok(());
        }

        let charged = key.len() + value.size();
        let idx = state.alloc_slot(key.to_string(), value, expire_at);
        state.map.insert(key.to_string(), idx);
        state.push_back(idx);
        state.used_bytes += charged;

        self.inner.evict(&mut state);
        Ok(())
    }

    fn delete(&self, key: &str) -> bool {
        let mut state = self.inner.state.lock();
        let Some(&idx) = state.map.get(key) else {
            return false;
        };
        self.inner.remove_slot(&mut state, idx);
        true
    }

    fn clear(&self) {
        let mut state = self.inner.state.lock();

        if let Some(cb) = &self.inner.on_evicted {
            let mut idx = state.head;
            while idx != NIL {
                let slot = &state.slots[idx];
                if let Some(value) = &slot.value {
                    cb(&slot.key, value);
                }
                idx = slot.next;
            }
        }

        state.slots.clear();
        state.free.clear();
        state.map.clear();
        state.head = NIL;
        state.tail = NIL;
        state.used_bytes = 0;
    }

    fn len(&self) -> usize {
        self.inner.state.lock().map.len()
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the sender disconnects the sweeper's channel.
        self.shutdown.lock().take();
    }
}

impl<V> State<V> {
    fn alloc_slot(&mut self, key: String, value: V, expire_at: Option<Instant>) -> usize {
        match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx];
                slot.key = key;
                slot.value = Some(value);
                slot.expire_at = expire_at;
                slot.prev = NIL;
                slot.next = NIL;
                idx
            }
            None => {
                self.slots.push(Slot {
                    key,
                    value: Some(value),
                    expire_at,
                    prev: NIL,
                    next: NIL,
                });
                self.slots.len() - 1
            }
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = &self.slots[idx];
            (slot.prev, slot.next)
        };

        if prev == NIL {
            self.head = next;
        } else {
            self.slots[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.slots[next].prev = prev;
        }
    }

    fn push_back(&mut self, idx: usize) {
        let old_tail = self.tail;
        self.slots[idx].prev = old_tail;
        self.slots[idx].next = NIL;
        if old_tail == NIL {
            self.head = idx;
        } else {
            self.slots[old_tail].next = idx;
        }
        self.tail = idx;
    }

    fn move_to_back(&mut self, idx: usize) {
        if self.tail == idx {
            return;
        }
        self.unlink(idx);
        self.push_back(idx);
    }
}

impl<V: Measured> Inner<V> {
    /// Remove a slot, adjust accounting, and fire the eviction callback.
    /// Caller holds the state lock.
    fn remove_slot(&self, state: &mut State<V>, idx: usize) {
        state.unlink(idx);

        let slot = &mut state.slots[idx];
        let key = std::mem::take(&mut slot.key);
        let value = slot.value.take();
        slot.expire_at = None;

        state.map.remove(&key);
        state.free.push(idx);

        if let Some(value) = value {
            state.used_bytes -= key.len() + value.size();
            if let Some(cb) = &self.on_evicted {
                cb(&key, &value);
            }
        }
    }

    /// Remove expired entries, then trim from the LRU end until the byte
    /// budget is met. Caller holds the state lock.
    fn evict(&self, state: &mut State<V>) {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut idx = state.head;
        while idx != NIL {
            let slot = &state.slots[idx];
            if let Some(deadline) = slot.expire_at
                && now >= deadline
            {
                expired.push(idx);
            }
            idx = slot.next;
        }
        for idx in expired {
            self.remove_slot(state, idx);
        }

        while state.max_bytes > 0 && state.used_bytes > state.max_bytes && state.head != NIL {
            let front = state.head;
            self.remove_slot(state, front);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn new_lru(opts: Options<String>) -> LruStore<String> {
        LruStore::new(opts)
    }

    #[test]
    fn test_get_miss_and_hit() {
        let lru = new_lru(Options::default());

        assert!(lru.get("non-existent-key").is_none());

        lru.set("test-key", "test-value".to_string()).unwrap();
        assert_eq!(lru.get("test-key").as_deref(), Some("test-value"));
        lru.close();
    }

    #[test]
    fn test_get_expired() {
        let lru = new_lru(Options::default());

        lru.set_with_expiration("k", "v".to_string(), Duration::from_millis(1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(lru.get("k").is_none());
        assert_eq!(lru.len(), 0);
        lru.close();
    }

    #[test]
    fn test_set_replaces_value() {
        let lru = new_lru(Options::default());

        lru.set("test-key", "test-value".to_string()).unwrap();
        lru.set("test-key", "new-test-value".to_string()).unwrap();
        assert_eq!(lru.get("test-key").as_deref(), Some("new-test-value"));
        assert_eq!(lru.len(), 1);
        lru.close();
    }

    #[test]
    fn test_set_is_idempotent_for_used_bytes() {
        let lru = new_lru(Options::default());

        lru.set("k", "v".to_string()).unwrap();
        lru.set("k", "v".to_string()).unwrap();
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.used_bytes(), "k".len() + "v".len());
        lru.close();
    }

    #[test]
    fn test_eviction_by_budget() {
        let cap = "key1".len() + "value1".len() + "key2".len() + "value2".len();
        let evicted: Arc<PlMutex<Vec<String>>> = Arc::new(PlMutex::new(Vec::new()));
        let seen = evicted.clone();

        let lru = new_lru(
            Options::new()
                .with_max_bytes(cap)
                .with_on_evicted(Arc::new(move |key: &str, _value: &String| {
                    seen.lock().push(key.to_string());
                })),
        );

        lru.set("key1", "value1".to_string()).unwrap();
        lru.set("key2", "value2".to_string()).unwrap();
        lru.set("key3", "value3".to_string()).unwrap();

        assert!(lru.get("key1").is_none());
        assert_eq!(lru.len(), 2);
        assert_eq!(*evicted.lock(), vec!["key1".to_string()]);
        lru.close();
    }

    #[test]
    fn test_get_refreshes_recency() {
        let cap = 2 * ("keyX".len() + "valueX".len());
        let lru = new_lru(Options::new().with_max_bytes(cap));

        lru.set("key1", "value1".to_string()).unwrap();
        lru.set("key2", "value2".to_string()).unwrap();
        // Touch key1 so key2 becomes the eviction candidate.
        assert!(lru.get("key1").is_some());
        lru.set("key3", "value3".to_string()).unwrap();

        assert!(lru.get("key1").is_some());
        assert!(lru.get("key2").is_none());
        assert!(lru.get("key3").is_some());
        lru.close();
    }

    #[test]
    fn test_delete_fires_callback_once() {
        let evicted: Arc<PlMutex<Vec<(String, String)>>> = Arc::new(PlMutex::new(Vec::new()));
        let seen = evicted.clone();

        let lru = new_lru(Options::new().with_on_evicted(Arc::new(
            move |key: &str, value: &String| {
                seen.lock().push((key.to_string(), value.clone()));
            },
        )));

        lru.set("k", "v".to_string()).unwrap();
        assert!(lru.delete("k"));
        assert!(!lru.delete("k"));
        assert!(lru.get("k").is_none());
        assert_eq!(*evicted.lock(), vec![("k".to_string(), "v".to_string())]);
        lru.close();
    }

    #[test]
    fn test_clear_resets_everything() {
        let lru = new_lru(Options::default());

        lru.set("a", "1".to_string()).unwrap();
        lru.set("b", "2".to_string()).unwrap();
        lru.clear();

        assert_eq!(lru.len(), 0);
        assert_eq!(lru.used_bytes(), 0);
        assert!(lru.get("a").is_none());
        lru.close();
    }

    #[test]
    fn test_close_is_idempotent() {
        let lru = new_lru(Options::default());
        lru.set("k", "v".to_string()).unwrap();

        lru.close();
        lru.close();

        assert!(lru.get("k").is_none());
        assert_eq!(lru.set("k2", "v".to_string()), Err(StoreError::Closed));
    }

    #[test]
    fn test_update_expiration() {
        let lru = new_lru(Options::default());

        lru.set("k", "v".to_string()).unwrap();
        assert!(lru.get_expiration("k").is_none());

        assert!(lru.update_expiration("k", Duration::from_secs(60)));
        assert!(lru.get_expiration("k").is_some());

        assert!(lru.update_expiration("k", Duration::ZERO));
        assert!(lru.get_expiration("k").is_none());

        assert!(!lru.update_expiration("missing", Duration::from_secs(1)));
        lru.close();
    }

    #[test]
    fn test_set_max_bytes_trims() {
        let lru = new_lru(Options::new().with_max_bytes(0));

        lru.set("key1", "value1".to_string()).unwrap();
        lru.set("key2", "value2".to_string()).unwrap();
        assert_eq!(lru.len(), 2);

        lru.set_max_bytes("key2".len() + "value2".len());
        assert_eq!(lru.len(), 1);
        assert!(lru.get("key2").is_some());
        lru.close();
    }

    #[test]
    fn test_background_cleanup_removes_expired() {
        let lru = new_lru(Options::new().with_cleanup_interval(Duration::from_millis(10)));

        lru.set_with_expiration("k", "v".to_string(), Duration::from_millis(1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        // Swept without a Get touching the key.
        assert_eq!(lru.len(), 0);
        lru.close();
    }

    #[test]
    fn test_concurrent_writers() {
        let lru = Arc::new(new_lru(Options::default()));
        let mut handles = Vec::new();

        for w in 0..4 {
            let lru = lru.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    for j in 0..10 {
                        let key = format!("key-{j}");
                        let value = format!("value-{w}-{j}-{i}");
                        lru.set(&key, value).unwrap();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        for j in 0..10 {
            assert!(lru.get(&format!("key-{j}")).is_some());
        }
        lru.close();
    }
}
