//! Lazily initialized facade over a store engine.
//!
//! The backing store is built on first write, so a group that never sees
//! traffic never spawns a cleanup thread. Reads before initialization are
//! plain misses.

use crate::ByteView;
use parking_lot::Mutex;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use store::{Options, Store, new_store};

/// Hit/miss counters for a cache facade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Store facade used by a group as its main cache.
pub struct Cache {
    options: Mutex<Option<Options<ByteView>>>,
    store: OnceLock<Box<dyn Store<ByteView>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    closed: AtomicBool,
}

impl Cache {
    /// Create a facade; the store itself is built on first write.
    pub fn new(options: Options<ByteView>) -> Self {
        Self {
            options: Mutex::new(Some(options)),
            store: OnceLock::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_store(&self) -> &dyn Store<ByteView> {
        self.store
            .get_or_init(|| {
                let options = self.options.lock().take().unwrap_or_default();
                tracing::debug!(
                    cache_type = ?options.cache_type,
                    max_bytes = options.max_bytes,
                    "initializing main cache store"
                );
                new_store(options)
            })
            .as_ref()
    }

    /// Get a value. Counts a miss while the store is uninitialized or the
    /// facade is closed.
    pub fn get(&self, key: &str) -> Option<ByteView> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let Some(store) = self.store.get() else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        match store.get(key) {
            Some(view) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(view)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a value without expiration. An empty value removes the key
    /// instead.
    pub fn set(&self, key: &str, value: ByteView) {
        if self.closed.load(Ordering::Acquire) {
            tracing::warn!(key, "set on closed cache ignored");
            return;
        }
        if value.is_empty() {
            self.delete(key);
            return;
        }
        if let Err(e) = self.ensure_store().set(key, value) {
            tracing::warn!(key, "cache set failed: {e}");
        }
    }

    /// Insert a value with a time-to-live. A zero `ttl` never expires; an
    /// empty value removes the key instead.
    pub fn set_with_expiration(&self, key: &str, value: ByteView, ttl: Duration) {
        if self.closed.load(Ordering::Acquire) {
            tracing::warn!(key, "set on closed cache ignored");
            return;
        }
        if value.is_empty() {
            self.delete(key);
            return;
        }
        if let Err(e) = self.ensure_store().set_with_expiration(key, value, ttl) {
            tracing::warn!(key, "cache set failed: {e}");
        }
    }

    /// Remove a key. Returns whether a live entry was removed.
    pub fn delete(&self, key: &str) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.store.get() {
            Some(store) => store.delete(key),
            None => false,
        }
    }

    /// Remove every entry.
    pub fn clear(&self) {
        if let Some(store) = self.store.get() {
            store.clear();
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.store.get().map(|store| store.len()).unwrap_or(0)
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hit/miss counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Close the facade and the backing store. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(store) = self.store.get() {
            store.close();
        }
    }
}
