//! Expiration-aware, byte-budgeted in-memory store engines.
//!
//! This crate provides the local storage layer for a cache node. Two engines
//! implement the common [`Store`] contract:
//!
//! - [`LruStore`]: a single recency list over an index-linked slab, guarded
//!   by one mutex. Eviction removes expired entries first, then trims from
//!   the least-recently-used end until the byte budget is met.
//! - [`Lru2Store`]: a sharded two-queue variant. Each shard owns an
//!   admission queue (L1) and a hot queue (L2) built from fixed-capacity
//!   slot arrays, so the hot path never allocates.
//!
//! Values are anything implementing [`Measured`]; the store charges
//! `key.len() + value.size()` bytes per entry against its budget.
//!
//! # Example
//!
//! ```
//! use store::{new_store, Options, Store};
//! use std::time::Duration;
//!
//! let store = new_store::<String>(Options::default());
//! store.set("answer", "42".to_string()).unwrap();
//! assert_eq!(store.get("answer").as_deref(), Some("42"));
//!
//! store.set_with_expiration("blip", "x".to_string(), Duration::from_millis(1)).unwrap();
//! std::thread::sleep(Duration::from_millis(5));
//! assert!(store.get("blip").is_none());
//! store.close();
//! ```

mod lru;
mod lru2;

pub use lru::LruStore;
pub use lru2::Lru2Store;

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// A value the store can account for. `size` is the number of bytes the
/// value is charged against the store's byte budget.
pub trait Measured {
    /// Size of the value in bytes.
    fn size(&self) -> usize;
}

impl Measured for String {
    fn size(&self) -> usize {
        self.len()
    }
}

impl Measured for Vec<u8> {
    fn size(&self) -> usize {
        self.len()
    }
}

/// Callback invoked when a live entry leaves the store (budget eviction,
/// explicit delete, or clear). Runs while the owning shard's lock is held,
/// so it must not call back into the store.
pub type EvictionCallback<V> = Arc<dyn Fn(&str, &V) + Send + Sync>;

/// Errors surfaced by store operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store has been closed.
    #[error("store is closed")]
    Closed,
}

/// Store engine selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// Single-list LRU.
    #[default]
    Lru,
    /// Sharded two-queue LRU.
    Lru2,
}

/// Store configuration.
///
/// Loadable from TOML; the eviction callback is attached programmatically
/// via [`Options::with_on_evicted`].
#[derive(Deserialize)]
#[serde(deny_unknown_fields, bound(deserialize = ""))]
pub struct Options<V> {
    /// Engine selection: "lru" or "lru2".
    #[serde(default)]
    pub cache_type: CacheType,

    /// Byte budget. 0 means unbounded.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// Number of shards (lru2). Rounded up to the next power of two.
    #[serde(default = "default_bucket_count")]
    pub bucket_count: u16,

    /// L1 (admission queue) capacity per shard (lru2).
    #[serde(default = "default_cap_per_bucket")]
    pub cap_per_bucket: u16,

    /// L2 (hot queue) capacity per shard (lru2).
    #[serde(default = "default_level2_cap")]
    pub level2_cap: u16,

    /// Interval between background expiration sweeps.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: Duration,

    /// Eviction callback. Not deserialized.
    #[serde(skip)]
    pub on_evicted: Option<EvictionCallback<V>>,
}

fn default_max_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_bucket_count() -> u16 {
    16
}

fn default_cap_per_bucket() -> u16 {
    512
}

fn default_level2_cap() -> u16 {
    256
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

impl<V> Default for Options<V> {
    fn default() -> Self {
        Self {
            cache_type: CacheType::default(),
            max_bytes: default_max_bytes(),
            bucket_count: default_bucket_count(),
            cap_per_bucket: default_cap_per_bucket(),
            level2_cap: default_level2_cap(),
            cleanup_interval: default_cleanup_interval(),
            on_evicted: None,
        }
    }
}

impl<V> Options<V> {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the store engine.
    pub fn with_cache_type(mut self, cache_type: CacheType) -> Self {
        self.cache_type = cache_type;
        self
    }

    /// Set the byte budget. 0 means unbounded.
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Set the shard count (lru2).
    pub fn with_bucket_count(mut self, count: u16) -> Self {
        self.bucket_count = count;
        self
    }

    /// Set the L1 capacity per shard (lru2).
    pub fn with_cap_per_bucket(mut self, cap: u16) -> Self {
        self.cap_per_bucket = cap;
        self
    }

    /// Set the L2 capacity per shard (lru2).
    pub fn with_level2_cap(mut self, cap: u16) -> Self {
        self.level2_cap = cap;
        self
    }

    /// Set the background cleanup interval.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Attach an eviction callback.
    pub fn with_on_evicted(mut self, cb: EvictionCallback<V>) -> Self {
        self.on_evicted = Some(cb);
        self
    }
}

/// Common contract for store engines.
///
/// # Thread safety
///
/// Implementations are `Send + Sync`; every operation may be called
/// concurrently from any thread.
pub trait Store<V: Measured>: Send + Sync {
    /// Get the value for `key` if it is live and not expired.
    ///
    /// A hit refreshes the entry's recency. An expired entry is treated as
    /// missing and removed.
    fn get(&self, key: &str) -> Option<V>;

    /// Insert or replace `key` with a value that never expires.
    fn set(&self, key: &str, value: V) -> Result<(), StoreError>;

    /// Insert or replace `key` with a time-to-live. A zero `ttl` means the
    /// entry never expires.
    fn set_with_expiration(&self, key: &str, value: V, ttl: Duration) -> Result<(), StoreError>;

    /// Remove `key` if present, firing the eviction callback for a live
    /// entry. Returns whether a live entry was removed.
    fn delete(&self, key: &str) -> bool;

    /// Remove every entry, firing the eviction callback for each.
    fn clear(&self);

    /// Number of live entries.
    fn len(&self) -> usize;

    /// Whether the store holds no live entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the background cleanup task. Idempotent; reads after close
    /// report misses.
    fn close(&self);
}

/// Build a store engine from options.
pub fn new_store<V>(opts: Options<V>) -> Box<dyn Store<V>>
where
    V: Measured + Clone + Send + Sync + 'static,
{
    match opts.cache_type {
        CacheType::Lru => Box::new(LruStore::new(opts)),
        CacheType::Lru2 => Box::new(Lru2Store::new(opts)),
    }
}

/// Spawn the background expiration sweeper shared by both engines.
///
/// The thread wakes every `interval`, upgrades its weak handle, and runs
/// `sweep`. It exits when the owner is dropped or the shutdown channel is
/// closed by `close`.
pub(crate) fn spawn_cleanup<T, F>(
    name: &str,
    target: std::sync::Weak<T>,
    interval: Duration,
    sweep: F,
) -> crossbeam_channel::Sender<()>
where
    T: Send + Sync + 'static,
    F: Fn(&T) + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
    let thread_name = name.to_string();

    let spawned = std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            loop {
                match shutdown_rx.recv_timeout(interval) {
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        let Some(target) = target.upgrade() else {
                            return;
                        };
                        sweep(&target);
                    }
                    // Shutdown signal or sender dropped.
                    _ => return,
                }
            }
        });

    if let Err(e) = spawned {
        tracing::warn!(thread = %thread_name, "failed to spawn cleanup thread: {e}");
    }

    shutdown_tx
}
