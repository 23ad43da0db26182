//! Cache groups and the process-wide group registry.

use crate::cache::Cache;
use crate::peers::{PeerPicker, PickedPeer};
use crate::{ByteView, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use singleflight::SingleFlight;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use store::Options;

/// Boxed error produced by an origin loader.
pub type LoadError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by group operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GroupError {
    /// `get`/`set`/`delete` was called with an empty key.
    #[error("key is required")]
    KeyRequired,
    /// `set` was called with an empty value.
    #[error("value is required")]
    ValueRequired,
    /// The group has been closed.
    #[error("cache group is closed")]
    Closed,
    /// A group with this name already exists in the registry.
    #[error("cache group {0:?} already exists")]
    DuplicateName(String),
    /// The builder was not given an origin loader.
    #[error("origin loader is required")]
    LoaderRequired,
    /// Peer transport failure that could not be recovered.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The origin loader failed; the source error is shared unchanged.
    #[error("origin load failed: {0}")]
    Loader(#[source] Arc<dyn std::error::Error + Send + Sync>),
}

/// Produces the authoritative value for a key on a cache miss at the
/// owning node.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Load the value for `key` from the origin.
    async fn load(&self, key: &str) -> Result<Vec<u8>, LoadError>;
}

/// Adapter implementing [`Loader`] for an async closure.
pub struct LoaderFn<F>(F);

#[async_trait]
impl<F, Fut> Loader for LoaderFn<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<u8>, LoadError>> + Send,
{
    async fn load(&self, key: &str) -> Result<Vec<u8>, LoadError> {
        (self.0)(key.to_string()).await
    }
}

/// Wrap an async closure as a [`Loader`].
///
/// ```
/// use lattice::loader_fn;
///
/// let loader = loader_fn(|key: String| async move { Ok(key.into_bytes()) });
/// # let _ = loader;
/// ```
pub fn loader_fn<F, Fut>(f: F) -> LoaderFn<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<u8>, LoadError>> + Send,
{
    LoaderFn(f)
}

/// Per-group counters.
#[derive(Default)]
struct GroupStats {
    loads: AtomicU64,
    local_hits: AtomicU64,
    local_misses: AtomicU64,
    peer_hits: AtomicU64,
    peer_misses: AtomicU64,
    loader_hits: AtomicU64,
    loader_errors: AtomicU64,
    load_duration_ns: AtomicU64,
}

/// Point-in-time copy of a group's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub loads: u64,
    pub local_hits: u64,
    pub local_misses: u64,
    pub peer_hits: u64,
    pub peer_misses: u64,
    pub loader_hits: u64,
    pub loader_errors: u64,
    pub load_duration_ns: u64,
}

/// Named collection of groups. Group names are unique per registry.
///
/// [`GroupRegistry::global`] is the process-wide default; tests can build
/// against their own registry instead.
#[derive(Clone, Default)]
pub struct GroupRegistry {
    groups: Arc<Mutex<HashMap<String, Arc<Group>>>>,
}

static GLOBAL: LazyLock<GroupRegistry> = LazyLock::new(GroupRegistry::default);

impl GroupRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide default registry.
    pub fn global() -> &'static GroupRegistry {
        &GLOBAL
    }

    /// Look up a group by name.
    pub fn get(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.lock().get(name).cloned()
    }

    /// Names of all registered groups.
    pub fn names(&self) -> Vec<String> {
        self.groups.lock().keys().cloned().collect()
    }

    fn insert(&self, group: Arc<Group>) -> Result<(), GroupError> {
        let mut groups = self.groups.lock();
        if groups.contains_key(&group.name) {
            return Err(GroupError::DuplicateName(group.name.clone()));
        }
        groups.insert(group.name.clone(), group);
        Ok(())
    }

    fn remove(&self, name: &str) {
        self.groups.lock().remove(name);
    }
}

/// Look up a group in the global registry.
pub fn get_group(name: &str) -> Option<Arc<Group>> {
    GroupRegistry::global().get(name)
}

/// Builder for [`Group`].
pub struct GroupBuilder {
    name: String,
    loader: Option<Arc<dyn Loader>>,
    cache_options: Options<ByteView>,
    expiration: Duration,
    peers: Option<Arc<dyn PeerPicker>>,
}

impl GroupBuilder {
    /// Start building a group with the given unique name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            loader: None,
            cache_options: Options::default(),
            expiration: Duration::ZERO,
            peers: None,
        }
    }

    /// Set the origin loader (required).
    pub fn loader(mut self, loader: impl Loader + 'static) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// Configure the main cache store.
    pub fn cache_options(mut self, options: Options<ByteView>) -> Self {
        self.cache_options = options;
        self
    }

    /// Default time-to-live for entries populated by loads and writes.
    /// Zero (the default) means entries never expire.
    pub fn expiration(mut self, ttl: Duration) -> Self {
        self.expiration = ttl;
        self
    }

    /// Attach a peer directory for distributed operation.
    pub fn peers(mut self, peers: Arc<dyn PeerPicker>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Build and register in the global registry.
    pub fn build(self) -> Result<Arc<Group>, GroupError> {
        self.build_in(GroupRegistry::global())
    }

    /// Build and register in `registry`.
    pub fn build_in(self, registry: &GroupRegistry) -> Result<Arc<Group>, GroupError> {
        let loader = self.loader.ok_or(GroupError::LoaderRequired)?;

        let group = Arc::new(Group {
            name: self.name,
            loader,
            cache: Cache::new(self.cache_options),
            peers: self.peers,
            flight: SingleFlight::new(),
            expiration: self.expiration,
            stats: GroupStats::default(),
            closed: AtomicBool::new(false),
            registry: registry.clone(),
        });

        registry.insert(group.clone())?;
        tracing::info!(group = %group.name, "cache group created");
        Ok(group)
    }
}

/// A named cache group.
///
/// See the crate docs for the read path. A group is created through
/// [`GroupBuilder`] and lives in a [`GroupRegistry`] until closed.
pub struct Group {
    name: String,
    loader: Arc<dyn Loader>,
    cache: Cache,
    peers: Option<Arc<dyn PeerPicker>>,
    flight: SingleFlight<ByteView, GroupError>,
    expiration: Duration,
    stats: GroupStats,
    closed: AtomicBool,
    registry: GroupRegistry,
}

impl Group {
    /// The group's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fetch the value for `key`.
    ///
    /// Order: local cache, then the owning peer (when a directory is
    /// attached and the owner is remote), then the origin loader. A peer
    /// failure falls back to the origin. Values fetched from peers or the
    /// origin populate the local cache with the group's expiration.
    pub async fn get(&self, key: &str) -> Result<ByteView, GroupError> {
        if key.is_empty() {
            return Err(GroupError::KeyRequired);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(GroupError::Closed);
        }

        if let Some(view) = self.cache.get(key) {
            self.stats.local_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(view);
        }
        self.stats.local_misses.fetch_add(1, Ordering::Relaxed);

        self.load(key).await
    }

    /// Store a value: local cache first, then best-effort replication to
    /// the owning peer.
    ///
    /// Empty values are rejected at this level; removal is the explicit
    /// [`Group::delete`]. The cache facade underneath maps empty values
    /// to deletion for callers that write to it directly.
    pub async fn set(&self, key: &str, value: impl Into<ByteView>) -> Result<(), GroupError> {
        if key.is_empty() {
            return Err(GroupError::KeyRequired);
        }
        let view: ByteView = value.into();
        if view.is_empty() {
            return Err(GroupError::ValueRequired);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(GroupError::Closed);
        }

        // Local before remote: the owner must be at least as fresh as any
        // follower it later serves.
        self.populate(key, view.clone());

        if let Some(PickedPeer::Remote(peer)) = self.pick(key)
            && let Err(e) = peer.set(&self.name, key, view.into_bytes()).await
        {
            self.stats.peer_misses.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(group = %self.name, key, "peer set failed: {e}");
        }

        Ok(())
    }

    /// Delete a key locally and best-effort on the owning peer. Returns
    /// whether a live local entry was removed.
    pub async fn delete(&self, key: &str) -> Result<bool, GroupError> {
        if key.is_empty() {
            return Err(GroupError::KeyRequired);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(GroupError::Closed);
        }

        let removed = self.cache.delete(key);

        if let Some(PickedPeer::Remote(peer)) = self.pick(key)
            && let Err(e) = peer.delete(&self.name, key).await
        {
            self.stats.peer_misses.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(group = %self.name, key, "peer delete failed: {e}");
        }

        Ok(removed)
    }

    /// Remove every locally cached entry.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Number of locally cached entries.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the local cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            loads: self.stats.loads.load(Ordering::Relaxed),
            local_hits: self.stats.local_hits.load(Ordering::Relaxed),
            local_misses: self.stats.local_misses.load(Ordering::Relaxed),
            peer_hits: self.stats.peer_hits.load(Ordering::Relaxed),
            peer_misses: self.stats.peer_misses.load(Ordering::Relaxed),
            loader_hits: self.stats.loader_hits.load(Ordering::Relaxed),
            loader_errors: self.stats.loader_errors.load(Ordering::Relaxed),
            load_duration_ns: self.stats.load_duration_ns.load(Ordering::Relaxed),
        }
    }

    /// Close the group: shut the local cache, close the peer directory,
    /// and unregister the name. Idempotent.
    pub async fn close(&self) -> Result<(), GroupError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.cache.close();
        if let Some(peers) = &self.peers
            && let Err(e) = peers.close().await
        {
            tracing::warn!(group = %self.name, "peer directory close failed: {e}");
        }
        self.registry.remove(&self.name);
        tracing::info!(group = %self.name, "cache group closed");
        Ok(())
    }

    fn pick(&self, key: &str) -> Option<PickedPeer> {
        self.peers.as_ref()?.pick(key)
    }

    fn populate(&self, key: &str, view: ByteView) {
        if self.expiration.is_zero() {
            self.cache.set(key, view);
        } else {
            self.cache.set_with_expiration(key, view, self.expiration);
        }
    }

    /// Miss path: coalesce concurrent loads per key and account the load
    /// latency.
    async fn load(&self, key: &str) -> Result<ByteView, GroupError> {
        self.stats.loads.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let result = self.flight.run(key, self.load_once(key)).await;

        self.stats
            .load_duration_ns
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        result
    }

    /// One uncoalesced load: owning peer first, origin as fallback.
    async fn load_once(&self, key: &str) -> Result<ByteView, GroupError> {
        if let Some(PickedPeer::Remote(peer)) = self.pick(key) {
            match peer.get(&self.name, key).await {
                Ok(bytes) => {
                    self.stats.peer_hits.fetch_add(1, Ordering::Relaxed);
                    let view = ByteView::from(bytes);
                    self.populate(key, view.clone());
                    return Ok(view);
                }
                Err(e) => {
                    self.stats.peer_misses.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        group = %self.name,
                        key,
                        "peer get failed, falling back to origin: {e}"
                    );
                }
            }
        }

        match self.loader.load(key).await {
            Ok(bytes) => {
                self.stats.loader_hits.fetch_add(1, Ordering::Relaxed);
                let view = ByteView::from(bytes);
                self.populate(key, view.clone());
                Ok(view)
            }
            Err(e) => {
                self.stats.loader_errors.fetch_add(1, Ordering::Relaxed);
                Err(GroupError::Loader(Arc::from(e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    fn counting_loader(counter: Arc<AtomicUsize>, value: &'static str) -> impl Loader + 'static {
        loader_fn(move |_key: String| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(value.as_bytes().to_vec())
            }
        })
    }

    fn build_group(name: &str, registry: &GroupRegistry) -> Arc<Group> {
        GroupBuilder::new(name)
            .loader(loader_fn(|key: String| async move {
                Ok(format!("origin:{key}").into_bytes())
            }))
            .build_in(registry)
            .unwrap()
    }

    #[tokio::test]
    async fn test_miss_hits_origin_then_cache() {
        let registry = GroupRegistry::new();
        let group = build_group("g", &registry);

        let first = group.get("k").await.unwrap();
        assert_eq!(first.as_slice(), b"origin:k");

        let second = group.get("k").await.unwrap();
        assert_eq!(second, first);

        let stats = group.stats();
        assert_eq!(stats.local_misses, 1);
        assert_eq!(stats.local_hits, 1);
        assert_eq!(stats.loader_hits, 1);
        assert_eq!(stats.loads, 1);
        group.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_hit_never_invokes_loader() {
        let registry = GroupRegistry::new();
        let invocations = Arc::new(AtomicUsize::new(0));
        let group = GroupBuilder::new("g")
            .loader(counting_loader(invocations.clone(), "v"))
            .build_in(&registry)
            .unwrap();

        group.set("k", "cached").await.unwrap();
        let value = group.get("k").await.unwrap();
        assert_eq!(value.as_slice(), b"cached");
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
        group.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let registry = GroupRegistry::new();
        let group = build_group("g", &registry);

        assert!(matches!(
            group.get("").await,
            Err(GroupError::KeyRequired)
        ));
        assert!(matches!(
            group.set("", "v").await,
            Err(GroupError::KeyRequired)
        ));
        assert!(matches!(
            group.delete("").await,
            Err(GroupError::KeyRequired)
        ));
        group.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_value_rejected() {
        let registry = GroupRegistry::new();
        let group = build_group("g", &registry);

        assert!(matches!(
            group.set("k", Bytes::new()).await,
            Err(GroupError::ValueRequired)
        ));
        group.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let registry = GroupRegistry::new();
        let _group = build_group("dup", &registry);

        let second = GroupBuilder::new("dup")
            .loader(loader_fn(|_key: String| async { Ok(Vec::new()) }))
            .build_in(&registry);
        assert!(matches!(second, Err(GroupError::DuplicateName(name)) if name == "dup"));
    }

    #[tokio::test]
    async fn test_closed_group_refuses_work() {
        let registry = GroupRegistry::new();
        let group = build_group("g", &registry);

        group.close().await.unwrap();
        group.close().await.unwrap();

        assert!(matches!(group.get("k").await, Err(GroupError::Closed)));
        assert!(matches!(group.set("k", "v").await, Err(GroupError::Closed)));
        assert!(matches!(group.delete("k").await, Err(GroupError::Closed)));
        assert!(registry.get("g").is_none());
    }

    #[tokio::test]
    async fn test_loader_error_propagates_and_is_not_cached() {
        let registry = GroupRegistry::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let group = {
            let attempts = attempts.clone();
            GroupBuilder::new("g")
                .loader(loader_fn(move |_key: String| {
                    let attempts = attempts.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err::<Vec<u8>, LoadError>("origin down".into())
                    }
                }))
                .build_in(&registry)
                .unwrap()
        };

        let err = group.get("k").await.unwrap_err();
        assert!(matches!(err, GroupError::Loader(_)));
        assert!(err.to_string().contains("origin down"));

        // A failed load is not cached: the origin is consulted again.
        let _ = group.get("k").await.unwrap_err();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(group.stats().loader_errors, 2);
        group.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_coalesce() {
        let registry = GroupRegistry::new();
        let invocations = Arc::new(AtomicUsize::new(0));
        let group = {
            let invocations = invocations.clone();
            GroupBuilder::new("g")
                .loader(loader_fn(move |_key: String| {
                    let invocations = invocations.clone();
                    async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(b"v".to_vec())
                    }
                }))
                .build_in(&registry)
                .unwrap()
        };

        let mut handles = Vec::new();
        for _ in 0..100 {
            let group = group.clone();
            handles.push(tokio::spawn(async move { group.get("k").await }));
        }
        for handle in handles {
            let value = handle.await.unwrap().unwrap();
            assert_eq!(value.as_slice(), b"v");
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        group.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_expiration_applies_to_populated_entries() {
        let registry = GroupRegistry::new();
        let group = GroupBuilder::new("g")
            .loader(loader_fn(|_key: String| async { Ok(b"v".to_vec()) }))
            .expiration(Duration::from_millis(5))
            .build_in(&registry)
            .unwrap();

        group.get("k").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Entry expired; the next read is a local miss again.
        group.get("k").await.unwrap();
        assert_eq!(group.stats().local_misses, 2);
        group.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_removes_local_entry() {
        let registry = GroupRegistry::new();
        let group = build_group("g", &registry);

        group.set("k", "v").await.unwrap();
        assert!(group.delete("k").await.unwrap());
        assert!(!group.delete("k").await.unwrap());

        // Next get falls through to the origin.
        let value = group.get("k").await.unwrap();
        assert_eq!(value.as_slice(), b"origin:k");
        group.close().await.unwrap();
    }
}
