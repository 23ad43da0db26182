//! Registry-driven peer directory.
//!
//! The directory subscribes to a service in the registry, mirrors its
//! membership into a consistent-hash ring, and keeps one [`PeerClient`]
//! per remote member. It implements [`lattice::PeerPicker`] so groups can
//! route keys to their owning node.

use crate::client::{ClientOptions, PeerClient};
use crate::metrics::{PEERS_ADDED, PEERS_REMOVED, REGISTRY_EVENTS};
use crate::registry::{EventKind, ServiceEvent, ServiceRegistry};
use crate::{ClusterError, client};
use async_trait::async_trait;
use lattice::{Peer, PeerPicker, PickedPeer, TransportError};
use parking_lot::{Mutex, RwLock};
use ring::{Ring, RingConfig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Directory options.
#[derive(Clone)]
pub struct DirectoryOptions {
    /// Registry service to watch.
    pub service_name: String,
    /// Dial timeout for peer sessions.
    pub connect_timeout: Duration,
    /// Per-request deadline for peer reads and deletes.
    pub request_timeout: Duration,
    /// Ring configuration.
    pub ring: RingConfig,
}

impl Default for DirectoryOptions {
    fn default() -> Self {
        Self {
            service_name: "lattice".to_string(),
            connect_timeout: client::DEFAULT_CONNECT_TIMEOUT,
            request_timeout: client::DEFAULT_REQUEST_TIMEOUT,
            ring: RingConfig::default(),
        }
    }
}

impl DirectoryOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the registry service name.
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Set the dial timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-request deadline for reads and deletes.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the ring configuration.
    pub fn with_ring(mut self, ring: RingConfig) -> Self {
        self.ring = ring;
        self
    }
}

struct DirInner {
    self_addr: String,
    client_options: ClientOptions,
    ring: Ring,
    clients: RwLock<HashMap<String, Arc<PeerClient>>>,
    watch: Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl DirInner {
    /// Add a member: self goes on the ring only, remote members also get
    /// a client. Idempotent.
    fn add_member(&self, addr: &str) {
        if addr.is_empty() {
            return;
        }
        if addr != self.self_addr {
            let mut clients = self.clients.write();
            if clients.contains_key(addr) {
                return;
            }
            clients.insert(
                addr.to_string(),
                Arc::new(PeerClient::with_options(addr, self.client_options)),
            );
            PEERS_ADDED.increment();
            tracing::info!(addr, "peer added to directory");
        }
        let _ = self.ring.add([addr]);
    }

    /// Remove a member: close its client exactly once and drop its ring
    /// points.
    async fn remove_member(&self, addr: &str) {
        let client = self.clients.write().remove(addr);
        if let Some(client) = client {
            if let Err(e) = client.close().await {
                tracing::warn!(addr, "peer client close failed: {e}");
            }
            PEERS_REMOVED.increment();
            tracing::info!(addr, "peer removed from directory");
        } else if addr == self.self_addr {
            tracing::warn!(addr, "own registration disappeared from registry");
        }
        let _ = self.ring.remove(addr);
    }
}

/// Registry-backed [`PeerPicker`].
pub struct ServiceDirectory {
    inner: Arc<DirInner>,
}

impl ServiceDirectory {
    /// Discover current members and start watching for changes.
    ///
    /// A registry failure here is fatal: nothing is left running.
    pub async fn new(
        self_addr: impl Into<String>,
        registry: &dyn ServiceRegistry,
        options: DirectoryOptions,
    ) -> Result<Arc<Self>, ClusterError> {
        let discovery = registry.discover(&options.service_name).await?;

        let inner = Arc::new(DirInner {
            self_addr: self_addr.into(),
            client_options: ClientOptions {
                connect_timeout: options.connect_timeout,
                request_timeout: options.request_timeout,
            },
            ring: Ring::new(options.ring),
            clients: RwLock::new(HashMap::new()),
            watch: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        for addr in &discovery.addrs {
            inner.add_member(addr);
        }

        let watch = spawn_watch(&inner, discovery.events);
        *inner.watch.lock() = Some(watch);

        tracing::info!(
            self_addr = %inner.self_addr,
            peers = inner.clients.read().len(),
            "service directory ready"
        );
        Ok(Arc::new(Self { inner }))
    }

    /// This node's address.
    pub fn self_addr(&self) -> &str {
        &self.inner.self_addr
    }

    /// Addresses of remote peers with live clients.
    pub fn peer_addrs(&self) -> Vec<String> {
        self.inner.clients.read().keys().cloned().collect()
    }

    /// Close the watch task and every peer client. Idempotent; client
    /// close failures are aggregated.
    pub async fn shutdown(&self) -> Result<(), ClusterError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(watch) = self.inner.watch.lock().take() {
            watch.abort();
        }

        let clients: Vec<(String, Arc<PeerClient>)> =
            self.inner.clients.write().drain().collect();
        let mut failures = Vec::new();
        for (addr, peer) in clients {
            if let Err(e) = peer.close().await {
                failures.push(format!("{addr}: {e}"));
            }
        }

        self.inner.ring.close();
        tracing::info!(self_addr = %self.inner.self_addr, "service directory closed");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ClusterError::CloseFailed(failures))
        }
    }
}

#[async_trait]
impl PeerPicker for ServiceDirectory {
    fn pick(&self, key: &str) -> Option<PickedPeer> {
        if self.inner.closed.load(Ordering::Acquire) {
            return None;
        }

        let addr = self.inner.ring.get(key)?;
        if addr == self.inner.self_addr {
            return Some(PickedPeer::Local);
        }

        match self.inner.clients.read().get(&addr) {
            Some(client) => Some(PickedPeer::Remote(client.clone())),
            None => {
                tracing::warn!(addr, "ring names a peer with no client");
                None
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

fn spawn_watch(
    inner: &Arc<DirInner>,
    mut events: mpsc::UnboundedReceiver<ServiceEvent>,
) -> tokio::task::JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.closed.load(Ordering::Acquire) {
                return;
            }

            REGISTRY_EVENTS.increment();
            match event.kind {
                EventKind::Put => inner.add_member(&event.addr),
                EventKind::Delete => inner.remove_member(&event.addr).await,
            }
        }
        // Watch channel gone: keep serving the last known ring.
        tracing::warn!("registry watch closed; serving last known membership");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MemoryRegistry, ServiceRegistry};

    async fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..100 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 1s");
    }

    #[tokio::test]
    async fn test_snapshot_populates_ring_and_clients() {
        let registry = MemoryRegistry::new();
        let _self_lease = registry.announce("svc", "127.0.0.1:7001").await.unwrap();
        let _peer_lease = registry.announce("svc", "127.0.0.1:7002").await.unwrap();

        let directory = ServiceDirectory::new(
            "127.0.0.1:7001",
            &registry,
            DirectoryOptions::new().with_service_name("svc"),
        )
        .await
        .unwrap();

        // Clients exist only for remote members.
        assert_eq!(directory.peer_addrs(), vec!["127.0.0.1:7002".to_string()]);

        directory.shutdown().await.unwrap();
        registry.close();
    }

    #[tokio::test]
    async fn test_single_member_ring_picks_local() {
        let registry = MemoryRegistry::new();
        let _lease = registry.announce("svc", "127.0.0.1:7001").await.unwrap();

        let directory = ServiceDirectory::new(
            "127.0.0.1:7001",
            &registry,
            DirectoryOptions::new().with_service_name("svc"),
        )
        .await
        .unwrap();

        for i in 0..50 {
            match directory.pick(&format!("key-{i}")) {
                Some(PickedPeer::Local) => {}
                _ => panic!("expected every key to route to self"),
            }
        }

        directory.shutdown().await.unwrap();
        registry.close();
    }

    #[tokio::test]
    async fn test_watch_adds_and_removes_peers() {
        let registry = MemoryRegistry::new();

        let directory = ServiceDirectory::new(
            "127.0.0.1:7001",
            &registry,
            DirectoryOptions::new().with_service_name("svc"),
        )
        .await
        .unwrap();
        assert!(directory.peer_addrs().is_empty());

        let lease = registry.announce("svc", "127.0.0.1:7002").await.unwrap();
        {
            let directory = directory.clone();
            wait_for(move || directory.peer_addrs().len() == 1).await;
        }

        lease.revoke();
        {
            let directory = directory.clone();
            wait_for(move || directory.peer_addrs().is_empty()).await;
        }

        // Every key routes somewhere only while members exist; with the
        // ring empty again, pick yields nothing.
        assert!(directory.pick("key").is_none());

        directory.shutdown().await.unwrap();
        registry.close();
    }

    #[tokio::test]
    async fn test_empty_ring_picks_none() {
        let registry = MemoryRegistry::new();
        let directory = ServiceDirectory::new(
            "127.0.0.1:7001",
            &registry,
            DirectoryOptions::new().with_service_name("svc"),
        )
        .await
        .unwrap();

        assert!(directory.pick("key").is_none());
        directory.shutdown().await.unwrap();
        registry.close();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_closes_picker() {
        let registry = MemoryRegistry::new();
        let _lease = registry.announce("svc", "127.0.0.1:7001").await.unwrap();

        let directory = ServiceDirectory::new(
            "127.0.0.1:7001",
            &registry,
            DirectoryOptions::new().with_service_name("svc"),
        )
        .await
        .unwrap();

        directory.shutdown().await.unwrap();
        directory.shutdown().await.unwrap();
        assert!(directory.pick("key").is_none());
        registry.close();
    }
}
