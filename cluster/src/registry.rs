//! Service-registry contract and an in-process implementation.
//!
//! The registry is the only coordination service the cluster relies on:
//! nodes announce themselves under `/services/<service>/<addr>` with a
//! renewable lease, and consumers discover a snapshot plus a stream of
//! put/delete change events. External backends (etcd and friends) live
//! behind the same trait; [`MemoryRegistry`] implements it in-process for
//! tests and single-host clusters.

use crate::ClusterError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Default lease TTL for announcements.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(10);

/// Kind of a registry change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// An address was announced (or re-announced).
    Put,
    /// An address was revoked or its lease expired.
    Delete,
}

/// A change event for one service member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEvent {
    pub kind: EventKind,
    pub addr: String,
}

/// Initial membership snapshot plus the change-event stream.
pub struct Discovery {
    /// Addresses registered at subscription time.
    pub addrs: Vec<String>,
    /// Subsequent put/delete events.
    pub events: mpsc::UnboundedReceiver<ServiceEvent>,
}

/// Live registration of one address.
///
/// The handle owns the lease keep-alive. Revoking (or dropping) withdraws
/// the announcement immediately; [`Registration::abandon`] stops the
/// keep-alive without revoking, leaving the member to lease expiry as if
/// the registrant had vanished.
pub struct Registration {
    keepalive: Option<tokio::task::AbortHandle>,
    revoke: Option<Box<dyn FnOnce() + Send>>,
}

impl Registration {
    fn new(
        keepalive: Option<tokio::task::AbortHandle>,
        revoke: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            keepalive,
            revoke: Some(Box::new(revoke)),
        }
    }

    /// Withdraw the announcement now.
    pub fn revoke(mut self) {
        self.finish(true);
    }

    /// Stop the keep-alive without withdrawing. The lease runs out on its
    /// own.
    pub fn abandon(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, revoke: bool) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
        let withdraw = self.revoke.take();
        if revoke
            && let Some(withdraw) = withdraw
        {
            withdraw();
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.finish(true);
    }
}

/// Keyed announce + watch, the registry contract.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Announce `addr` as a member of `service` under a renewable lease.
    /// Construction failures are fatal to the caller.
    async fn announce(&self, service: &str, addr: &str) -> Result<Registration, ClusterError>;

    /// Subscribe to `service`: a snapshot of current members plus change
    /// events.
    async fn discover(&self, service: &str) -> Result<Discovery, ClusterError>;
}

struct RegistryState {
    /// service -> addr -> lease deadline.
    services: HashMap<String, HashMap<String, Instant>>,
    /// service -> live watchers.
    watchers: HashMap<String, Vec<mpsc::UnboundedSender<ServiceEvent>>>,
}

struct Shared {
    state: Mutex<RegistryState>,
    lease_ttl: Duration,
    closed: AtomicBool,
}

impl Shared {
    fn notify(&self, state: &mut RegistryState, service: &str, event: ServiceEvent) {
        if let Some(watchers) = state.watchers.get_mut(service) {
            watchers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Drop members whose lease deadline has passed.
    fn sweep(&self, now: Instant) {
        let mut state = self.state.lock();
        let expired: Vec<(String, String)> = state
            .services
            .iter()
            .flat_map(|(service, members)| {
                members
                    .iter()
                    .filter(|(_, deadline)| now >= **deadline)
                    .map(|(addr, _)| (service.clone(), addr.clone()))
            })
            .collect();

        for (service, addr) in expired {
            tracing::warn!(service = %service, addr = %addr, "lease expired, dropping member");
            if let Some(members) = state.services.get_mut(&service) {
                members.remove(&addr);
            }
            self.notify(
                &mut state,
                &service,
                ServiceEvent {
                    kind: EventKind::Delete,
                    addr,
                },
            );
        }
    }
}

/// In-process [`ServiceRegistry`].
///
/// Leases are renewed by a per-registration task at a third of the TTL; a
/// sweeper withdraws members whose keep-alive stopped.
pub struct MemoryRegistry {
    shared: Arc<Shared>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    /// Create a registry with the default 10 s lease TTL.
    pub fn new() -> Self {
        Self::with_lease_ttl(DEFAULT_LEASE_TTL)
    }

    /// Create a registry with a custom lease TTL.
    pub fn with_lease_ttl(lease_ttl: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RegistryState {
                    services: HashMap::new(),
                    watchers: HashMap::new(),
                }),
                lease_ttl: lease_ttl.max(Duration::from_millis(10)),
                closed: AtomicBool::new(false),
            }),
            sweeper: Mutex::new(None),
        }
    }

    /// Spawn the lease sweeper once a runtime is available.
    fn ensure_sweeper(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let shared = Arc::downgrade(&self.shared);
        let interval = self.shared.lease_ttl / 4;
        *sweeper = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                if shared.closed.load(Ordering::Acquire) {
                    return;
                }
                shared.sweep(Instant::now());
            }
        }));
    }

    /// Stop the sweeper and drop all state. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        let mut state = self.shared.state.lock();
        state.services.clear();
        state.watchers.clear();
    }

    /// Number of live members for a service.
    pub fn member_count(&self, service: &str) -> usize {
        self.shared
            .state
            .lock()
            .services
            .get(service)
            .map(|members| members.len())
            .unwrap_or(0)
    }
}

fn spawn_keepalive(
    shared: Weak<Shared>,
    service: String,
    addr: String,
    ttl: Duration,
) -> tokio::task::AbortHandle {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(ttl / 3).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut state = shared.state.lock();
            match state
                .services
                .get_mut(&service)
                .and_then(|members| members.get_mut(&addr))
            {
                Some(deadline) => *deadline = Instant::now() + ttl,
                // Revoked or expired out from under us.
                None => return,
            }
        }
    })
    .abort_handle()
}

#[async_trait]
impl ServiceRegistry for MemoryRegistry {
    async fn announce(&self, service: &str, addr: &str) -> Result<Registration, ClusterError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ClusterError::Closed);
        }
        if addr.is_empty() {
            return Err(ClusterError::Registry("empty address".to_string()));
        }
        self.ensure_sweeper();

        let ttl = self.shared.lease_ttl;
        {
            let mut state = self.shared.state.lock();
            let members = state.services.entry(service.to_string()).or_default();
            let fresh = members
                .insert(addr.to_string(), Instant::now() + ttl)
                .is_none();
            if fresh {
                self.shared.notify(
                    &mut state,
                    service,
                    ServiceEvent {
                        kind: EventKind::Put,
                        addr: addr.to_string(),
                    },
                );
            }
        }
        tracing::info!(service, addr, "service member announced");

        let keepalive = spawn_keepalive(
            Arc::downgrade(&self.shared),
            service.to_string(),
            addr.to_string(),
            ttl,
        );

        let shared = Arc::downgrade(&self.shared);
        let (service, addr) = (service.to_string(), addr.to_string());
        Ok(Registration::new(Some(keepalive), move || {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut state = shared.state.lock();
            let removed = state
                .services
                .get_mut(&service)
                .and_then(|members| members.remove(&addr))
                .is_some();
            if removed {
                tracing::info!(service = %service, addr = %addr, "service member revoked");
                shared.notify(
                    &mut state,
                    &service,
                    ServiceEvent {
                        kind: EventKind::Delete,
                        addr: addr.clone(),
                    },
                );
            }
        }))
    }

    async fn discover(&self, service: &str) -> Result<Discovery, ClusterError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ClusterError::Closed);
        }
        self.ensure_sweeper();

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.shared.state.lock();
        let addrs = state
            .services
            .get(service)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default();
        state
            .watchers
            .entry(service.to_string())
            .or_default()
            .push(tx);

        Ok(Discovery { addrs, events: rx })
    }
}
