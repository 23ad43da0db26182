//! Consistent-hash ring with virtual nodes and adaptive replica
//! rebalancing.
//!
//! Each physical node contributes `replicas` virtual points to the ring;
//! a key is routed to the node owning the first point at or clockwise of
//! the key's hash. A background balancer samples per-node hit counts and
//! grows or shrinks each node's replica count when the observed load skew
//! exceeds the configured threshold, clamped to the configured bounds.
//!
//! # Example
//!
//! ```
//! use ring::{Ring, RingConfig};
//!
//! let ring = Ring::new(RingConfig::default());
//! ring.add(["10.0.0.1:9000", "10.0.0.2:9000"]).unwrap();
//!
//! let owner = ring.get("user:42").unwrap();
//! assert_eq!(ring.get("user:42").unwrap(), owner);
//! ring.close();
//! ```

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Hash function used for both virtual points and keys.
pub type HashFn = fn(&[u8]) -> u64;

/// 64-bit FNV-1a.
pub fn fnv1a(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Default ring hash: FNV-1a plus an avalanche finalizer. Bare FNV-1a
/// leaves the sequential virtual-point labels (`"node-0"`, `"node-1"`, …)
/// clustered on the ring; the finalizer spreads them.
pub fn default_hash(data: &[u8]) -> u64 {
    mix64(fnv1a(data))
}

fn mix64(mut hash: u64) -> u64 {
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    hash ^= hash >> 33;
    hash
}

/// Minimum hit sample before a rebalance is considered.
const REBALANCE_MIN_SAMPLE: u64 = 1000;

/// Balancer tick interval.
const REBALANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Errors surfaced by ring mutations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    /// `add` was called with no nodes.
    #[error("no nodes provided")]
    NoNodes,
    /// The named node is not on the ring.
    #[error("node {0:?} not found")]
    UnknownNode(String),
}

/// Ring configuration.
#[derive(Clone, Copy)]
pub struct RingConfig {
    /// Hash for keys and virtual points.
    pub hash_fn: HashFn,
    /// Virtual points per node at `add` time.
    pub default_replicas: usize,
    /// Lower clamp for adaptive rebalancing.
    pub min_replicas: usize,
    /// Upper clamp for adaptive rebalancing.
    pub max_replicas: usize,
    /// Relative load skew (`max |hits - avg| / avg`) above which the
    /// balancer adjusts replica counts.
    pub load_balance_threshold: f64,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            hash_fn: default_hash,
            default_replicas: 50,
            min_replicas: 10,
            max_replicas: 200,
            load_balance_threshold: 0.25,
        }
    }
}

impl RingConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hash function.
    pub fn with_hash_fn(mut self, hash_fn: HashFn) -> Self {
        self.hash_fn = hash_fn;
        self
    }

    /// Set the virtual points added per node.
    pub fn with_default_replicas(mut self, replicas: usize) -> Self {
        self.default_replicas = replicas;
        self
    }

    /// Set the replica clamp bounds.
    pub fn with_replica_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_replicas = min;
        self.max_replicas = max;
        self
    }

    /// Set the rebalance skew threshold.
    pub fn with_load_balance_threshold(mut self, threshold: f64) -> Self {
        self.load_balance_threshold = threshold;
        self
    }
}

struct State {
    keys: Vec<u64>,
    hash_to_node: HashMap<u64, String>,
    node_replicas: HashMap<String, usize>,
    node_hits: HashMap<String, AtomicU64>,
}

struct Shared {
    config: RingConfig,
    state: RwLock<State>,
    total_hits: AtomicU64,
    closed: AtomicBool,
}

/// Consistent-hash ring.
pub struct Ring {
    shared: Arc<Shared>,
    shutdown: parking_lot::Mutex<Option<crossbeam_channel::Sender<()>>>,
}

impl Ring {
    /// Create an empty ring and start its balancer.
    pub fn new(config: RingConfig) -> Self {
        let shared = Arc::new(Shared {
            config,
            state: RwLock::new(State {
                keys: Vec::new(),
                hash_to_node: HashMap::new(),
                node_replicas: HashMap::new(),
                node_hits: HashMap::new(),
            }),
            total_hits: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let shutdown = spawn_balancer(Arc::downgrade(&shared));

        Self {
            shared,
            shutdown: parking_lot::Mutex::new(Some(shutdown)),
        }
    }

    /// Add nodes, each with the configured default replica count.
    ///
    /// Errs only when `nodes` itself is empty; empty ids and nodes
    /// already on the ring are silently skipped.
    pub fn add<I, S>(&self, nodes: I) -> Result<(), RingError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let nodes: Vec<String> = nodes.into_iter().map(Into::into).collect();
        if nodes.is_empty() {
            return Err(RingError::NoNodes);
        }

        let mut state = self.shared.state.write();
        for node in nodes {
            if node.is_empty() {
                continue;
            }
            if state.node_replicas.contains_key(&node) {
                tracing::debug!(node = %node, "node already on ring, skipping");
                continue;
            }
            self.shared
                .add_node(&mut state, &node, self.shared.config.default_replicas);
        }

        state.keys.sort_unstable();
        Ok(())
    }

    /// Route a key to its owning node and record the hit.
    pub fn get(&self, key: &str) -> Option<String> {
        if key.is_empty() {
            return None;
        }

        let state = self.shared.state.read();
        if state.keys.is_empty() {
            return None;
        }

        let hash = (self.shared.config.hash_fn)(key.as_bytes());
        let mut idx = state.keys.partition_point(|&point| point < hash);
        if idx == state.keys.len() {
            idx = 0;
        }

        let node = state.hash_to_node.get(&state.keys[idx])?.clone();

        // Statistics only: updated under the shared lock on purpose.
        if let Some(hits) = state.node_hits.get(&node) {
            hits.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.total_hits.fetch_add(1, Ordering::Relaxed);

        Some(node)
    }

    /// Remove a node and all of its virtual points.
    pub fn remove(&self, node: &str) -> Result<(), RingError> {
        if node.is_empty() {
            return Err(RingError::UnknownNode(String::new()));
        }

        let mut state = self.shared.state.write();
        self.shared.remove_node(&mut state, node)
    }

    /// Fraction of recorded hits per node since the last rebalance.
    pub fn stats(&self) -> HashMap<String, f64> {
        let state = self.shared.state.read();
        let total = self.shared.total_hits.load(Ordering::Relaxed);
        if total == 0 {
            return HashMap::new();
        }

        state
            .node_hits
            .iter()
            .map(|(node, hits)| {
                (
                    node.clone(),
                    hits.load(Ordering::Relaxed) as f64 / total as f64,
                )
            })
            .collect()
    }

    /// Number of physical nodes on the ring.
    pub fn len(&self) -> usize {
        self.shared.state.read().node_replicas.len()
    }

    /// Whether the ring has no nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current replica count for a node.
    pub fn replicas_of(&self, node: &str) -> Option<usize> {
        self.shared.state.read().node_replicas.get(node).copied()
    }

    /// Stop the balancer. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.lock().take();
    }
}

impl Shared {
    fn virtual_point(&self, node: &str, replica: usize) -> u64 {
        (self.config.hash_fn)(format!("{node}-{replica}").as_bytes())
    }

    /// Insert a node's virtual points. Caller holds the write lock and
    /// re-sorts `keys` afterwards.
    fn add_node(&self, state: &mut State, node: &str, replicas: usize) {
        for replica in 0..replicas {
            let hash = self.virtual_point(node, replica);
            state.keys.push(hash);
            state.hash_to_node.insert(hash, node.to_string());
        }
        state.node_replicas.insert(node.to_string(), replicas);
        state
            .node_hits
            .entry(node.to_string())
            .or_insert_with(|| AtomicU64::new(0));
    }

    /// Remove a node's virtual points. Caller holds the write lock.
    fn remove_node(&self, state: &mut State, node: &str) -> Result<(), RingError> {
        let Some(replicas) = state.node_replicas.get(node).copied() else {
            return Err(RingError::UnknownNode(node.to_string()));
        };

        for replica in 0..replicas {
            let hash = self.virtual_point(node, replica);
            state.hash_to_node.remove(&hash);
            // Linear scan: `keys` may be mid-rebalance and not yet re-sorted.
            if let Some(idx) = state.keys.iter().position(|&point| point == hash) {
                state.keys.remove(idx);
            }
        }

        state.node_replicas.remove(node);
        state.node_hits.remove(node);
        Ok(())
    }

    /// Check the observed skew and rebalance replica counts if needed.
    fn maybe_rebalance(&self) {
        let total = self.total_hits.load(Ordering::Relaxed);
        if total < REBALANCE_MIN_SAMPLE {
            return;
        }

        let skew = {
            let state = self.state.read();
            if state.node_replicas.is_empty() {
                return;
            }
            let avg = total as f64 / state.node_replicas.len() as f64;
            state
                .node_hits
                .values()
                .map(|hits| (hits.load(Ordering::Relaxed) as f64 - avg).abs() / avg)
                .fold(0.0_f64, f64::max)
        };

        if skew > self.config.load_balance_threshold {
            tracing::debug!(skew, "load skew above threshold, rebalancing ring");
            self.rebalance();
        }
    }

    /// Scale each node's replica count by its load ratio, clamped to the
    /// configured bounds, then reset the hit counters.
    fn rebalance(&self) {
        let mut state = self.state.write();
        let total = self.total_hits.load(Ordering::Relaxed);
        if state.node_replicas.is_empty() {
            return;
        }
        let avg = total as f64 / state.node_replicas.len() as f64;

        let loads: Vec<(String, u64)> = state
            .node_hits
            .iter()
            .map(|(node, hits)| (node.clone(), hits.load(Ordering::Relaxed)))
            .collect();

        for (node, hits) in loads {
            let Some(current) = state.node_replicas.get(&node).copied() else {
                continue;
            };
            let ratio = hits as f64 / avg;

            let scaled = if ratio > 1.0 {
                // Overloaded: shed virtual points.
                current as f64 / ratio
            } else {
                // Underloaded: grow virtual points.
                current as f64 * (2.0 - ratio)
            };
            let target = (scaled as usize).clamp(self.config.min_replicas, self.config.max_replicas);

            if target != current {
                tracing::debug!(node = %node, current, target, "adjusting replicas");
                if self.remove_node(&mut state, &node).is_err() {
                    continue;
                }
                self.add_node(&mut state, &node, target);
            }
        }

        for hits in state.node_hits.values() {
            hits.store(0, Ordering::Relaxed);
        }
        self.total_hits.store(0, Ordering::Relaxed);

        state.keys.sort_unstable();
    }
}

fn spawn_balancer(shared: Weak<Shared>) -> crossbeam_channel::Sender<()> {
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);

    let spawned = std::thread::Builder::new()
        .name("ring-balancer".to_string())
        .spawn(move || {
            loop {
                match shutdown_rx.recv_timeout(REBALANCE_INTERVAL) {
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        let Some(shared) = shared.upgrade() else {
                            return;
                        };
                        shared.maybe_rebalance();
                    }
                    _ => return,
                }
            }
        });

    if let Err(e) = spawned {
        tracing::warn!("failed to spawn ring balancer: {e}");
    }

    shutdown_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn ring_with(nodes: &[&str], replicas: usize) -> Ring {
        let ring = Ring::new(RingConfig::new().with_default_replicas(replicas));
        ring.add(nodes.iter().copied()).unwrap();
        ring
    }

    #[test]
    fn test_empty_ring_routes_nothing() {
        let ring = Ring::new(RingConfig::default());
        assert!(ring.get("key").is_none());
        assert!(ring.get("").is_none());
        ring.close();
    }

    #[test]
    fn test_add_requires_nodes() {
        let ring = Ring::new(RingConfig::default());
        assert_eq!(ring.add(Vec::<String>::new()), Err(RingError::NoNodes));

        // Empty ids are skipped, not an error; the ring stays empty.
        assert_eq!(ring.add(["", ""]), Ok(()));
        assert!(ring.is_empty());
        assert!(ring.get("key").is_none());
        ring.close();
    }

    #[test]
    fn test_add_sets_default_replicas() {
        let ring = ring_with(&["a", "b"], 30);
        assert_eq!(ring.replicas_of("a"), Some(30));
        assert_eq!(ring.replicas_of("b"), Some(30));
        assert_eq!(ring.len(), 2);
        ring.close();
    }

    #[test]
    fn test_get_is_deterministic() {
        let ring = ring_with(&["a", "b", "c"], 50);
        let first = ring.get("some-key").unwrap();
        for _ in 0..10 {
            assert_eq!(ring.get("some-key").unwrap(), first);
        }
        ring.close();
    }

    #[test]
    fn test_remove_node() {
        let ring = ring_with(&["a", "b"], 50);
        ring.remove("a").unwrap();

        assert_eq!(ring.replicas_of("a"), None);
        assert_eq!(ring.len(), 1);
        for i in 0..100 {
            assert_eq!(ring.get(&format!("key-{i}")).unwrap(), "b");
        }

        assert_eq!(
            ring.remove("a"),
            Err(RingError::UnknownNode("a".to_string()))
        );
        ring.close();
    }

    #[test]
    fn test_distribution_within_bounds() {
        let ring = ring_with(&["a", "b", "c"], 50);
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut rng = rand::thread_rng();

        let samples = 10_000;
        for _ in 0..samples {
            let key = format!("key-{}", rng.r#gen::<u64>());
            *counts.entry(ring.get(&key).unwrap()).or_default() += 1;
        }

        for node in ["a", "b", "c"] {
            let share = counts.get(node).copied().unwrap_or(0) as f64 / samples as f64;
            assert!(
                (0.25..=0.41).contains(&share),
                "node {node} owns {share:.3} of keys"
            );
        }
        ring.close();
    }

    #[test]
    fn test_stats_sum_to_one() {
        let ring = ring_with(&["a", "b", "c"], 50);
        // Stay under the rebalance sample threshold so the background
        // balancer cannot reset the counters mid-test.
        for i in 0..900 {
            ring.get(&format!("key-{i}"));
        }

        let total: f64 = ring.stats().values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        ring.close();
    }

    #[test]
    fn test_rebalance_clamps_replicas() {
        let ring = Ring::new(
            RingConfig::new()
                .with_default_replicas(50)
                .with_replica_bounds(10, 60)
                .with_load_balance_threshold(0.1),
        );
        ring.add(["a", "b"]).unwrap();

        // Skew the counters far beyond the threshold, then force the
        // balancer's decision path.
        for _ in 0..REBALANCE_MIN_SAMPLE * 2 {
            ring.get("pinned-key");
        }
        ring.shared.maybe_rebalance();

        let a = ring.replicas_of("a").unwrap();
        let b = ring.replicas_of("b").unwrap();
        assert!((10..=60).contains(&a), "a has {a} replicas");
        assert!((10..=60).contains(&b), "b has {b} replicas");
        // The cold node grew and the hot node shrank (or hit a clamp).
        assert!(a != b, "rebalance left both nodes at {a}");

        // Counters reset after a rebalance.
        assert_eq!(ring.shared.total_hits.load(Ordering::Relaxed), 0);
        ring.close();
    }

    #[test]
    fn test_rebalance_keeps_routing_consistent() {
        let ring = Ring::new(
            RingConfig::new()
                .with_default_replicas(20)
                .with_load_balance_threshold(0.01),
        );
        ring.add(["a", "b", "c"]).unwrap();

        for _ in 0..REBALANCE_MIN_SAMPLE * 2 {
            ring.get("hot-key");
        }
        ring.shared.maybe_rebalance();

        // Routing still lands every key on exactly one live node, and is
        // stable between calls.
        for i in 0..100 {
            let key = format!("key-{i}");
            let node = ring.get(&key).unwrap();
            assert!(["a", "b", "c"].contains(&node.as_str()));
            assert_eq!(ring.get(&key).unwrap(), node);
        }
        ring.close();
    }

    #[test]
    fn test_fnv1a_known_values() {
        // FNV-1a 64-bit reference vectors.
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn test_default_hash_is_stable() {
        assert_eq!(default_hash(b"key"), default_hash(b"key"));
        assert_ne!(default_hash(b"key"), fnv1a(b"key"));
        // Adjacent labels land far apart.
        assert_ne!(default_hash(b"node-0") >> 48, default_hash(b"node-1") >> 48);
    }
}
