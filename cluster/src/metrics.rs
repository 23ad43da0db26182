//! Cluster metrics.

use metriken::{Counter, metric};

#[metric(
    name = "peer_requests",
    description = "Requests sent to remote peers"
)]
pub static PEER_REQUESTS: Counter = Counter::new();

#[metric(
    name = "peer_errors",
    description = "Peer requests that failed with a transport error"
)]
pub static PEER_ERRORS: Counter = Counter::new();

#[metric(
    name = "peer_timeouts",
    description = "Peer requests that exceeded their deadline"
)]
pub static PEER_TIMEOUTS: Counter = Counter::new();

#[metric(
    name = "directory_peers_added",
    description = "Peers added to the directory"
)]
pub static PEERS_ADDED: Counter = Counter::new();

#[metric(
    name = "directory_peers_removed",
    description = "Peers removed from the directory"
)]
pub static PEERS_REMOVED: Counter = Counter::new();

#[metric(
    name = "registry_events",
    description = "Registry change events observed by directories"
)]
pub static REGISTRY_EVENTS: Counter = Counter::new();

#[metric(
    name = "server_connections",
    description = "Peer connections accepted by the server"
)]
pub static SERVER_CONNECTIONS: Counter = Counter::new();

#[metric(
    name = "server_requests",
    description = "Peer requests served"
)]
pub static SERVER_REQUESTS: Counter = Counter::new();

#[metric(
    name = "server_errors",
    description = "Peer requests answered with an error"
)]
pub static SERVER_ERRORS: Counter = Counter::new();
