//! Peer abstractions: transport to a remote cache node and the picker
//! that maps keys onto peers.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Errors surfaced by peer transports and directories.
///
/// Variants carry strings rather than sources so that outcomes can be
/// shared across coalesced waiters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The session or directory was closed locally.
    #[error("peer session closed")]
    Closed,
    /// The per-request deadline elapsed.
    #[error("request timed out")]
    Timeout,
    /// Dialing the peer failed.
    #[error("connection failed: {0}")]
    Connect(String),
    /// The session failed mid-request.
    #[error("io error: {0}")]
    Io(String),
    /// The peer answered with something unparseable or unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The peer answered with an application-level error.
    #[error("remote error: {0}")]
    Remote(String),
}

/// A remote cache node serving one or more groups.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Fetch the value for `(group, key)` from the peer.
    async fn get(&self, group: &str, key: &str) -> Result<Bytes, TransportError>;

    /// Replicate a write to the peer. The caller controls the deadline.
    async fn set(&self, group: &str, key: &str, value: Bytes) -> Result<(), TransportError>;

    /// Remove `(group, key)` on the peer. Returns whether a live entry
    /// was removed there.
    async fn delete(&self, group: &str, key: &str) -> Result<bool, TransportError>;

    /// Tear down the session. Subsequent requests fail with
    /// [`TransportError::Closed`].
    async fn close(&self) -> Result<(), TransportError>;
}

/// Result of routing a key through a [`PeerPicker`].
#[derive(Clone)]
pub enum PickedPeer {
    /// The key belongs to a remote node.
    Remote(Arc<dyn Peer>),
    /// This node owns the key.
    Local,
}

/// Maps keys onto cluster peers.
#[async_trait]
pub trait PeerPicker: Send + Sync {
    /// Route a key to its owner. `None` when the cluster view is empty or
    /// the owner has no usable client.
    fn pick(&self, key: &str) -> Option<PickedPeer>;

    /// Close every owned peer client and stop watching the registry.
    async fn close(&self) -> Result<(), TransportError>;
}
