//! Error types for cluster components.

use lattice::TransportError;

/// Errors surfaced by registry, directory, and server operations.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The registry rejected or failed the operation. Fatal to the
    /// component being constructed.
    #[error("registry error: {0}")]
    Registry(String),

    /// The component has been closed.
    #[error("cluster component is closed")]
    Closed,

    /// Transport failure talking to a peer.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// One or more peer clients failed to close cleanly.
    #[error("directory close failures: {0:?}")]
    CloseFailed(Vec<String>),

    /// Socket-level failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
