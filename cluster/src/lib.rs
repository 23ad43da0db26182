//! Registry-driven peer discovery and TCP peer transport for cache
//! groups.
//!
//! This crate turns a standalone [`lattice::Group`] into a cluster
//! member:
//!
//! - [`ServiceRegistry`] is the coordination contract: keyed announce
//!   under a renewable lease, plus discovery as a snapshot and a stream of
//!   put/delete events. [`MemoryRegistry`] implements it in-process.
//! - [`ServiceDirectory`] watches the registry, maintains the consistent-
//!   hash ring and one [`PeerClient`] per remote node, and implements
//!   [`lattice::PeerPicker`].
//! - [`PeerServer`] answers peer traffic for the groups registered in a
//!   [`lattice::GroupRegistry`].
//!
//! # Example
//!
//! ```no_run
//! use cluster::{DirectoryOptions, MemoryRegistry, PeerServer, ServiceRegistry};
//! use lattice::{GroupBuilder, GroupRegistry, loader_fn};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(MemoryRegistry::new());
//! let groups = GroupRegistry::new();
//!
//! let server = PeerServer::bind("127.0.0.1:9000", groups.clone()).await?;
//! let _lease = registry.announce("lattice", "127.0.0.1:9000").await?;
//! tokio::spawn(server.serve());
//!
//! let peers = cluster::ServiceDirectory::new(
//!     "127.0.0.1:9000",
//!     registry.as_ref(),
//!     DirectoryOptions::default(),
//! )
//! .await?;
//!
//! let group = GroupBuilder::new("users")
//!     .loader(loader_fn(|key: String| async move { Ok(key.into_bytes()) }))
//!     .peers(peers)
//!     .build_in(&groups)?;
//! # let _ = group;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod directory;
mod error;
pub mod metrics;
mod registry;
mod server;

pub use client::PeerClient;
pub use config::ClusterConfig;
pub use directory::{DirectoryOptions, ServiceDirectory};
pub use error::ClusterError;
pub use registry::{
    DEFAULT_LEASE_TTL, Discovery, EventKind, MemoryRegistry, Registration, ServiceEvent,
    ServiceRegistry,
};
pub use server::PeerServer;
