//! Distributed cache groups.
//!
//! A [`Group`] is a namespace of cached values backed by a local store, an
//! optional peer directory, and a user-supplied origin loader. Reads
//! consult the local store, then the peer owning the key (per consistent
//! hashing), then the origin; concurrent misses for the same key are
//! collapsed into one load. Writes apply locally first and replicate to
//! the owning peer best-effort.
//!
//! # Example
//!
//! ```
//! use lattice::{GroupBuilder, loader_fn};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let group = GroupBuilder::new("users")
//!     .loader(loader_fn(|key: String| async move {
//!         Ok(format!("origin:{key}").into_bytes())
//!     }))
//!     .build()
//!     .unwrap();
//!
//! let value = group.get("u:1").await.unwrap();
//! assert_eq!(value.as_slice(), b"origin:u:1");
//! group.close().await.unwrap();
//! # }
//! ```

mod byteview;
mod cache;
mod group;
mod peers;

pub use byteview::ByteView;
pub use cache::Cache;
pub use group::{
    Group, GroupBuilder, GroupError, GroupRegistry, LoadError, Loader, LoaderFn, StatsSnapshot,
    get_group, loader_fn,
};
pub use peers::{Peer, PeerPicker, PickedPeer, TransportError};

// Store configuration is part of the group-building surface.
pub use store::{CacheType, Options as StoreOptions};
