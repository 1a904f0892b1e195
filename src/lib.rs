//! A networked, content-addressed block store.
//!
//! Keys are 32-byte digests chosen by the caller; blocks are opaque
//! payloads up to 8 MiB. Writes are idempotent — a second write of an
//! already-published key is a silent no-op — and the dominant access
//! pattern is existence checking ("do you already have this block?")
//! ahead of any actual transfer.
//!
//! [`image::Image`] is the storage engine: an append-only mapped data
//! file paired with a concurrent key-offset [`index::Index`].
//! [`server::Server`] fronts an `Image` over three TCP channels; the
//! matching [`client`] types talk to it, with an additive local cache
//! that lets repeat existence checks skip the network entirely.

pub mod client;
pub mod datafile;
pub mod digest;
pub mod error;
pub mod image;
pub mod index;
pub mod key;
pub mod limits;
pub mod protocol;
pub mod server;
pub mod stats;

pub use error::{Result, StoreError};
pub use image::{Image, ImageOptions};
pub use key::Key;
