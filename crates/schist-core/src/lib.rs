//! Schist Core: contract and primitives for the schist layered blob store
//!
//! This crate defines the abstractions shared by every schist layer:
//! - `BlobStore`: the uniform async blob contract (get/put/delete/list/url)
//! - `Lockable` / `LockManager`: shared-exclusive per-key locking with
//!   read→write upgrade and separate listing locks
//! - `SchistError`: the error surface of the whole stack
//! - Configuration for the cache and packed layers
//!
//! Layers implement `BlobStore` while wrapping another `BlobStore`, so a
//! stack is assembled by plain composition: a terminal backend at the
//! bottom, a cache above it, optionally a packed layout, and a
//! transactional layer on top.

pub mod config;
pub mod error;
pub mod lock_manager;
pub mod lockable;
pub mod traits;

pub use config::{AppendPackedConfig, CacheConfig, JsonPackedConfig};
pub use error::{Result, SchistError};
pub use lock_manager::{LockManager, TxId, TxLocks};
pub use lockable::{Lock, LockId, LockLevel, Lockable};
pub use traits::{BlobStore, EarlyStop, ListOptions};
