//! Schist Prelude
//!
//! Import this to get all commonly used types and traits:
//!
//! ```
//! use schist::prelude::*;
//! ```

// Contract and errors
pub use crate::{BlobStore, ListOptions, Result, SchistError};

// Configs
pub use crate::{AppendPackedConfig, CacheConfig, JsonPackedConfig};

// Layers
pub use crate::{
    AppendPackedBlobStore, CachedBlobStore, JsonPackedBlobStore, MemoryBlobStore, RwLockBlobStore,
    Transaction, TxBlobStore,
};

// Locking
pub use crate::{Lock, LockLevel, LockManager, Lockable};

// Re-export common external deps
pub use std::sync::Arc;
