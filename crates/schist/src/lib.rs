//! Schist: a layered, composable blob store
//!
//! Schist builds object storage out of small decorators around a uniform
//! blob contract. Each layer adds one property while preserving the
//! contract, so layers stack in any order:
//! - **`MemoryBlobStore`**: in-memory terminal backend for tests and
//!   embedding
//! - **`CachedBlobStore`**: write-through or write-deferred caching with
//!   original-value snapshots for rollback
//! - **`TxBlobStore`**: per-key transactional isolation with fail-fast
//!   locking, atomic commit and abort
//! - **`RwLockBlobStore`**: queued reader/writer exclusion for
//!   non-transactional callers
//! - **`AppendPackedBlobStore`** / **`JsonPackedBlobStore`**: packed
//!   layouts that amortize small blobs into large containers
//!
//! # Quick Start
//!
//! ```no_run
//! use schist::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! // The canonical stack: backend → cache → transactions.
//! let store = TxBlobStore::new(MemoryBlobStore::new());
//!
//! store
//!     .transact(|tx| async move {
//!         tx.put("notes/1", "hello", false).await?;
//!         tx.get("notes/1", false).await
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod cached;
pub mod memory;
pub mod packed;
pub mod prelude;
pub mod rw_lock;
pub mod tx;

// Re-export core types
pub use schist_core::{
    AppendPackedConfig, BlobStore, CacheConfig, JsonPackedConfig, ListOptions, Lock, LockId,
    LockLevel, LockManager, Lockable, Result, SchistError, TxId, TxLocks,
};

// Re-export layer implementations
pub use cached::CachedBlobStore;
pub use memory::MemoryBlobStore;
pub use packed::{AppendPackedBlobStore, JsonPackedBlobStore};
pub use rw_lock::RwLockBlobStore;
pub use tx::{Transaction, TxBlobStore};
