//! Packed storage layers
//!
//! Packed stores multiplex many small logical blobs into a bounded
//! number of physical container blobs on the underlying store, tracked
//! by a master index persisted under a reserved key. Two layouts:
//! - `AppendPackedBlobStore`: containers hold concatenated payloads,
//!   entries are located by byte offset and length, container growth is
//!   bounded by body size.
//! - `JsonPackedBlobStore`: containers hold a JSON object mapping
//!   logical key to value, bounded by entry count.
//!
//! Containers are homogeneous in their encrypted flag; allocation only
//! places an entry into a container with a matching flag. Container keys
//! are freshly generated opaque identifiers under the configured root.
//! The master is always stored encrypted.

pub mod append;
pub mod json;

pub use append::AppendPackedBlobStore;
pub use json::JsonPackedBlobStore;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The master index is always persisted with the encrypted tag set.
pub(crate) const MASTER_ENCRYPTED: bool = true;

/// Persisted master record for one append-packed entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AppendMasterRecord {
    pub parent_path: String,
    pub path: String,
    pub position: usize,
    pub length: usize,
    pub encrypted: bool,
}

/// Persisted master record for one json-packed entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JsonMasterRecord {
    pub parent_path: String,
    pub path: String,
    pub encrypted: bool,
}

pub(crate) fn join_root(root: &str, name: &str) -> String {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        name.to_string()
    } else {
        format!("{root}/{name}")
    }
}

/// A fresh opaque container key under `root`.
pub(crate) fn new_container_key(root: &str) -> String {
    join_root(root, &Uuid::new_v4().to_string())
}
