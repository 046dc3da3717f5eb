//! In-memory terminal backend
//!
//! The simplest `BlobStore`: an insertion-ordered in-process map. It backs
//! tests (the operation counters let a test assert exactly what reached
//! the backend) and embedded uses that want the upper layers without any
//! external storage.

use async_trait::async_trait;
use parking_lot::Mutex;
use schist_core::{BlobStore, ListOptions, Result};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone)]
struct StoredBlob {
    value: String,
    encrypted: bool,
}

/// In-memory blob store with per-operation counters.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    // Insertion-ordered; overwrites keep their slot.
    entries: Mutex<Vec<(String, StoredBlob)>>,
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    lists: AtomicU64,
    urls: AtomicU64,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` calls that reached this store.
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// Number of `put` calls that reached this store.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Number of `delete` calls that reached this store.
    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Number of `list` calls that reached this store.
    pub fn list_count(&self) -> u64 {
        self.lists.load(Ordering::Relaxed)
    }

    /// Number of `url` calls that reached this store.
    pub fn url_count(&self) -> u64 {
        self.urls.load(Ordering::Relaxed)
    }

    /// Number of blobs currently stored.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// The stored encrypted tag for `key`, if present.
    pub fn encrypted_tag(&self, key: &str) -> Option<bool> {
        let entries = self.entries.lock();
        entries
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, blob)| blob.encrypted)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str, _encrypted: bool) -> Result<Option<String>> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, blob)| blob.value.clone()))
    }

    async fn put(&self, key: &str, value: &str, encrypted: bool) -> Result<()> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        let blob = StoredBlob {
            value: value.to_string(),
            encrypted,
        };
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|(name, _)| name == key) {
            Some((_, slot)) => *slot = blob,
            None => entries.push((key.to_string(), blob)),
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock();
        entries.retain(|(name, _)| name != key);
        Ok(())
    }

    async fn list(&self, options: ListOptions) -> Result<Vec<String>> {
        self.lists.fetch_add(1, Ordering::Relaxed);
        let names: Vec<String> = {
            let entries = self.entries.lock();
            entries.iter().map(|(name, _)| name.clone()).collect()
        };
        Ok(options.apply(names))
    }

    async fn url(&self, key: &str) -> Result<Option<String>> {
        self.urls.fetch_add(1, Ordering::Relaxed);
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .any(|(name, _)| name == key)
            .then(|| format!("memory://{key}")))
    }
}
