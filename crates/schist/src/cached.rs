//! Caching layer with deferred write-back
//!
//! `CachedBlobStore` decorates another `BlobStore` with an in-memory
//! cache that tracks three kinds of per-key knowledge: a positive value,
//! a negative result (the backend reported the key absent), and
//! listed-but-unread placeholders ingested from a full listing.
//!
//! Mutations are applied to the cache first. In write-through mode
//! (`auto_flushing`) each mutation is pushed to the backend immediately;
//! in deferred mode mutations accumulate until `flush_all`/`flush_key`,
//! and `abort_all`/`abort_key` roll them back from original-value
//! snapshots taken lazily at the first mutation of a key. The
//! transactional layer runs its cache deferred and drives flush/abort
//! from commit and abort.

use async_trait::async_trait;
use parking_lot::Mutex;
use schist_core::{BlobStore, CacheConfig, ListOptions, Result};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Modification {
    Updated,
    Deleted,
}

/// Pre-mutation state of a key, kept for rollback while a modification
/// is outstanding.
#[derive(Debug, Clone)]
struct Snapshot {
    value: Option<String>,
    encrypted: bool,
    negative: bool,
}

#[derive(Debug, Clone, Default)]
struct CacheEntry {
    current: Option<String>,
    negative: bool,
    modification: Option<Modification>,
    original: Option<Snapshot>,
    last_encrypt: bool,
    url: Option<String>,
}

impl CacheEntry {
    /// Deleted or known-absent. A plain placeholder from a listing is
    /// not absent: the value just has not been read yet.
    fn is_absent(&self) -> bool {
        self.negative
    }

    /// Record the pre-mutation state once per modification cycle. Keys
    /// whose prior state was never observable in the cache get no
    /// snapshot; rollback forgets them entirely.
    fn snapshot_before_mutation(&mut self) {
        if self.modification.is_some() {
            return;
        }
        self.original = if self.current.is_some() || self.negative {
            Some(Snapshot {
                value: self.current.clone(),
                encrypted: self.last_encrypt,
                negative: self.negative,
            })
        } else {
            None
        };
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    // First-touch order; listings replay it.
    order: Vec<String>,
    listed: bool,
}

impl CacheState {
    fn entry_mut(&mut self, key: &str) -> &mut CacheEntry {
        if !self.entries.contains_key(key) {
            self.order.push(key.to_string());
        }
        self.entries.entry(key.to_string()).or_default()
    }

    fn forget(&mut self, key: &str) {
        self.entries.remove(key);
        self.order.retain(|name| name != key);
    }
}

enum PendingWrite {
    Put { value: String, encrypted: bool },
    Delete,
}

/// Write-through or write-deferred cache over another `BlobStore`.
pub struct CachedBlobStore<S> {
    inner: S,
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl<S: BlobStore> CachedBlobStore<S> {
    /// Write-through cache with the default configuration.
    pub fn new(inner: S) -> Self {
        Self::with_config(inner, CacheConfig::default())
    }

    pub fn with_config(inner: S, config: CacheConfig) -> Self {
        Self {
            inner,
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether `key` has a modification waiting to be flushed.
    pub fn is_modified(&self, key: &str) -> bool {
        let state = self.state.lock();
        state
            .entries
            .get(key)
            .is_some_and(|e| e.modification.is_some())
    }

    /// Keys with outstanding modifications, in first-touch order.
    pub fn modified_keys(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter(|key| {
                state
                    .entries
                    .get(*key)
                    .is_some_and(|e| e.modification.is_some())
            })
            .cloned()
            .collect()
    }

    /// Apply the pending modification for `key` to the backend, then
    /// forget both the modification and its rollback snapshot.
    pub async fn flush_key(&self, key: &str) -> Result<()> {
        let pending = {
            let state = self.state.lock();
            state.entries.get(key).and_then(|e| match e.modification {
                Some(Modification::Updated) => e.current.clone().map(|value| PendingWrite::Put {
                    value,
                    encrypted: e.last_encrypt,
                }),
                Some(Modification::Deleted) => Some(PendingWrite::Delete),
                None => None,
            })
        };

        match pending {
            Some(PendingWrite::Put { value, encrypted }) => {
                self.inner.put(key, &value, encrypted).await?;
                debug!(key, "flushed update to backend");
            }
            Some(PendingWrite::Delete) => {
                self.inner.delete(key).await?;
                debug!(key, "flushed delete to backend");
            }
            None => return Ok(()),
        }

        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.modification = None;
            entry.original = None;
        }
        Ok(())
    }

    /// Flush every pending modification, in first-touch order.
    pub async fn flush_all(&self) -> Result<()> {
        for key in self.modified_keys() {
            self.flush_key(&key).await?;
        }
        Ok(())
    }

    /// Roll `key` back to its pre-mutation state. Touches no backend.
    pub fn abort_key(&self, key: &str) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        if entry.modification.is_none() {
            return;
        }
        match entry.original.take() {
            Some(snapshot) => {
                entry.current = snapshot.value;
                entry.last_encrypt = snapshot.encrypted;
                entry.negative = snapshot.negative;
                entry.modification = None;
            }
            None => {
                // Nothing was known about the key before the mutation.
                state.forget(key);
            }
        }
        debug!(key, "aborted pending modification");
    }

    /// Roll back every pending modification.
    pub fn abort_all(&self) {
        for key in self.modified_keys() {
            self.abort_key(&key);
        }
    }

    /// Forget everything cached about `key`, pending modifications
    /// included, and invalidate the full-listing flag.
    pub fn clear_key(&self, key: &str) {
        let mut state = self.state.lock();
        state.forget(key);
        state.listed = false;
    }

    /// Forget the whole cache.
    pub fn clear_all(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
        state.listed = false;
    }

    async fn ingest_listing(&self) -> Result<()> {
        let names = self.inner.list(ListOptions::new()).await?;
        let mut state = self.state.lock();
        if state.listed {
            return Ok(());
        }
        for name in names {
            let known_absent = state.entries.get(&name).map(|e| e.is_absent());
            match known_absent {
                Some(true) => continue,
                Some(false) => {}
                // Placeholder: listed but unread.
                None => {
                    state.entry_mut(&name);
                }
            }
        }
        state.listed = true;
        Ok(())
    }
}

#[async_trait]
impl<S: BlobStore> BlobStore for CachedBlobStore<S> {
    async fn get(&self, key: &str, encrypted: bool) -> Result<Option<String>> {
        {
            let state = self.state.lock();
            if let Some(entry) = state.entries.get(key) {
                if entry.is_absent() {
                    return Ok(None);
                }
                if let Some(value) = &entry.current {
                    return Ok(Some(value.clone()));
                }
            }
        }

        let fetched = self.inner.get(key, encrypted).await?;

        let mut state = self.state.lock();
        let entry = state.entry_mut(key);
        if entry.modification.is_some() || entry.current.is_some() || entry.negative {
            // Another task resolved the key while the fetch was in
            // flight; its answer wins over the stale backend read.
            if entry.is_absent() {
                return Ok(None);
            }
            return Ok(entry.current.clone());
        }
        match &fetched {
            Some(value) => {
                entry.current = Some(value.clone());
                entry.negative = false;
            }
            None => entry.negative = true,
        }
        entry.last_encrypt = encrypted;
        Ok(fetched)
    }

    async fn put(&self, key: &str, value: &str, encrypted: bool) -> Result<()> {
        {
            let mut state = self.state.lock();
            let entry = state.entry_mut(key);
            entry.snapshot_before_mutation();
            entry.current = Some(value.to_string());
            entry.last_encrypt = encrypted;
            entry.modification = Some(Modification::Updated);
            entry.negative = false;
        }
        if self.config.auto_flushing {
            self.flush_key(key).await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            let entry = state.entry_mut(key);
            entry.snapshot_before_mutation();
            entry.current = None;
            entry.negative = true;
            entry.modification = Some(Modification::Deleted);
        }
        if self.config.auto_flushing {
            self.flush_key(key).await?;
        }
        Ok(())
    }

    async fn list(&self, options: ListOptions) -> Result<Vec<String>> {
        let needs_ingest = !self.state.lock().listed;
        if needs_ingest {
            self.ingest_listing().await?;
        }

        let state = self.state.lock();
        let names: Vec<String> = state
            .order
            .iter()
            .filter(|key| state.entries.get(*key).is_some_and(|e| !e.is_absent()))
            .cloned()
            .collect();
        Ok(options.apply(names))
    }

    async fn url(&self, key: &str) -> Result<Option<String>> {
        if self.config.cache_file_urls {
            let state = self.state.lock();
            if let Some(url) = state.entries.get(key).and_then(|e| e.url.clone()) {
                return Ok(Some(url));
            }
        }
        let fetched = self.inner.url(key).await?;
        if self.config.cache_file_urls {
            if let Some(url) = &fetched {
                let mut state = self.state.lock();
                state.entry_mut(key).url = Some(url.clone());
            }
        }
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBlobStore;
    use std::sync::Arc;

    fn deferred() -> (Arc<MemoryBlobStore>, CachedBlobStore<Arc<MemoryBlobStore>>) {
        let backend = Arc::new(MemoryBlobStore::new());
        let cache = CachedBlobStore::with_config(backend.clone(), CacheConfig::deferred());
        (backend, cache)
    }

    #[tokio::test]
    async fn read_through_populates_the_cache() {
        let (backend, cache) = deferred();
        backend.put("file1", "content1", false).await.unwrap();
        let before = backend.get_count();

        assert_eq!(
            cache.get("file1", false).await.unwrap(),
            Some("content1".to_string())
        );
        assert_eq!(
            cache.get("file1", false).await.unwrap(),
            Some("content1".to_string())
        );
        assert_eq!(backend.get_count(), before + 1);
    }

    #[tokio::test]
    async fn negative_results_are_cached() {
        let (backend, cache) = deferred();
        assert_eq!(cache.get("missing", false).await.unwrap(), None);
        assert_eq!(cache.get("missing", false).await.unwrap(), None);
        assert_eq!(backend.get_count(), 1);
    }

    #[tokio::test]
    async fn write_through_reaches_the_backend_immediately() {
        let backend = Arc::new(MemoryBlobStore::new());
        let cache = CachedBlobStore::new(backend.clone());
        cache.put("file1", "content1", false).await.unwrap();
        assert_eq!(backend.put_count(), 1);
        cache.delete("file1").await.unwrap();
        assert_eq!(backend.delete_count(), 1);
        assert!(!cache.is_modified("file1"));
    }

    #[tokio::test]
    async fn deferred_trace_flushes_to_net_effect() {
        let (backend, cache) = deferred();

        // A mixed trace over two keys: 6 puts, 2 deletes, 12 gets and a
        // listing. file1 ends deleted; file2 survives with its latest
        // value.
        cache.put("file1", "c1", false).await.unwrap();
        cache.get("file1", false).await.unwrap();
        cache.put("file2", "c2", false).await.unwrap();
        cache.get("file2", false).await.unwrap();
        cache.put("file1", "c3", false).await.unwrap();
        cache.get("file1", false).await.unwrap();
        cache.delete("file1").await.unwrap();
        cache.get("file1", false).await.unwrap();
        cache.put("file1", "c4", false).await.unwrap();
        cache.get("file1", false).await.unwrap();
        cache.put("file2", "c5", false).await.unwrap();
        cache.get("file2", false).await.unwrap();
        cache.delete("file1").await.unwrap();
        cache.get("file1", false).await.unwrap();
        cache.get("file2", false).await.unwrap();
        cache.list(ListOptions::new()).await.unwrap();
        cache.get("file1", false).await.unwrap();
        cache.get("file2", false).await.unwrap();
        cache.put("file2", "c6", false).await.unwrap();
        cache.get("file2", false).await.unwrap();
        cache.get("file2", false).await.unwrap();

        // Nothing mutating has reached the backend yet.
        assert_eq!(backend.put_count(), 0);
        assert_eq!(backend.delete_count(), 0);

        cache.flush_all().await.unwrap();

        // Net effect only: one delete for file1, one put for file2.
        assert_eq!(backend.put_count(), 1);
        assert_eq!(backend.delete_count(), 1);
        assert_eq!(
            backend.get("file2", false).await.unwrap(),
            Some("c6".to_string())
        );
        assert_eq!(backend.get("file1", false).await.unwrap(), None);
        assert!(cache.modified_keys().is_empty());
    }

    #[tokio::test]
    async fn abort_restores_the_pre_mutation_value() {
        let (backend, cache) = deferred();
        backend.put("file1", "original", true).await.unwrap();

        // Populate, then mutate twice; the snapshot is taken once.
        cache.get("file1", true).await.unwrap();
        cache.put("file1", "draft1", false).await.unwrap();
        cache.put("file1", "draft2", false).await.unwrap();
        assert!(cache.is_modified("file1"));

        cache.abort_key("file1");
        assert!(!cache.is_modified("file1"));
        assert_eq!(
            cache.get("file1", true).await.unwrap(),
            Some("original".to_string())
        );
        // The abort never touched the backend.
        assert_eq!(backend.put_count(), 1);
    }

    #[tokio::test]
    async fn abort_of_an_unseen_key_forgets_it() {
        let (backend, cache) = deferred();
        cache.put("fresh", "value", false).await.unwrap();
        cache.abort_key("fresh");
        // The key falls back to the backend, which never saw it.
        assert_eq!(cache.get("fresh", false).await.unwrap(), None);
        assert_eq!(backend.put_count(), 0);
    }

    #[tokio::test]
    async fn abort_restores_a_cached_absence() {
        let (_backend, cache) = deferred();
        // Known-absent, then created, then rolled back.
        assert_eq!(cache.get("ghost", false).await.unwrap(), None);
        cache.put("ghost", "value", false).await.unwrap();
        cache.abort_key("ghost");
        assert_eq!(cache.get("ghost", false).await.unwrap(), None);
    }

    #[tokio::test]
    async fn listing_is_ingested_once_and_served_from_cache() {
        let (backend, cache) = deferred();
        backend.put("a/1", "1", false).await.unwrap();
        backend.put("a/2", "2", false).await.unwrap();

        let first = cache.list(ListOptions::new()).await.unwrap();
        let second = cache.list(ListOptions::new()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.list_count(), 1);

        // Placeholders resolve lazily on read.
        assert_eq!(cache.get("a/1", false).await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn listing_stops_early_in_insertion_order() {
        let (_backend, cache) = deferred();
        for key in ["a/1", "a/2", "a/3", "b/1"] {
            cache.put(key, "x", false).await.unwrap();
        }
        let names = cache
            .list(ListOptions::new().with_early_stop(|name| name.starts_with("a/")))
            .await
            .unwrap();
        assert_eq!(
            names,
            vec!["a/1".to_string(), "a/2".to_string(), "a/3".to_string()]
        );
    }

    #[tokio::test]
    async fn deleted_keys_disappear_from_listings() {
        let (backend, cache) = deferred();
        backend.put("keep", "1", false).await.unwrap();
        backend.put("drop", "2", false).await.unwrap();

        cache.delete("drop").await.unwrap();
        let names = cache.list(ListOptions::new()).await.unwrap();
        assert_eq!(names, vec!["keep".to_string()]);
    }

    #[tokio::test]
    async fn clear_invalidates_the_listing_flag() {
        let (backend, cache) = deferred();
        backend.put("file1", "1", false).await.unwrap();
        cache.list(ListOptions::new()).await.unwrap();
        cache.clear_all();
        cache.list(ListOptions::new()).await.unwrap();
        assert_eq!(backend.list_count(), 2);
    }

    #[tokio::test]
    async fn clearing_one_key_drops_its_pending_state() {
        let (backend, cache) = deferred();
        cache.put("file1", "draft", false).await.unwrap();
        cache.clear_key("file1");

        assert!(!cache.is_modified("file1"));
        cache.flush_all().await.unwrap();
        assert_eq!(backend.put_count(), 0);
        // The next read goes back to the backend.
        assert_eq!(cache.get("file1", false).await.unwrap(), None);
        assert_eq!(backend.get_count(), 1);
    }

    #[tokio::test]
    async fn urls_are_cached_when_configured() {
        let (backend, cache) = deferred();
        backend.put("file1", "1", false).await.unwrap();
        let url = cache.url("file1").await.unwrap();
        assert_eq!(url, Some("memory://file1".to_string()));
        cache.url("file1").await.unwrap();
        assert_eq!(backend.url_count(), 1);

        let uncached = CachedBlobStore::with_config(
            backend.clone(),
            CacheConfig::default().with_cache_file_urls(false),
        );
        uncached.url("file1").await.unwrap();
        uncached.url("file1").await.unwrap();
        assert_eq!(backend.url_count(), 3);
    }

    #[tokio::test]
    async fn flushed_encrypted_tag_matches_the_last_write() {
        let (backend, cache) = deferred();
        cache.put("file1", "secret", true).await.unwrap();
        cache.flush_all().await.unwrap();
        assert_eq!(backend.encrypted_tag("file1"), Some(true));
    }
}
