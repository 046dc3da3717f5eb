//! Transactional layer
//!
//! `TxBlobStore` wraps a deferred-mode `CachedBlobStore` and negotiates
//! per-key and listing locks on behalf of transactions. Reads and writes
//! funnel through the owned cache; commit flushes exactly the write set
//! to the backend, abort rolls the write set back from snapshots. Lock
//! negotiation is fail-fast: contention surfaces as an error from the
//! operation and is never retried here; callers retry the whole
//! transaction if they want fairness.
//!
//! The store exposes both surfaces of the contract: `transact` runs a
//! body inside one transaction (commit on success, abort on error), and
//! the plain `BlobStore` methods each run as a single-shot transaction
//! around themselves.

use crate::cached::CachedBlobStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use schist_core::{
    BlobStore, CacheConfig, ListOptions, LockManager, Result, SchistError, TxLocks,
};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

struct TxInner {
    locks: TxLocks,
    expired: bool,
}

/// One unit of isolated work. Cheap to clone; all clones share the same
/// lock set and expiry. Once committed or aborted every operation fails
/// with `TransactionExpired`.
pub struct Transaction<S> {
    cache: Arc<CachedBlobStore<S>>,
    manager: Arc<LockManager>,
    inner: Arc<Mutex<TxInner>>,
}

impl<S> Clone for Transaction<S> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            manager: self.manager.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<S: BlobStore> Transaction<S> {
    fn negotiate<R>(
        &self,
        negotiate: impl FnOnce(&LockManager, &mut TxLocks) -> Result<R>,
    ) -> Result<R> {
        let mut inner = self.inner.lock();
        if inner.expired {
            return Err(SchistError::TransactionExpired);
        }
        negotiate(&self.manager, &mut inner.locks)
    }

    pub async fn get(&self, key: &str, encrypted: bool) -> Result<Option<String>> {
        self.negotiate(|manager, locks| manager.negotiate_read(locks, key))?;
        self.cache.get(key, encrypted).await
    }

    pub async fn put(&self, key: &str, value: &str, encrypted: bool) -> Result<()> {
        self.negotiate(|manager, locks| {
            manager.negotiate_write(locks, key)?;
            // A put may create a key, so it conservatively joins the
            // list-writer class.
            manager.negotiate_list_write(locks)
        })?;
        self.cache.put(key, value, encrypted).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.negotiate(|manager, locks| {
            manager.negotiate_write(locks, key)?;
            manager.negotiate_list_write(locks)
        })?;
        self.cache.delete(key).await
    }

    pub async fn list(&self, options: ListOptions) -> Result<Vec<String>> {
        self.negotiate(|manager, locks| manager.negotiate_list_read(locks))?;
        self.cache.list(options).await
    }

    pub async fn url(&self, key: &str) -> Result<Option<String>> {
        self.negotiate(|manager, locks| manager.negotiate_read(locks, key))?;
        self.cache.url(key).await
    }

    /// Flush the write set to the backend, release every lock and expire
    /// the transaction. On a flush failure the transaction still expires
    /// and releases its locks; the first error is returned and keys not
    /// yet flushed keep their pending state in the cache.
    pub async fn commit(&self) -> Result<()> {
        let write_keys = {
            let mut inner = self.inner.lock();
            if inner.expired {
                return Err(SchistError::TransactionExpired);
            }
            inner.expired = true;
            inner.locks.write_keys()
        };

        let mut result = Ok(());
        for key in &write_keys {
            if let Err(error) = self.cache.flush_key(key).await {
                result = Err(error);
                break;
            }
        }

        let mut inner = self.inner.lock();
        self.manager.release_all(&mut inner.locks);
        debug!(keys = write_keys.len(), "transaction committed");
        result
    }

    /// Restore every key in the write set to its pre-transaction state,
    /// release every lock and expire the transaction. Touches no
    /// backend.
    pub fn abort(&self) -> Result<()> {
        let write_keys = {
            let mut inner = self.inner.lock();
            if inner.expired {
                return Err(SchistError::TransactionExpired);
            }
            inner.expired = true;
            inner.locks.write_keys()
        };

        for key in &write_keys {
            self.cache.abort_key(key);
        }

        let mut inner = self.inner.lock();
        self.manager.release_all(&mut inner.locks);
        debug!(keys = write_keys.len(), "transaction aborted");
        Ok(())
    }

    pub fn is_expired(&self) -> bool {
        self.inner.lock().expired
    }
}

/// Transactional decorator over any `BlobStore`.
pub struct TxBlobStore<S> {
    cache: Arc<CachedBlobStore<S>>,
    manager: Arc<LockManager>,
}

impl<S: BlobStore> TxBlobStore<S> {
    /// Wrap `inner` in a deferred-mode cache and a lock manager.
    pub fn new(inner: S) -> Self {
        Self {
            cache: Arc::new(CachedBlobStore::with_config(inner, CacheConfig::deferred())),
            manager: Arc::new(LockManager::new()),
        }
    }

    /// The cache all transactions read and write through.
    pub fn cache(&self) -> &CachedBlobStore<S> {
        &self.cache
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.manager
    }

    /// Start a transaction. It holds no locks until its first operation.
    pub fn begin(&self) -> Transaction<S> {
        Transaction {
            cache: self.cache.clone(),
            manager: self.manager.clone(),
            inner: Arc::new(Mutex::new(TxInner {
                locks: TxLocks::new(),
                expired: false,
            })),
        }
    }

    /// Run `body` inside one transaction: commit when it returns `Ok`,
    /// abort and re-raise when it returns `Err`.
    pub async fn transact<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce(Transaction<S>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let tx = self.begin();
        match body(tx.clone()).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(error) => {
                if let Err(abort_error) = tx.abort() {
                    warn!(%abort_error, "abort after failed transaction body");
                }
                Err(error)
            }
        }
    }
}

#[async_trait]
impl<S: BlobStore> BlobStore for TxBlobStore<S> {
    async fn get(&self, key: &str, encrypted: bool) -> Result<Option<String>> {
        self.transact(|tx| async move { tx.get(key, encrypted).await })
            .await
    }

    async fn put(&self, key: &str, value: &str, encrypted: bool) -> Result<()> {
        self.transact(|tx| async move { tx.put(key, value, encrypted).await })
            .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.transact(|tx| async move { tx.delete(key).await }).await
    }

    async fn list(&self, options: ListOptions) -> Result<Vec<String>> {
        self.transact(|tx| async move { tx.list(options).await })
            .await
    }

    async fn url(&self, key: &str) -> Result<Option<String>> {
        self.transact(|tx| async move { tx.url(key).await }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBlobStore;

    fn store() -> (Arc<MemoryBlobStore>, TxBlobStore<Arc<MemoryBlobStore>>) {
        let backend = Arc::new(MemoryBlobStore::new());
        (backend.clone(), TxBlobStore::new(backend))
    }

    #[tokio::test]
    async fn commit_flushes_the_write_set() {
        let (backend, store) = store();
        let tx = store.begin();
        tx.put("file1", "content1", false).await.unwrap();
        assert_eq!(backend.put_count(), 0);
        tx.commit().await.unwrap();
        assert_eq!(backend.put_count(), 1);
        assert_eq!(
            backend.get("file1", false).await.unwrap(),
            Some("content1".to_string())
        );
    }

    #[tokio::test]
    async fn abort_rolls_back_and_releases_locks() {
        let (backend, store) = store();
        store.put("file1", "content1", false).await.unwrap();

        let tx = store.begin();
        tx.put("file1", "content2", false).await.unwrap();
        tx.abort().unwrap();

        assert_eq!(
            backend.get("file1", false).await.unwrap(),
            Some("content1".to_string())
        );
        // The key is lockable again.
        let tx2 = store.begin();
        tx2.put("file1", "content3", false).await.unwrap();
        tx2.commit().await.unwrap();
    }

    #[tokio::test]
    async fn expired_transactions_reject_every_operation() {
        let (_backend, store) = store();
        let tx = store.begin();
        tx.put("file1", "x", false).await.unwrap();
        tx.commit().await.unwrap();

        assert!(matches!(
            tx.get("file1", false).await,
            Err(SchistError::TransactionExpired)
        ));
        assert!(matches!(
            tx.commit().await,
            Err(SchistError::TransactionExpired)
        ));
        assert!(matches!(tx.abort(), Err(SchistError::TransactionExpired)));
        assert!(tx.is_expired());
    }

    #[tokio::test]
    async fn reads_observe_earlier_writes_in_the_same_transaction() {
        let (_backend, store) = store();
        store.put("file1", "before", false).await.unwrap();

        store
            .transact(|tx| async move {
                assert_eq!(
                    tx.get("file1", false).await?,
                    Some("before".to_string())
                );
                tx.put("file1", "after", false).await?;
                assert_eq!(tx.get("file1", false).await?, Some("after".to_string()));
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn writer_blocks_foreign_readers_and_writers() {
        let (_backend, store) = store();
        let writer = store.begin();
        writer.put("file1", "x", false).await.unwrap();

        let other = store.begin();
        assert!(other.get("file1", false).await.unwrap_err().is_contention());
        assert!(other
            .put("file1", "y", false)
            .await
            .unwrap_err()
            .is_contention());

        writer.commit().await.unwrap();
        let after = store.begin();
        assert_eq!(after.get("file1", false).await.unwrap(), Some("x".into()));
        after.commit().await.unwrap();
    }

    #[tokio::test]
    async fn readers_coexist_but_deny_a_foreign_upgrade() {
        let (_backend, store) = store();
        let a = store.begin();
        let b = store.begin();
        a.get("file1", false).await.unwrap();
        b.get("file1", false).await.unwrap();
        // Both read fine; neither can now write while the other reads.
        assert!(a.put("file1", "x", false).await.unwrap_err().is_contention());
        b.abort().unwrap();
        // With the foreign reader gone the upgrade succeeds.
        a.put("file1", "x", false).await.unwrap();
        a.commit().await.unwrap();
    }

    #[tokio::test]
    async fn listing_excludes_foreign_mutators() {
        let (_backend, store) = store();
        let lister = store.begin();
        lister.list(ListOptions::new()).await.unwrap();

        let mutator = store.begin();
        assert!(mutator
            .put("file1", "x", false)
            .await
            .unwrap_err()
            .is_contention());
        assert!(mutator.delete("file2").await.unwrap_err().is_contention());

        // Another reader is fine.
        let reader = store.begin();
        reader.list(ListOptions::new()).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_writers_of_different_keys_coexist() {
        let (backend, store) = store();
        let a = store.begin();
        let b = store.begin();
        a.put("file1", "1", false).await.unwrap();
        b.put("file2", "2", false).await.unwrap();
        a.commit().await.unwrap();
        b.commit().await.unwrap();
        assert_eq!(backend.len(), 2);
    }

    #[tokio::test]
    async fn transact_aborts_on_body_error() {
        let (backend, store) = store();
        store.put("file1", "content1", false).await.unwrap();

        let result: Result<()> = store
            .transact(|tx| async move {
                tx.put("file1", "content2", false).await?;
                Err(SchistError::Backend(anyhow::anyhow!("boom")))
            })
            .await;
        assert!(result.is_err());

        assert_eq!(
            backend.get("file1", false).await.unwrap(),
            Some("content1".to_string())
        );
    }

    #[tokio::test]
    async fn direct_calls_are_single_shot_transactions() {
        let (backend, store) = store();
        store.put("file1", "content1", true).await.unwrap();
        assert_eq!(backend.put_count(), 1);
        assert_eq!(backend.encrypted_tag("file1"), Some(true));

        // All locks were released, so a fresh writer is admitted.
        let tx = store.begin();
        tx.put("file1", "content2", true).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(
            store.get("file1", true).await.unwrap(),
            Some("content2".to_string())
        );
        store.delete("file1").await.unwrap();
        assert_eq!(store.get("file1", true).await.unwrap(), None);
    }
}
