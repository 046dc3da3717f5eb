//! Per-key lock manager
//!
//! A lazy map from key to `Lockable`, plus a separate pool of listing
//! locks. Per-key locks follow the usual shared-exclusive rules; listing
//! locks use opposite-class exclusion instead: any number of concurrent
//! list-reads, any number of concurrent list-writes, but never a foreign
//! read concurrent with a write. The backing list is append/remove-only
//! and collision-free, so same-class concurrency is safe; a reader just
//! must never observe a partial mutation.
//!
//! Negotiation is fail-fast. Denials surface as `SchistError::LockDenied`
//! and are never queued; the queued decorator retries on top of this.

use crate::error::{Result, SchistError};
use crate::lockable::{Lock, LockLevel, Lockable};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-unique transaction identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxId(u64);

impl TxId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TxId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// The locks held by one transaction: at most one lock per key (a write
/// lock implies read access), plus at most one listing lock per class.
#[derive(Debug)]
pub struct TxLocks {
    id: TxId,
    per_key: HashMap<String, Lock>,
    list_read: Option<Lock>,
    list_write: Option<Lock>,
}

impl TxLocks {
    pub fn new() -> Self {
        Self {
            id: TxId::next(),
            per_key: HashMap::new(),
            list_read: None,
            list_write: None,
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    /// The lock held for `key`, if any.
    pub fn lock_for(&self, key: &str) -> Option<&Lock> {
        self.per_key.get(key)
    }

    /// Keys this transaction holds write locks for: its write set.
    pub fn write_keys(&self) -> Vec<String> {
        self.per_key
            .iter()
            .filter(|(_, lock)| lock.level == LockLevel::Write)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn holds_list_read(&self) -> bool {
        self.list_read.is_some()
    }

    pub fn holds_list_write(&self) -> bool {
        self.list_write.is_some()
    }
}

impl Default for TxLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct ListLock {
    owner: TxId,
    level: LockLevel,
}

/// Lazy map from key to `Lockable`, plus the listing-lock pool.
#[derive(Debug, Default)]
pub struct LockManager {
    lockables: Mutex<HashMap<String, Arc<Lockable>>>,
    list_locks: Mutex<Vec<ListLock>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lockable(&self, key: &str) -> Arc<Lockable> {
        let mut lockables = self.lockables.lock();
        lockables
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Lockable::new()))
            .clone()
    }

    /// Ensure `tx` can read `key`. Holding any lock for the key suffices:
    /// a writer implicitly has read access.
    pub fn negotiate_read(&self, tx: &mut TxLocks, key: &str) -> Result<()> {
        if tx.per_key.contains_key(key) {
            return Ok(());
        }
        let lockable = self.lockable(key);
        let lock = lockable
            .create_and_acquire(LockLevel::Read)
            .ok_or_else(|| SchistError::denied(key))?;
        tx.per_key.insert(key.to_string(), lock);
        Ok(())
    }

    /// Ensure `tx` can write `key`, upgrading a held read lock in place.
    pub fn negotiate_write(&self, tx: &mut TxLocks, key: &str) -> Result<()> {
        let lockable = self.lockable(key);
        match tx.per_key.get(key) {
            Some(lock) if lock.level == LockLevel::Write => Ok(()),
            Some(lock) => {
                let upgraded = lockable
                    .upgrade(lock)
                    .ok_or_else(|| SchistError::denied(key))?;
                tx.per_key.insert(key.to_string(), upgraded);
                Ok(())
            }
            None => {
                let lock = lockable
                    .create_and_acquire(LockLevel::Write)
                    .ok_or_else(|| SchistError::denied(key))?;
                tx.per_key.insert(key.to_string(), lock);
                Ok(())
            }
        }
    }

    /// Admit a list-read for `tx` unless another transaction holds a
    /// list-write. Idempotent per transaction; a transaction holding a
    /// list-write may additionally take a list-read.
    pub fn negotiate_list_read(&self, tx: &mut TxLocks) -> Result<()> {
        if tx.list_read.is_some() {
            return Ok(());
        }
        let mut list_locks = self.list_locks.lock();
        if list_locks
            .iter()
            .any(|l| l.owner != tx.id && l.level == LockLevel::Write)
        {
            return Err(SchistError::listing_denied());
        }
        list_locks.push(ListLock {
            owner: tx.id,
            level: LockLevel::Read,
        });
        tx.list_read = Some(Lock::new(LockLevel::Read));
        Ok(())
    }

    /// Admit a list-write for `tx` unless another transaction holds a
    /// list-read. Symmetric to `negotiate_list_read`.
    pub fn negotiate_list_write(&self, tx: &mut TxLocks) -> Result<()> {
        if tx.list_write.is_some() {
            return Ok(());
        }
        let mut list_locks = self.list_locks.lock();
        if list_locks
            .iter()
            .any(|l| l.owner != tx.id && l.level == LockLevel::Read)
        {
            return Err(SchistError::listing_denied());
        }
        list_locks.push(ListLock {
            owner: tx.id,
            level: LockLevel::Write,
        });
        tx.list_write = Some(Lock::new(LockLevel::Write));
        Ok(())
    }

    /// Release every lock `tx` holds, erasing map entries for keys whose
    /// `Lockable` becomes idle.
    pub fn release_all(&self, tx: &mut TxLocks) {
        let mut lockables = self.lockables.lock();
        for (key, lock) in tx.per_key.drain() {
            if let Some(lockable) = lockables.get(&key) {
                lockable.release(&lock);
                if lockable.is_idle() {
                    lockables.remove(&key);
                }
            }
        }
        drop(lockables);

        let mut list_locks = self.list_locks.lock();
        list_locks.retain(|l| l.owner != tx.id);
        tx.list_read = None;
        tx.list_write = None;
    }

    /// Standalone acquisition outside any transaction, for callers that
    /// manage their own lock lifetime (the queued decorator).
    pub fn try_acquire(&self, key: &str, level: LockLevel) -> Result<Lock> {
        self.lockable(key)
            .create_and_acquire(level)
            .ok_or_else(|| SchistError::denied(key))
    }

    /// Release a standalone lock, erasing the map entry once idle.
    pub fn release(&self, key: &str, lock: &Lock) {
        let mut lockables = self.lockables.lock();
        if let Some(lockable) = lockables.get(key) {
            lockable.release(lock);
            if lockable.is_idle() {
                lockables.remove(key);
            }
        }
    }

    /// Whether any per-key lock is outstanding for `key`.
    pub fn is_locked(&self, key: &str) -> bool {
        let lockables = self.lockables.lock();
        lockables.get(key).is_some_and(|l| l.is_locked())
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.lockables.lock().len()
    }
}
