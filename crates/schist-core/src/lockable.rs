//! Shared-exclusive lock primitive for a single key
//!
//! A `Lockable` mediates one key: at most one outstanding write lock, or
//! any number of read locks. Acquisition is opportunistic: contention is
//! reported immediately and never queued. Fairness, if wanted, belongs to
//! the layer above.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Process-unique lock identity. Two locks are the same lock iff their
/// ids are equal; an upgrade keeps the id and changes only the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockId(u64);

impl LockId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        LockId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockLevel {
    Read,
    Write,
}

/// A granted lock. Plain value token: holding a `Lock` confers nothing by
/// itself; the `Lockable` (or `LockManager`) that granted it tracks it by
/// id until released.
#[derive(Debug, Clone)]
pub struct Lock {
    pub level: LockLevel,
    pub id: LockId,
    pub created: Instant,
}

impl Lock {
    pub(crate) fn new(level: LockLevel) -> Self {
        Self {
            level,
            id: LockId::next(),
            created: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
struct LockableState {
    writer: Option<Lock>,
    readers: Vec<Lock>,
}

/// The reader/writer lock for one key.
#[derive(Debug, Default)]
pub struct Lockable {
    state: Mutex<LockableState>,
}

impl Lockable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh lock and attempt acquisition. Returns `None` when
    /// the acquisition rules reject it: any existing writer denies, and a
    /// write request is additionally denied by any existing reader.
    pub fn create_and_acquire(&self, level: LockLevel) -> Option<Lock> {
        let lock = Lock::new(level);
        let mut state = self.state.lock();
        if state.writer.is_some() {
            return None;
        }
        match level {
            LockLevel::Read => {
                state.readers.push(lock.clone());
            }
            LockLevel::Write => {
                if !state.readers.is_empty() {
                    return None;
                }
                state.writer = Some(lock.clone());
            }
        }
        Some(lock)
    }

    /// Upgrade a held read lock to a write lock with the same id. If the
    /// current writer already carries this id, that writer is returned.
    /// Denied while any other reader remains.
    pub fn upgrade(&self, lock: &Lock) -> Option<Lock> {
        let mut state = self.state.lock();
        if let Some(writer) = &state.writer {
            if writer.id == lock.id {
                return Some(writer.clone());
            }
            return None;
        }
        if state.readers.iter().any(|r| r.id != lock.id) {
            return None;
        }
        state.readers.retain(|r| r.id != lock.id);
        let upgraded = Lock {
            level: LockLevel::Write,
            id: lock.id,
            created: lock.created,
        };
        state.writer = Some(upgraded.clone());
        Some(upgraded)
    }

    /// Remove `lock` from whichever position it occupies. Idempotent:
    /// releasing an unknown id is a no-op.
    pub fn release(&self, lock: &Lock) {
        let mut state = self.state.lock();
        if state.writer.as_ref().map(|w| w.id) == Some(lock.id) {
            state.writer = None;
        }
        state.readers.retain(|r| r.id != lock.id);
    }

    pub fn is_locked(&self) -> bool {
        let state = self.state.lock();
        state.writer.is_some() || !state.readers.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        !self.is_locked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_coexist() {
        let lockable = Lockable::new();
        let a = lockable.create_and_acquire(LockLevel::Read).unwrap();
        let b = lockable.create_and_acquire(LockLevel::Read).unwrap();
        assert_ne!(a.id, b.id);
        assert!(lockable.is_locked());
    }

    #[test]
    fn writer_excludes_everyone() {
        let lockable = Lockable::new();
        let _w = lockable.create_and_acquire(LockLevel::Write).unwrap();
        assert!(lockable.create_and_acquire(LockLevel::Read).is_none());
        assert!(lockable.create_and_acquire(LockLevel::Write).is_none());
    }

    #[test]
    fn reader_denies_fresh_writer() {
        let lockable = Lockable::new();
        let _r = lockable.create_and_acquire(LockLevel::Read).unwrap();
        assert!(lockable.create_and_acquire(LockLevel::Write).is_none());
    }

    #[test]
    fn upgrade_keeps_the_id() {
        let lockable = Lockable::new();
        let read = lockable.create_and_acquire(LockLevel::Read).unwrap();
        let write = lockable.upgrade(&read).unwrap();
        assert_eq!(write.id, read.id);
        assert_eq!(write.level, LockLevel::Write);
        // The reader slot is vacated by the upgrade.
        assert!(lockable.create_and_acquire(LockLevel::Read).is_none());
    }

    #[test]
    fn upgrade_denied_while_other_readers_remain() {
        let lockable = Lockable::new();
        let mine = lockable.create_and_acquire(LockLevel::Read).unwrap();
        let _theirs = lockable.create_and_acquire(LockLevel::Read).unwrap();
        assert!(lockable.upgrade(&mine).is_none());
    }

    #[test]
    fn upgrade_of_current_writer_is_idempotent() {
        let lockable = Lockable::new();
        let read = lockable.create_and_acquire(LockLevel::Read).unwrap();
        let first = lockable.upgrade(&read).unwrap();
        let second = lockable.upgrade(&first).unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn release_is_idempotent() {
        let lockable = Lockable::new();
        let lock = lockable.create_and_acquire(LockLevel::Write).unwrap();
        lockable.release(&lock);
        assert!(lockable.is_idle());
        lockable.release(&lock);
        assert!(lockable.is_idle());
        // Idle again, so a new writer is admitted.
        assert!(lockable.create_and_acquire(LockLevel::Write).is_some());
    }
}
