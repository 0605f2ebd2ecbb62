//! Hierarchical resource locks.
//!
//! Locks are keyed by `(resource type, path)` and are shared/exclusive.
//! A thread must take them in `ResourceType` order (volume, then bucket,
//! then key); asking for a volume lock while holding a bucket lock is
//! refused with [`LockError::OrderViolation`] instead of risking deadlock.
//! Locks are not reentrant: the same thread taking the same path twice
//! blocks forever when one of the two is exclusive.
//!
//! Entries are reference counted through their `Arc` and removed from the
//! table once the last holder or waiter goes away.

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use strata_common::{KEY_SEPARATOR, ResourceType};
use tracing::trace;

thread_local! {
    // Locks held by the current thread, per resource type
    static HELD: RefCell<[usize; 3]> = const { RefCell::new([0; 3]) };
}

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("cannot acquire {requested} lock on '{path}' while holding a {held} lock")]
    OrderViolation {
        requested: ResourceType,
        held: ResourceType,
        path: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LockKey {
    resource: ResourceType,
    path: String,
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.path)
    }
}

enum Held {
    Read(ArcRwLockReadGuard<RawRwLock, ()>),
    Write(ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// Lock table shared by all request handlers
#[derive(Default)]
pub struct LockManager {
    locks: Mutex<HashMap<LockKey, Arc<RwLock<()>>>>,
}

impl LockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock on `resource` at `segments` is held in `mode`.
    pub fn acquire(
        &self,
        resource: ResourceType,
        segments: &[&str],
        mode: LockMode,
    ) -> Result<LockGuard<'_>, LockError> {
        let separator = KEY_SEPARATOR.to_string();
        let path = segments.join(separator.as_str());
        if let Some(held) = deepest_held_after(resource) {
            return Err(LockError::OrderViolation {
                requested: resource,
                held,
                path,
            });
        }

        let key = LockKey { resource, path };
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        // The map mutex is released before blocking on the entry
        let held = match mode {
            LockMode::Read => Held::Read(lock.read_arc()),
            LockMode::Write => Held::Write(lock.write_arc()),
        };
        drop(lock);

        HELD.with(|h| h.borrow_mut()[resource.order()] += 1);
        trace!("Acquired {:?} lock on {}", mode, key);
        Ok(LockGuard {
            manager: self,
            key,
            mode,
            held: Some(held),
        })
    }

    pub fn acquire_read(
        &self,
        resource: ResourceType,
        segments: &[&str],
    ) -> Result<LockGuard<'_>, LockError> {
        self.acquire(resource, segments, LockMode::Read)
    }

    pub fn acquire_write(
        &self,
        resource: ResourceType,
        segments: &[&str],
    ) -> Result<LockGuard<'_>, LockError> {
        self.acquire(resource, segments, LockMode::Write)
    }

    /// Number of lock entries currently held or waited on
    pub fn active_locks(&self) -> usize {
        self.locks.lock().len()
    }

    /// Locks of `resource` type the calling thread holds
    pub fn held_by_current_thread(resource: ResourceType) -> usize {
        HELD.with(|h| h.borrow()[resource.order()])
    }

    fn release(&self, key: &LockKey) {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(key) {
            // Only the map's own reference left: nobody holds or waits
            if Arc::strong_count(lock) == 1 {
                locks.remove(key);
            }
        }
    }
}

fn deepest_held_after(resource: ResourceType) -> Option<ResourceType> {
    HELD.with(|h| {
        let held = h.borrow();
        ResourceType::ALL
            .into_iter()
            .rev()
            .find(|t| *t > resource && held[t.order()] > 0)
    })
}

/// RAII guard; the lock is released when dropped
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    key: LockKey,
    mode: LockMode,
    held: Option<Held>,
}

impl LockGuard<'_> {
    pub fn resource(&self) -> ResourceType {
        self.key.resource
    }

    pub fn path(&self) -> &str {
        &self.key.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Release explicitly; same as dropping
    pub fn release(self) {}
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        HELD.with(|h| h.borrow_mut()[self.key.resource.order()] -= 1);
        self.manager.release(&self.key);
        trace!("Released {:?} lock on {}", self.mode, self.key);
    }
}

impl fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
