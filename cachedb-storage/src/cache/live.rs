//! Shared handle to a cached value.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use cachedb_core::{CacheDbResult, DeepCopy, SyncError};

/// The live, mutable value the cache holds under a key.
///
/// `get` hands out clones of this handle; every clone points at the same
/// value, so a mutation made through any of them is what the cache compares
/// against the baseline when the entry leaves. Mutations made after the
/// entry has left the cache are not written back.
pub struct LiveEntry<T> {
    inner: Arc<RwLock<T>>,
}

impl<T> Clone for LiveEntry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for LiveEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_read() {
            Ok(value) => f.debug_tuple("LiveEntry").field(&*value).finish(),
            Err(_) => f.write_str("LiveEntry(<locked>)"),
        }
    }
}

impl<T> LiveEntry<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(value)),
        }
    }

    /// Borrow the value for reading.
    pub fn read(&self) -> CacheDbResult<RwLockReadGuard<'_, T>> {
        self.inner.read().map_err(|_| SyncError::LockPoisoned.into())
    }

    /// Borrow the value for mutation.
    pub fn write(&self) -> CacheDbResult<RwLockWriteGuard<'_, T>> {
        self.inner.write().map_err(|_| SyncError::LockPoisoned.into())
    }

    /// Mutate the value in place and return the closure's result.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> CacheDbResult<R> {
        let mut guard = self.write()?;
        Ok(f(&mut guard))
    }

    /// Whether two handles point at the same cached value.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: DeepCopy> LiveEntry<T> {
    /// An independent copy of the current value.
    pub fn snapshot(&self) -> CacheDbResult<T> {
        Ok(self.read()?.deep_copy())
    }

    /// Copy of the current value for the write-back path, which must not
    /// fail: a poisoned lock is read through.
    pub(crate) fn copy_for_write_back(&self) -> T {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .deep_copy()
    }
}
