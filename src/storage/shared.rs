//! Storage lock shared by the slot manager and the reboot procedure.

use crate::config::STORAGE_LOCK_TIMEOUT;
use crate::storage::slot_store::{SlotStore, StoreError};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::time::Duration;

/// Guard over the slot store; holding it excludes every other storage user.
pub type StoreGuard<'a> = MutexGuard<'a, Box<dyn SlotStore>>;

/// Cloneable handle to a slot store behind the storage lock.
///
/// This lock is distinct from the restart lock; the two are never held in
/// opposite orders.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<Box<dyn SlotStore>>>,
}

impl SharedStore {
    pub fn new(store: impl SlotStore + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(store))),
        }
    }

    /// Acquires the storage lock with the default bound.
    pub fn lock(&self) -> Result<StoreGuard<'_>, StoreError> {
        self.try_lock_for(STORAGE_LOCK_TIMEOUT)
            .ok_or(StoreError::Busy)
    }

    /// Acquires the storage lock, giving up after `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<StoreGuard<'_>> {
        self.inner.try_lock_for(timeout)
    }

    pub fn free_space(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.free_space())
    }

    pub fn max_entry_size(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.max_entry_size())
    }
}
