//! Restart coordination lock.
//!
//! The single "stop the world" gate of the device: a VM restart holds it for
//! the whole teardown, and any agent that wants to freeze the VM (a script
//! calling `Blink.lock`, an external freeze request) acquires the same lock.
//! Every acquisition is bounded; failure means "busy", never an error.

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::sync::Arc;
use std::time::Duration;

/// Owned guard; the lock is released when it is dropped.
pub type FreezeGuard = ArcMutexGuard<RawMutex, ()>;

#[derive(Clone, Default)]
pub struct RestartLock {
    inner: Arc<Mutex<()>>,
}

impl RestartLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock, giving up after `timeout`.
    pub fn acquire(&self, timeout: Duration) -> Option<FreezeGuard> {
        self.inner.try_lock_arc_for(timeout)
    }

    pub fn is_held(&self) -> bool {
        self.inner.is_locked()
    }
}
