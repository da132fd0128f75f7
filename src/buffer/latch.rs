//! Page content latch.
//!
//! A short-duration reader/writer latch protecting one frame's bytes,
//! distinct from the buffer pool mutex. Latch crabbing acquires a child's
//! latch before releasing the parent's, so acquisition and release happen at
//! different points in the call tree; the raw lock API gives us that without
//! threading guard lifetimes through the tree code.
//!
//! parking_lot's task-fair queuing provides writer preference: once a writer
//! is waiting, newly arriving readers queue behind it.

use parking_lot::lock_api::RawRwLock;
use parking_lot::RwLock;

#[derive(Debug, Default)]
pub struct Latch {
    lock: RwLock<()>,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            lock: RwLock::new(()),
        }
    }

    /// Acquire the read latch, blocking while a writer holds or awaits it
    pub fn rlock(&self) {
        unsafe { self.lock.raw() }.lock_shared();
    }

    /// Release the read latch
    ///
    /// The caller must hold the read latch.
    pub fn runlock(&self) {
        unsafe { self.lock.raw().unlock_shared() };
    }

    /// Acquire the write latch, blocking until all readers drain
    pub fn wlock(&self) {
        unsafe { self.lock.raw() }.lock_exclusive();
    }

    /// Release the write latch
    ///
    /// The caller must hold the write latch.
    pub fn wunlock(&self) {
        unsafe { self.lock.raw().unlock_exclusive() };
    }

    #[cfg(test)]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}
