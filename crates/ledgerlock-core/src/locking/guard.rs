//! Lock guards for RAII-style lock management
//!
//! Guards release their lock when dropped, ensuring cleanup even when the
//! protected operation returns early, panics, or its future is cancelled.

use super::manager::LockManager;
use super::types::{Lock, LockAcquisition, LockError, LockResult, LockType};
use std::fmt;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// A held lock that is released when the guard is dropped
#[derive(Debug)]
pub struct LockGuard {
    /// Manager that granted the lock
    manager: LockManager,

    /// The held lock
    lock: Lock,

    /// Time spent queued before the grant
    waited: Duration,

    /// Whether the lock has been explicitly released
    released: bool,
}

impl LockGuard {
    pub(crate) fn new(manager: LockManager, acquisition: LockAcquisition) -> Self {
        Self {
            manager,
            lock: acquisition.lock,
            waited: acquisition.waited,
            released: false,
        }
    }

    /// Get the lock ID
    pub fn id(&self) -> Uuid {
        self.lock.id
    }

    /// Get the resource ID
    pub fn resource_id(&self) -> &str {
        &self.lock.resource_id
    }

    /// Kind of access the lock grants
    pub fn lock_type(&self) -> LockType {
        self.lock.lock_type
    }

    /// Identity the lock was acquired for
    pub fn owner_id(&self) -> &str {
        &self.lock.owner_id
    }

    /// Get the lock as it was when granted
    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    /// Time spent in the wait queue
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Check if the lock is still valid (not expired)
    pub fn is_valid(&self) -> bool {
        !self.released && !self.lock.is_expired()
    }

    /// Explicitly release the lock
    ///
    /// Fails with [`LockError::NotFound`] if the lock was already expired or
    /// force-released by a sweep.
    pub fn release(mut self) -> LockResult<()> {
        self.released = true;
        self.manager.release_lock(self.id(), self.owner_id())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match self.manager.release_lock(self.id(), self.owner_id()) {
            Ok(()) => debug!(lock_id = %self.lock.id, "Lock released on guard drop"),
            Err(LockError::NotFound(_)) => {}
            Err(e) => debug!(lock_id = %self.lock.id, error = %e, "Guard drop release failed"),
        }
    }
}

impl fmt::Display for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lock[{}:{}]", self.lock_type(), self.resource_id())
    }
}
