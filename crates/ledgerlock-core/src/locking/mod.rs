//! Resource locking for concurrent operations
//!
//! This module serializes concurrent reads, writes and exclusive operations
//! against named resources inside one process.
//!
//! # Architecture
//!
//! - **Lock Types**: `Read` (shared), `Write` and `Exclusive` (exclusive of
//!   everything else)
//! - **Lock Manager**: `LockManager` owns held locks and per-resource wait
//!   queues
//! - **Guards**: RAII-style lock guards for automatic release
//!
//! # Behavior worth knowing
//!
//! - A release wakes at most one waiter, and waiters are scanned newest
//!   first, so grant order is not FIFO.
//! - A resource at its lock cap never becomes grantable by waiting; such
//!   requests fail with a timeout.
//! - Deadlock detection only sees the `waiting_for` metadata callers attach.
//!   It is best-effort and breaks suspected cycles by force-releasing the
//!   oldest lock on the resource.
//!
//! # Example
//!
//! ```ignore
//! use ledgerlock_core::locking::{LockManager, LockType};
//! use ledgerlock_core::config::ConcurrencyConfig;
//!
//! let manager = LockManager::new(ConcurrencyConfig::default());
//!
//! let guard = manager
//!     .acquire_guard("engagement:42", LockType::Write, "user-7", "update-fees", None, None)
//!     .await?;
//!
//! // Do work with the engagement...
//!
//! // Lock is automatically released when guard is dropped
//! ```

mod deadlock;
pub mod event;
pub mod guard;
pub mod manager;
pub mod types;

// Re-export main types
pub use event::{LockEvent, LockEventType};
pub use guard::LockGuard;
pub use manager::{ExpirySweep, LockManager, can_acquire};
pub use types::{
    Lock, LockAcquisition, LockError, LockMetadata, LockResult, LockStatistics, LockStatus,
    LockType,
};
