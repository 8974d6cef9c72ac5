//! Ledgerlock Core Library
//!
//! This crate provides in-process concurrency control for business records:
//! - Lock manager with read/write/exclusive locks and wait queues
//! - Timeout expiry and heuristic deadlock resolution sweeps
//! - Concurrency controller that runs operations under a lock with retries
//! - Configuration loading

pub mod concurrency;
pub mod config;
pub mod error;
pub mod locking;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::concurrency::{ConcurrencyController, ExecuteOptions};
    pub use crate::config::ConcurrencyConfig;
    pub use crate::error::{Error, Result};
    pub use crate::locking::{LockManager, LockMetadata, LockType};
}
