//! Concurrency control over the lock manager
//!
//! - **Controller**: `ConcurrencyController` runs an operation under a lock,
//!   with timeout and retries, and always releases the lock
//! - **Wrappers**: free functions with a fixed lock type, taking the
//!   controller explicitly

pub mod controller;
pub mod wrappers;

pub use controller::{
    ConcurrencyController, ConcurrencyStatistics, ExecuteOptions, ExecutionFailure,
    ExecutionOutcome,
};
pub use wrappers::{with_concurrency_control, with_exclusive_lock, with_read_lock, with_write_lock};
