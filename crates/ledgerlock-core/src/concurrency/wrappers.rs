//! Call-site shorthands over an injected controller
//!
//! These carry no behavior of their own; each forwards to
//! [`ConcurrencyController::execute_with_lock`] on the controller the
//! application wired up.

use super::controller::{ConcurrencyController, ExecuteOptions, ExecutionFailure, ExecutionOutcome};
use crate::locking::LockType;
use std::future::Future;

/// Run `operation_fn` under a `lock_type` lock on `resource_id`
pub async fn with_concurrency_control<T, E, F, Fut>(
    controller: &ConcurrencyController,
    resource_id: &str,
    lock_type: LockType,
    owner_id: &str,
    operation: &str,
    operation_fn: F,
    options: ExecuteOptions,
) -> Result<ExecutionOutcome<T>, ExecutionFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<anyhow::Error>,
{
    controller
        .execute_with_lock(resource_id, lock_type, owner_id, operation, operation_fn, options)
        .await
}

/// Run `operation_fn` under a read lock
pub async fn with_read_lock<T, E, F, Fut>(
    controller: &ConcurrencyController,
    resource_id: &str,
    owner_id: &str,
    operation: &str,
    operation_fn: F,
    options: ExecuteOptions,
) -> Result<ExecutionOutcome<T>, ExecutionFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<anyhow::Error>,
{
    controller
        .execute_read(resource_id, owner_id, operation, operation_fn, options)
        .await
}

/// Run `operation_fn` under a write lock
pub async fn with_write_lock<T, E, F, Fut>(
    controller: &ConcurrencyController,
    resource_id: &str,
    owner_id: &str,
    operation: &str,
    operation_fn: F,
    options: ExecuteOptions,
) -> Result<ExecutionOutcome<T>, ExecutionFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<anyhow::Error>,
{
    controller
        .execute_write(resource_id, owner_id, operation, operation_fn, options)
        .await
}

/// Run `operation_fn` under an exclusive lock
pub async fn with_exclusive_lock<T, E, F, Fut>(
    controller: &ConcurrencyController,
    resource_id: &str,
    owner_id: &str,
    operation: &str,
    operation_fn: F,
    options: ExecuteOptions,
) -> Result<ExecutionOutcome<T>, ExecutionFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<anyhow::Error>,
{
    controller
        .execute_exclusive(resource_id, owner_id, operation, operation_fn, options)
        .await
}
