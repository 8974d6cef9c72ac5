//! Lock-protected execution with retries
//!
//! [`ConcurrencyController`] turns "acquire, run, release" into one call. The
//! lock taken for an attempt is always released before the next attempt
//! starts and before the call returns, including when the operation fails,
//! panics, or the returned future is dropped.

use crate::config::ConcurrencyConfig;
use crate::error::{Error, Result};
use crate::locking::{Lock, LockManager, LockMetadata, LockStatistics, LockStatus, LockType};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Per-call overrides for [`ConcurrencyController::execute_with_lock`]
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Lock timeout (None = config default)
    pub timeout: Option<Duration>,

    /// Retries after the first attempt (None = config default)
    pub retries: Option<u32>,

    /// Annotations attached to every lock request
    pub metadata: Option<LockMetadata>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_metadata(mut self, metadata: LockMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Result of a successful locked execution
#[derive(Debug, Clone)]
pub struct ExecutionOutcome<T> {
    /// What the operation returned
    pub value: T,

    /// The lock the successful attempt ran under, as of its release
    pub lock: Lock,

    /// Failed attempts before the successful one
    pub retry_count: u32,
}

/// A locked execution that failed on every attempt
#[derive(Error, Debug)]
#[error("{error} (after {attempts} attempts)")]
pub struct ExecutionFailure {
    /// Error from the last attempt
    #[source]
    pub error: Error,

    /// Retries performed after the first attempt
    pub retry_count: u32,

    /// Total attempts made
    pub attempts: u32,
}

/// Lock statistics plus the configuration in effect
#[derive(Debug, Clone, Serialize)]
pub struct ConcurrencyStatistics {
    pub locks: LockStatistics,
    pub config: ConcurrencyConfig,
}

/// Runs caller operations under resource locks
#[derive(Debug, Clone)]
pub struct ConcurrencyController {
    /// Lock manager the controller acquires from
    lock_manager: LockManager,

    /// Configuration
    config: ConcurrencyConfig,
}

impl ConcurrencyController {
    /// Create a controller with its own lock manager
    pub fn new(config: ConcurrencyConfig) -> Self {
        Self {
            lock_manager: LockManager::new(config.clone()),
            config,
        }
    }

    /// Create a controller after validating the configuration
    pub fn try_new(config: ConcurrencyConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::ConfigError(e.to_string()))?;
        Ok(Self::new(config))
    }

    /// Create a controller with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ConcurrencyConfig::default())
    }

    /// Create a controller over an existing lock manager
    pub fn with_lock_manager(lock_manager: LockManager) -> Self {
        let config = lock_manager.config().clone();
        Self {
            lock_manager,
            config,
        }
    }

    /// Get the lock manager
    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }

    /// Get the configuration
    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    /// Run `operation_fn` while holding a `lock_type` lock on `resource_id`
    ///
    /// Makes up to `retries + 1` attempts. A failed acquisition counts as a
    /// failed attempt, just like a failed operation. Attempts are separated by
    /// the configured retry delay.
    ///
    /// # Arguments
    /// * `resource_id` - Key of the protected resource
    /// * `lock_type` - Access the operation needs
    /// * `owner_id` - Identity used to acquire and release
    /// * `operation` - Label for logs and lock events
    /// * `operation_fn` - Called once per attempt
    /// * `options` - Timeout, retry and metadata overrides
    pub async fn execute_with_lock<T, E, F, Fut>(
        &self,
        resource_id: &str,
        lock_type: LockType,
        owner_id: &str,
        operation: &str,
        mut operation_fn: F,
        options: ExecuteOptions,
    ) -> std::result::Result<ExecutionOutcome<T>, ExecutionFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        let max_retries = options.retries.unwrap_or(self.config.max_retries);
        let mut retry_count = 0;

        loop {
            match self
                .attempt(
                    resource_id,
                    lock_type,
                    owner_id,
                    operation,
                    &mut operation_fn,
                    &options,
                )
                .await
            {
                Ok((value, lock)) => {
                    if retry_count > 0 {
                        info!(
                            resource_id = %resource_id,
                            operation = %operation,
                            retries = retry_count,
                            "Locked operation succeeded after retrying"
                        );
                    }
                    return Ok(ExecutionOutcome {
                        value,
                        lock,
                        retry_count,
                    });
                }
                Err(error) if retry_count < max_retries => {
                    retry_count += 1;
                    warn!(
                        resource_id = %resource_id,
                        operation = %operation,
                        attempt = retry_count,
                        error = %error,
                        wait_ms = self.config.retry_delay.as_millis(),
                        "Locked operation failed, retrying after delay"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(error) => {
                    warn!(
                        resource_id = %resource_id,
                        operation = %operation,
                        attempts = retry_count + 1,
                        error = %error,
                        "Locked operation failed, giving up"
                    );
                    return Err(ExecutionFailure {
                        error,
                        retry_count,
                        attempts: retry_count + 1,
                    });
                }
            }
        }
    }

    /// One acquire/run/release cycle
    async fn attempt<T, E, F, Fut>(
        &self,
        resource_id: &str,
        lock_type: LockType,
        owner_id: &str,
        operation: &str,
        operation_fn: &mut F,
        options: &ExecuteOptions,
    ) -> Result<(T, Lock)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        let guard = self
            .lock_manager
            .acquire_guard(
                resource_id,
                lock_type,
                owner_id,
                operation,
                options.timeout,
                options.metadata.clone(),
            )
            .await?;

        let result = operation_fn().await;

        let mut lock = guard.lock().clone();
        match guard.release() {
            Ok(()) => {
                lock.advance(LockStatus::Released);
            }
            Err(e) => {
                // Expired or force-released while the operation ran
                warn!(
                    lock_id = %lock.id,
                    resource_id = %resource_id,
                    error = %e,
                    "Lock was no longer held when the operation finished"
                );
            }
        }
        debug!(lock_id = %lock.id, resource_id = %resource_id, "Attempt finished");

        match result {
            Ok(value) => Ok((value, lock)),
            Err(e) => Err(Error::OperationFailed(e.into())),
        }
    }

    /// Run under a read lock
    pub async fn execute_read<T, E, F, Fut>(
        &self,
        resource_id: &str,
        owner_id: &str,
        operation: &str,
        operation_fn: F,
        options: ExecuteOptions,
    ) -> std::result::Result<ExecutionOutcome<T>, ExecutionFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        self.execute_with_lock(
            resource_id,
            LockType::Read,
            owner_id,
            operation,
            operation_fn,
            options,
        )
        .await
    }

    /// Run under a write lock
    pub async fn execute_write<T, E, F, Fut>(
        &self,
        resource_id: &str,
        owner_id: &str,
        operation: &str,
        operation_fn: F,
        options: ExecuteOptions,
    ) -> std::result::Result<ExecutionOutcome<T>, ExecutionFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        self.execute_with_lock(
            resource_id,
            LockType::Write,
            owner_id,
            operation,
            operation_fn,
            options,
        )
        .await
    }

    /// Run under an exclusive lock
    pub async fn execute_exclusive<T, E, F, Fut>(
        &self,
        resource_id: &str,
        owner_id: &str,
        operation: &str,
        operation_fn: F,
        options: ExecuteOptions,
    ) -> std::result::Result<ExecutionOutcome<T>, ExecutionFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        self.execute_with_lock(
            resource_id,
            LockType::Exclusive,
            owner_id,
            operation,
            operation_fn,
            options,
        )
        .await
    }

    /// Lock statistics plus the active configuration
    pub fn concurrency_statistics(&self) -> ConcurrencyStatistics {
        ConcurrencyStatistics {
            locks: self.lock_manager.lock_statistics(),
            config: self.config.clone(),
        }
    }

    /// Stop background sweeps and drop all lock state
    pub fn cleanup(&self) {
        self.lock_manager.cleanup();
    }
}
