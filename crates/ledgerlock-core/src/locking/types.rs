//! Lock types and error definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Lock errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The lock could not be granted before the caller's deadline
    #[error("Lock acquisition timed out after {timeout_ms}ms on resource '{resource}'")]
    AcquireTimeout { resource: String, timeout_ms: u64 },

    /// A queued request was expired by the cleanup sweep
    #[error("Lock wait timed out on resource '{resource}'")]
    WaitExpired { resource: String },

    /// Release referenced a lock that is not held
    #[error("Lock not found: {0}")]
    NotFound(Uuid),

    /// Release attempted by someone other than the owner
    #[error("Owner '{owner_id}' is not authorized to release lock {lock_id}")]
    NotAuthorized { lock_id: Uuid, owner_id: String },

    /// The manager was cleaned up while the request was waiting
    #[error("Lock manager shut down before the lock was granted")]
    ManagerShutdown,

    /// Unexpected internal failure
    #[error("Internal lock error: {0}")]
    Internal(String),
}

impl LockError {
    /// Get error code for this lock error
    pub fn code(&self) -> &'static str {
        match self {
            Self::AcquireTimeout { .. } => "E300",
            Self::WaitExpired { .. } => "E301",
            Self::NotFound(_) => "E302",
            Self::NotAuthorized { .. } => "E303",
            Self::ManagerShutdown => "E304",
            Self::Internal(_) => "E399",
        }
    }

    /// Whether the request failed because it could not be granted in time
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::AcquireTimeout { .. } | Self::WaitExpired { .. })
    }
}

/// Kind of access a lock grants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    /// Shared access; coexists with other reads
    Read,
    /// Exclusive of every other lock
    Write,
    /// Exclusive of every other lock, including other exclusive locks
    Exclusive,
}

impl LockType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Exclusive => "exclusive",
        }
    }

    /// Whether a lock of this type may be granted next to a held `existing` lock.
    ///
    /// Only read/read is compatible. Write and exclusive locks exclude
    /// everything, each other included.
    pub fn is_compatible_with(self, existing: LockType) -> bool {
        matches!((self, existing), (Self::Read, Self::Read))
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    /// Waiting in the queue
    Pending,
    /// Granted and held
    Acquired,
    /// Released by its owner
    Released,
    /// Expired before or after being granted
    Timeout,
    /// Force-released by the deadlock sweep
    Deadlock,
}

impl LockStatus {
    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Timeout | Self::Deadlock)
    }

    /// Whether `next` is a legal forward move from this state
    pub fn can_transition_to(&self, next: LockStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Acquired | Self::Timeout) => true,
            (Self::Acquired, Self::Released | Self::Timeout | Self::Deadlock) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Acquired => write!(f, "acquired"),
            Self::Released => write!(f, "released"),
            Self::Timeout => write!(f, "timeout"),
            Self::Deadlock => write!(f, "deadlock"),
        }
    }
}

/// Free-form key/value annotations attached to a lock request.
///
/// The `waiting_for` key is read by the deadlock sweep: callers that know they
/// are blocked on another resource record its id there.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockMetadata(BTreeMap<String, String>);

impl LockMetadata {
    /// Key naming the resource the owner is blocked on
    pub const WAITING_FOR: &'static str = "waiting_for";

    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Record that the owner is blocked on `resource_id`
    pub fn with_waiting_for(self, resource_id: impl Into<String>) -> Self {
        self.with(Self::WAITING_FOR, resource_id)
    }

    /// Value stored under `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Resource the owner says it is blocked on, if any
    pub fn waiting_for(&self) -> Option<&str> {
        self.get(Self::WAITING_FOR)
    }

    /// Entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// One grant or pending request on a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    /// Lock ID
    pub id: Uuid,

    /// Protected resource (e.g. "engagement:42")
    pub resource_id: String,

    /// Requested access
    pub lock_type: LockType,

    /// Current lifecycle state
    pub status: LockStatus,

    /// Requester identity, checked on release
    pub owner_id: String,

    /// Free-text label of the operation holding the lock
    pub operation: String,

    /// When the request was made
    pub requested_at: DateTime<Utc>,

    /// When the lock was granted
    pub acquired_at: Option<DateTime<Utc>>,

    /// Deadline for the wait, then for the hold once granted
    pub expires_at: DateTime<Utc>,

    /// Timeout the request was made with
    pub timeout: Duration,

    /// Caller annotations
    pub metadata: LockMetadata,
}

impl Lock {
    /// Create a pending request
    pub(crate) fn pending(
        resource_id: &str,
        lock_type: LockType,
        owner_id: &str,
        operation: &str,
        timeout: Duration,
        metadata: LockMetadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            resource_id: resource_id.to_string(),
            lock_type,
            status: LockStatus::Pending,
            owner_id: owner_id.to_string(),
            operation: operation.to_string(),
            requested_at: now,
            acquired_at: None,
            expires_at: deadline_after(now, timeout),
            timeout,
            metadata,
        }
    }

    /// Move to `next` if that is a forward transition. Returns whether it applied.
    pub(crate) fn advance(&mut self, next: LockStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    /// Grant the lock, restarting the expiry clock from now
    pub(crate) fn mark_acquired(&mut self) -> bool {
        if !self.advance(LockStatus::Acquired) {
            return false;
        }
        let now = Utc::now();
        self.acquired_at = Some(now);
        self.expires_at = deadline_after(now, self.timeout);
        true
    }

    /// Whether the lock is currently granted
    pub fn is_held(&self) -> bool {
        self.status == LockStatus::Acquired
    }

    /// Check if the lock is expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub(crate) fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// How long the lock has been held, if it was granted
    pub fn held_for(&self) -> Option<Duration> {
        self.acquired_at
            .and_then(|at| (Utc::now() - at).to_std().ok())
    }
}

fn deadline_after(start: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|d| start.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A successful acquisition
#[derive(Debug, Clone)]
pub struct LockAcquisition {
    /// The granted lock
    pub lock: Lock,

    /// Time spent in the wait queue (zero for immediate grants)
    pub waited: Duration,
}

/// Point-in-time counts over held and pending locks
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LockStatistics {
    /// Held plus pending
    pub total_locks: usize,

    /// Granted locks
    pub active_locks: usize,

    /// Requests still in a wait queue
    pub pending_locks: usize,

    /// Held and pending, by lock type
    pub locks_by_type: BTreeMap<LockType, usize>,

    /// Held and pending, by resource
    pub locks_by_resource: BTreeMap<String, usize>,

    /// Mean time the still-pending requests have been waiting
    pub average_wait_time: Duration,
}
