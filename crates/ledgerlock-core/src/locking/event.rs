//! Locking events
//!
//! Published on the lock manager's broadcast channel so callers can observe
//! grants, waits, releases, expiries and deadlock resolutions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::types::Lock;

/// Type of lock event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockEventType {
    /// A lock was granted
    LockAcquired,
    /// A request joined a wait queue
    LockQueued,
    /// A lock was released by its owner
    LockReleased,
    /// A held lock or a queued request expired
    LockTimedOut,
    /// The deadlock sweep force-released a lock
    DeadlockResolved,
}

impl LockEventType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LockAcquired => "lock_acquired",
            Self::LockQueued => "lock_queued",
            Self::LockReleased => "lock_released",
            Self::LockTimedOut => "lock_timed_out",
            Self::DeadlockResolved => "deadlock_resolved",
        }
    }
}

impl std::fmt::Display for LockEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A locking event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEvent {
    /// Unique event identifier
    pub id: Uuid,
    /// The lock the event is about
    pub lock_id: Uuid,
    /// The resource the lock protects
    pub resource_id: String,
    /// Type of event
    pub event_type: LockEventType,
    /// Event data
    pub data: Option<serde_json::Value>,
    /// When the event occurred
    pub created_at: DateTime<Utc>,
}

impl LockEvent {
    /// Create a new lock event
    pub fn new(lock: &Lock, event_type: LockEventType, data: Option<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            lock_id: lock.id,
            resource_id: lock.resource_id.clone(),
            event_type,
            data,
            created_at: Utc::now(),
        }
    }

    /// Create a lock acquired event
    pub fn lock_acquired(lock: &Lock, waited: Duration) -> Self {
        let data = serde_json::json!({
            "owner_id": lock.owner_id,
            "lock_type": lock.lock_type.as_str(),
            "operation": lock.operation,
            "waited_ms": duration_ms(waited),
        });
        Self::new(lock, LockEventType::LockAcquired, Some(data))
    }

    /// Create a lock queued event
    pub fn lock_queued(lock: &Lock) -> Self {
        let data = serde_json::json!({
            "owner_id": lock.owner_id,
            "lock_type": lock.lock_type.as_str(),
        });
        Self::new(lock, LockEventType::LockQueued, Some(data))
    }

    /// Create a lock released event
    pub fn lock_released(lock: &Lock) -> Self {
        let data = serde_json::json!({
            "owner_id": lock.owner_id,
            "held_ms": lock.held_for().map(duration_ms).unwrap_or(0),
        });
        Self::new(lock, LockEventType::LockReleased, Some(data))
    }

    /// Create a lock timed out event
    pub fn lock_timed_out(lock: &Lock, was_held: bool) -> Self {
        let data = serde_json::json!({
            "owner_id": lock.owner_id,
            "was_held": was_held,
        });
        Self::new(lock, LockEventType::LockTimedOut, Some(data))
    }

    /// Create a deadlock resolved event
    pub fn deadlock_resolved(lock: &Lock) -> Self {
        let data = serde_json::json!({
            "owner_id": lock.owner_id,
            "waiting_for": lock.metadata.waiting_for(),
        });
        Self::new(lock, LockEventType::DeadlockResolved, Some(data))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::types::{LockMetadata, LockType};

    fn held_lock() -> Lock {
        let mut lock = Lock::pending(
            "payment:9",
            LockType::Write,
            "owner-1",
            "reconcile",
            Duration::from_secs(30),
            LockMetadata::new().with_waiting_for("document:3"),
        );
        lock.mark_acquired();
        lock
    }

    #[test]
    fn test_lock_acquired_event() {
        let lock = held_lock();
        let event = LockEvent::lock_acquired(&lock, Duration::from_millis(250));

        assert_eq!(event.lock_id, lock.id);
        assert_eq!(event.resource_id, "payment:9");
        assert_eq!(event.event_type, LockEventType::LockAcquired);

        let data = event.data.unwrap();
        assert_eq!(data["owner_id"], "owner-1");
        assert_eq!(data["lock_type"], "write");
        assert_eq!(data["waited_ms"], 250);
    }

    #[test]
    fn test_deadlock_resolved_event() {
        let event = LockEvent::deadlock_resolved(&held_lock());

        assert_eq!(event.event_type.as_str(), "deadlock_resolved");
        let data = event.data.unwrap();
        assert_eq!(data["waiting_for"], "document:3");
    }

    #[test]
    fn test_lock_timed_out_event() {
        let event = LockEvent::lock_timed_out(&held_lock(), true);

        assert_eq!(event.event_type, LockEventType::LockTimedOut);
        assert_eq!(event.data.unwrap()["was_held"], true);
    }
}
