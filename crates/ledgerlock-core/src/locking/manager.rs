//! Lock manager for coordinating resource locks
//!
//! The lock manager is the single authority on whether a lock may be granted.
//! It handles:
//! - Read/write/exclusive compatibility and a per-resource lock cap
//! - A per-resource wait queue with bounded waits
//! - Background expiry and deadlock sweeps
//! - Statistics and lock events

use super::deadlock::WaitForGraph;
use super::event::LockEvent;
use super::guard::LockGuard;
use super::types::{
    Lock, LockAcquisition, LockError, LockMetadata, LockResult, LockStatistics, LockStatus,
    LockType,
};
use crate::config::ConcurrencyConfig;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Capacity of the lock event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

type GrantResponder = oneshot::Sender<LockResult<Lock>>;

/// A queued request waiting for its grant
#[derive(Debug)]
struct PendingRequest {
    lock: Lock,
    enqueued_at: Instant,
    responder: GrantResponder,
}

/// A lock handed to a waiter by a notification
#[derive(Debug)]
struct Grant {
    lock: Lock,
    waited: Duration,
}

/// What withdrawing a queued request found
#[derive(Debug)]
enum Withdrawal {
    /// Still queued; now removed
    Dequeued,
    /// A grant had already been sent
    Granted(Lock),
    /// The manager had already rejected the request
    Rejected(LockError),
    /// Nothing left to settle
    Gone,
}

/// A queued request whose caller is still waiting.
///
/// Dropping it before the wait settles withdraws the request, so a caller
/// that goes away never leaves a granted lock behind.
#[derive(Debug)]
struct PendingWait {
    manager: LockManager,
    lock: Lock,
    receiver: oneshot::Receiver<LockResult<Lock>>,
    settled: bool,
}

impl PendingWait {
    async fn wait(mut self, timeout: Duration) -> LockResult<LockAcquisition> {
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, &mut self.receiver).await;
        self.settled = true;
        let waited = started.elapsed();

        match outcome {
            Ok(Ok(Ok(granted))) if waited < timeout => Ok(LockAcquisition {
                lock: granted,
                waited,
            }),
            Ok(Ok(Ok(granted))) => {
                // Delivered after the deadline had already passed
                self.manager.revoke(granted, LockStatus::Timeout);
                Err(wait_timed_out(&self.lock))
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(LockError::Internal(format!(
                "wait queue entry for lock {} was dropped",
                self.lock.id
            ))),
            Err(_) => Err(self
                .manager
                .abandon_wait(&mut self.lock, &mut self.receiver)),
        }
    }
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        match self.manager.withdraw(&self.lock, &mut self.receiver) {
            Withdrawal::Dequeued => debug!(
                lock_id = %self.lock.id,
                resource_id = %self.lock.resource_id,
                "Lock wait cancelled"
            ),
            Withdrawal::Granted(granted) => self.manager.revoke(granted, LockStatus::Released),
            Withdrawal::Rejected(_) | Withdrawal::Gone => {}
        }
    }
}

fn wait_timed_out(lock: &Lock) -> LockError {
    LockError::AcquireTimeout {
        resource: lock.resource_id.clone(),
        timeout_ms: u64::try_from(lock.timeout.as_millis()).unwrap_or(u64::MAX),
    }
}

/// Held locks and wait queues, keyed by resource
#[derive(Debug, Default)]
struct LockTable {
    held: HashMap<String, Vec<Lock>>,
    waiting: HashMap<String, Vec<PendingRequest>>,
}

impl LockTable {
    fn held_on(&self, resource_id: &str) -> &[Lock] {
        self.held.get(resource_id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn find_held(&self, lock_id: Uuid) -> Option<&Lock> {
        self.held.values().flatten().find(|lock| lock.id == lock_id)
    }

    fn remove_held(&mut self, resource_id: &str, lock_id: Uuid) -> Option<Lock> {
        let held = self.held.get_mut(resource_id)?;
        let index = held.iter().position(|lock| lock.id == lock_id)?;
        let lock = held.remove(index);
        self.prune(resource_id);
        Some(lock)
    }

    fn remove_waiter(&mut self, resource_id: &str, lock_id: Uuid) -> Option<PendingRequest> {
        let queue = self.waiting.get_mut(resource_id)?;
        let index = queue.iter().position(|request| request.lock.id == lock_id)?;
        let request = queue.remove(index);
        self.prune(resource_id);
        Some(request)
    }

    /// Grant at most one queued request on `resource_id`.
    ///
    /// The queue is scanned from the most recently enqueued request to the
    /// oldest and the first grantable one wins. Requests whose caller has gone
    /// away are dropped along the way.
    fn grant_next(&mut self, resource_id: &str, max_locks: usize) -> Option<Grant> {
        let queue = self.waiting.get_mut(resource_id)?;
        queue.retain(|request| !request.responder.is_closed());

        let held = self.held.entry(resource_id.to_string()).or_default();
        let mut granted = None;

        for index in (0..queue.len()).rev() {
            if !can_acquire(held, queue[index].lock.lock_type, max_locks) {
                continue;
            }

            let request = queue.remove(index);
            let mut lock = request.lock;
            lock.mark_acquired();
            held.push(lock.clone());

            if request.responder.send(Ok(lock.clone())).is_ok() {
                granted = Some(Grant {
                    lock,
                    waited: request.enqueued_at.elapsed(),
                });
                break;
            }
            held.pop();
        }

        self.prune(resource_id);
        granted
    }

    /// Drop empty per-resource entries
    fn prune(&mut self, resource_id: &str) {
        if self.held.get(resource_id).is_some_and(Vec::is_empty) {
            self.held.remove(resource_id);
        }
        if self.waiting.get(resource_id).is_some_and(Vec::is_empty) {
            self.waiting.remove(resource_id);
        }
    }
}

/// Compatibility and capacity check against the locks held on one resource
pub fn can_acquire(held: &[Lock], requested: LockType, max_locks_per_resource: usize) -> bool {
    if held.len() >= max_locks_per_resource {
        return false;
    }
    held.iter()
        .filter(|lock| lock.status == LockStatus::Acquired)
        .all(|lock| requested.is_compatible_with(lock.lock_type))
}

/// Outcome of one expiry sweep
#[derive(Debug, Clone, Default)]
pub struct ExpirySweep {
    /// Held locks that ran past their deadline
    pub expired_locks: Vec<Lock>,

    /// Queued requests that ran past their deadline
    pub expired_waiters: Vec<Lock>,
}

impl ExpirySweep {
    pub fn is_empty(&self) -> bool {
        self.expired_locks.is_empty() && self.expired_waiters.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum SweepKind {
    Expiry,
    Deadlock,
}

#[derive(Debug)]
struct Shared {
    config: ConcurrencyConfig,
    table: Mutex<LockTable>,
    events: broadcast::Sender<LockEvent>,
    shutdown: CancellationToken,
    sweeps: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sweeps(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.sweeps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Lock manager for coordinating resource locks
///
/// Cloning is cheap; clones share the same registry, queues and sweeps.
#[derive(Debug, Clone)]
pub struct LockManager {
    shared: Arc<Shared>,
}

impl LockManager {
    /// Create a lock manager and start its background sweeps.
    ///
    /// Sweeps are only started when called from within a Tokio runtime and
    /// when enabled in the configuration.
    pub fn new(config: ConcurrencyConfig) -> Self {
        let manager = Self::without_sweeps(config);
        manager.start_sweeps();
        manager
    }

    /// Create a lock manager with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ConcurrencyConfig::default())
    }

    /// Create a lock manager that never runs background sweeps
    pub fn without_sweeps(config: ConcurrencyConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                config,
                table: Mutex::new(LockTable::default()),
                events,
                shutdown: CancellationToken::new(),
                sweeps: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &ConcurrencyConfig {
        &self.shared.config
    }

    /// Subscribe to lock events
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.shared.events.subscribe()
    }

    /// Whether any background sweep is running
    pub fn is_running(&self) -> bool {
        self.shared
            .sweeps()
            .iter()
            .any(|handle| !handle.is_finished())
    }

    /// Acquire a lock on a resource
    ///
    /// Grants immediately when the request is compatible with the locks held
    /// on the resource and the resource is below its lock cap. Otherwise the
    /// request is queued and the caller waits until a release grants it or
    /// `timeout` elapses. A full resource never becomes grantable by waiting
    /// alone, so capacity exhaustion surfaces as a timeout.
    ///
    /// # Arguments
    /// * `resource_id` - Key of the protected resource
    /// * `lock_type` - Requested access
    /// * `owner_id` - Requester identity, required again on release
    /// * `operation` - Label for logs and events
    /// * `timeout` - How long to wait (None = use default)
    /// * `metadata` - Caller annotations, e.g. `waiting_for`
    pub async fn acquire_lock(
        &self,
        resource_id: &str,
        lock_type: LockType,
        owner_id: &str,
        operation: &str,
        timeout: Option<Duration>,
        metadata: Option<LockMetadata>,
    ) -> LockResult<LockAcquisition> {
        let timeout = timeout.unwrap_or(self.shared.config.default_timeout);
        let max_locks = self.shared.config.max_locks_per_resource;
        let mut lock = Lock::pending(
            resource_id,
            lock_type,
            owner_id,
            operation,
            timeout,
            metadata.unwrap_or_default(),
        );

        let receiver = {
            let mut table = self.shared.table();

            if can_acquire(table.held_on(resource_id), lock_type, max_locks) {
                if !lock.mark_acquired() {
                    return Err(LockError::Internal(format!(
                        "new lock {} was not pending",
                        lock.id
                    )));
                }
                table
                    .held
                    .entry(resource_id.to_string())
                    .or_default()
                    .push(lock.clone());
                drop(table);

                debug!(
                    lock_id = %lock.id,
                    resource_id = %resource_id,
                    lock_type = %lock_type,
                    owner_id = %owner_id,
                    "Lock acquired"
                );
                self.emit(LockEvent::lock_acquired(&lock, Duration::ZERO));
                return Ok(LockAcquisition {
                    lock,
                    waited: Duration::ZERO,
                });
            }

            let (responder, receiver) = oneshot::channel();
            table
                .waiting
                .entry(resource_id.to_string())
                .or_default()
                .push(PendingRequest {
                    lock: lock.clone(),
                    enqueued_at: Instant::now(),
                    responder,
                });
            receiver
        };

        debug!(
            lock_id = %lock.id,
            resource_id = %resource_id,
            lock_type = %lock_type,
            owner_id = %owner_id,
            timeout_ms = timeout.as_millis(),
            "Lock contended, waiting"
        );
        let wait = PendingWait {
            manager: self.clone(),
            lock,
            receiver,
            settled: false,
        };
        self.emit(LockEvent::lock_queued(&wait.lock));

        wait.wait(timeout).await
    }

    /// Acquire a lock wrapped in a guard that releases it on drop
    pub async fn acquire_guard(
        &self,
        resource_id: &str,
        lock_type: LockType,
        owner_id: &str,
        operation: &str,
        timeout: Option<Duration>,
        metadata: Option<LockMetadata>,
    ) -> LockResult<LockGuard> {
        let acquisition = self
            .acquire_lock(resource_id, lock_type, owner_id, operation, timeout, metadata)
            .await?;

        Ok(LockGuard::new(self.clone(), acquisition))
    }

    /// Settle a wait whose deadline fired. Always yields a timeout-class error.
    fn abandon_wait(
        &self,
        lock: &mut Lock,
        receiver: &mut oneshot::Receiver<LockResult<Lock>>,
    ) -> LockError {
        match self.withdraw(lock, receiver) {
            Withdrawal::Dequeued => {
                lock.advance(LockStatus::Timeout);
                debug!(
                    lock_id = %lock.id,
                    resource_id = %lock.resource_id,
                    owner_id = %lock.owner_id,
                    "Lock wait timed out"
                );
                self.emit(LockEvent::lock_timed_out(lock, false));
                wait_timed_out(lock)
            }
            Withdrawal::Granted(granted) => {
                self.revoke(granted, LockStatus::Timeout);
                wait_timed_out(lock)
            }
            Withdrawal::Rejected(e) => e,
            Withdrawal::Gone => wait_timed_out(lock),
        }
    }

    /// Take a queued request back out of the manager.
    ///
    /// The queue check and the look into `receiver` happen under the table
    /// mutex, so a grant is either still to come or already in the channel.
    fn withdraw(
        &self,
        lock: &Lock,
        receiver: &mut oneshot::Receiver<LockResult<Lock>>,
    ) -> Withdrawal {
        let mut table = self.shared.table();
        if table.remove_waiter(&lock.resource_id, lock.id).is_some() {
            return Withdrawal::Dequeued;
        }
        match receiver.try_recv() {
            Ok(Ok(granted)) => Withdrawal::Granted(granted),
            Ok(Err(e)) => Withdrawal::Rejected(e),
            Err(_) => Withdrawal::Gone,
        }
    }

    /// Remove a lock handed to a waiter that will never hold it, and pass the
    /// resource on to the next waiter.
    fn revoke(&self, granted: Lock, status: LockStatus) {
        let max_locks = self.shared.config.max_locks_per_resource;
        let (revoked, grant) = {
            let mut table = self.shared.table();
            let revoked = table.remove_held(&granted.resource_id, granted.id);
            let grant = table.grant_next(&granted.resource_id, max_locks);
            (revoked, grant)
        };

        if let Some(mut revoked) = revoked {
            revoked.advance(status);
            debug!(
                lock_id = %revoked.id,
                resource_id = %revoked.resource_id,
                owner_id = %revoked.owner_id,
                status = %status,
                "Revoked lock its waiter never took"
            );
            if status == LockStatus::Released {
                self.emit(LockEvent::lock_released(&revoked));
            } else {
                self.emit(LockEvent::lock_timed_out(&revoked, false));
            }
        }
        self.announce(grant);
    }

    /// Release a lock by ID
    ///
    /// Only the owner that acquired the lock may release it. A successful
    /// release wakes at most one waiter on the same resource.
    pub fn release_lock(&self, lock_id: Uuid, owner_id: &str) -> LockResult<()> {
        let max_locks = self.shared.config.max_locks_per_resource;
        let mut table = self.shared.table();

        let Some(existing) = table.find_held(lock_id) else {
            return Err(LockError::NotFound(lock_id));
        };
        if existing.owner_id != owner_id {
            warn!(
                lock_id = %lock_id,
                owner_id = %existing.owner_id,
                requested_by = %owner_id,
                "Rejected lock release by non-owner"
            );
            return Err(LockError::NotAuthorized {
                lock_id,
                owner_id: owner_id.to_string(),
            });
        }

        let resource_id = existing.resource_id.clone();
        let Some(mut lock) = table.remove_held(&resource_id, lock_id) else {
            return Err(LockError::NotFound(lock_id));
        };
        lock.advance(LockStatus::Released);
        let grant = table.grant_next(&resource_id, max_locks);
        drop(table);

        debug!(
            lock_id = %lock_id,
            resource_id = %resource_id,
            held_ms = lock.held_for().map(|d| d.as_millis()).unwrap_or(0),
            "Lock released"
        );
        self.emit(LockEvent::lock_released(&lock));
        self.announce(grant);
        Ok(())
    }

    /// Whether a lock of `lock_type` could be granted on `resource_id` right now
    pub fn can_acquire_lock(&self, resource_id: &str, lock_type: LockType) -> bool {
        let table = self.shared.table();
        can_acquire(
            table.held_on(resource_id),
            lock_type,
            self.shared.config.max_locks_per_resource,
        )
    }

    /// Copies of the locks currently held on a resource
    pub fn locks_for_resource(&self, resource_id: &str) -> Vec<Lock> {
        self.shared.table().held_on(resource_id).to_vec()
    }

    /// Expire held locks and queued requests past their deadline
    ///
    /// Every resource that still has waiters afterwards gets one round of
    /// notification, which also wakes waiters left behind by the
    /// one-grant-per-release rule.
    pub fn sweep_expired_locks(&self) -> ExpirySweep {
        let now = Utc::now();
        let max_locks = self.shared.config.max_locks_per_resource;
        let mut report = ExpirySweep::default();
        let mut grants = Vec::new();

        {
            let mut table = self.shared.table();
            let resources: BTreeSet<String> = table
                .held
                .keys()
                .chain(table.waiting.keys())
                .cloned()
                .collect();

            for resource_id in resources {
                if let Some(held) = table.held.get_mut(&resource_id) {
                    let (expired, live): (Vec<Lock>, Vec<Lock>) =
                        held.drain(..).partition(|lock| lock.is_expired_at(now));
                    *held = live;
                    for mut lock in expired {
                        lock.advance(LockStatus::Timeout);
                        report.expired_locks.push(lock);
                    }
                }

                if let Some(queue) = table.waiting.get_mut(&resource_id) {
                    let mut index = 0;
                    while index < queue.len() {
                        if !queue[index].lock.is_expired_at(now) {
                            index += 1;
                            continue;
                        }
                        let request = queue.remove(index);
                        let mut lock = request.lock;
                        lock.advance(LockStatus::Timeout);
                        let _ = request.responder.send(Err(LockError::WaitExpired {
                            resource: resource_id.clone(),
                        }));
                        report.expired_waiters.push(lock);
                    }
                }

                grants.extend(table.grant_next(&resource_id, max_locks));
                table.prune(&resource_id);
            }
        }

        for lock in &report.expired_locks {
            warn!(
                lock_id = %lock.id,
                resource_id = %lock.resource_id,
                owner_id = %lock.owner_id,
                operation = %lock.operation,
                "Held lock expired"
            );
            self.emit(LockEvent::lock_timed_out(lock, true));
        }
        for lock in &report.expired_waiters {
            warn!(
                lock_id = %lock.id,
                resource_id = %lock.resource_id,
                owner_id = %lock.owner_id,
                "Queued lock request expired"
            );
            self.emit(LockEvent::lock_timed_out(lock, false));
        }
        for grant in grants {
            self.announce(Some(grant));
        }

        report
    }

    /// Break suspected deadlocks
    ///
    /// Looks for cycles in the `waiting_for` annotations of held locks. For
    /// each resource a cycle is found from, the oldest held lock there is
    /// force-released with status `Deadlock`. Returns the released locks.
    pub fn detect_deadlocks(&self) -> Vec<Lock> {
        let max_locks = self.shared.config.max_locks_per_resource;
        let mut resolved = Vec::new();
        let mut grants = Vec::new();

        {
            let mut table = self.shared.table();
            let suspects = WaitForGraph::from_held(&table.held).deadlocked_resources();

            for resource_id in suspects {
                let oldest = table
                    .held_on(&resource_id)
                    .iter()
                    .filter(|lock| lock.is_held())
                    .min_by_key(|lock| lock.acquired_at)
                    .map(|lock| lock.id);
                let Some(oldest) = oldest else {
                    continue;
                };

                if let Some(mut lock) = table.remove_held(&resource_id, oldest) {
                    lock.advance(LockStatus::Deadlock);
                    resolved.push(lock);
                }
                grants.extend(table.grant_next(&resource_id, max_locks));
            }
        }

        for lock in &resolved {
            warn!(
                lock_id = %lock.id,
                resource_id = %lock.resource_id,
                owner_id = %lock.owner_id,
                waiting_for = ?lock.metadata.waiting_for(),
                "Deadlock suspected, force-released oldest lock"
            );
            self.emit(LockEvent::deadlock_resolved(lock));
        }
        for grant in grants {
            self.announce(Some(grant));
        }

        resolved
    }

    /// Aggregate counts over held and pending locks
    pub fn lock_statistics(&self) -> LockStatistics {
        let table = self.shared.table();
        let mut stats = LockStatistics::default();

        for lock in table.held.values().flatten() {
            if lock.is_held() {
                stats.active_locks += 1;
            }
            *stats.locks_by_type.entry(lock.lock_type).or_default() += 1;
            *stats
                .locks_by_resource
                .entry(lock.resource_id.clone())
                .or_default() += 1;
        }

        let mut total_wait = Duration::ZERO;
        for request in table.waiting.values().flatten() {
            stats.pending_locks += 1;
            total_wait += request.enqueued_at.elapsed();
            *stats.locks_by_type.entry(request.lock.lock_type).or_default() += 1;
            *stats
                .locks_by_resource
                .entry(request.lock.resource_id.clone())
                .or_default() += 1;
        }

        let held: usize = table.held.values().map(Vec::len).sum();
        stats.total_locks = held + stats.pending_locks;
        let pending = u32::try_from(stats.pending_locks).unwrap_or(u32::MAX);
        if pending > 0 {
            stats.average_wait_time = total_wait / pending;
        }

        stats
    }

    /// Stop background sweeps and drop all lock state
    ///
    /// Waiters are rejected with [`LockError::ManagerShutdown`]. Safe to call
    /// more than once.
    pub fn cleanup(&self) {
        self.shared.shutdown.cancel();
        for handle in self.shared.sweeps().drain(..) {
            handle.abort();
        }

        let (held, waiting) = {
            let mut table = self.shared.table();
            (
                std::mem::take(&mut table.held),
                std::mem::take(&mut table.waiting),
            )
        };

        let dropped: usize = held.values().map(Vec::len).sum();
        let mut rejected = 0;
        for request in waiting.into_values().flatten() {
            let _ = request.responder.send(Err(LockError::ManagerShutdown));
            rejected += 1;
        }

        if dropped > 0 || rejected > 0 {
            info!(
                dropped_locks = dropped,
                rejected_waiters = rejected,
                "Lock manager cleaned up"
            );
        }
    }

    // ========== Internal Methods ==========

    fn emit(&self, event: LockEvent) {
        // No subscribers is fine
        let _ = self.shared.events.send(event);
    }

    fn announce(&self, grant: Option<Grant>) {
        let Some(Grant { lock, waited }) = grant else {
            return;
        };
        info!(
            lock_id = %lock.id,
            resource_id = %lock.resource_id,
            lock_type = %lock.lock_type,
            owner_id = %lock.owner_id,
            waited_ms = waited.as_millis(),
            "Lock granted to waiter"
        );
        self.emit(LockEvent::lock_acquired(&lock, waited));
    }

    fn start_sweeps(&self) {
        let config = &self.shared.config;
        let mut plan = Vec::new();
        if config.enable_lock_timeout {
            plan.push((SweepKind::Expiry, config.lock_cleanup_interval));
        }
        if config.enable_deadlock_detection {
            plan.push((SweepKind::Deadlock, config.deadlock_detection_interval));
        }
        if plan.is_empty() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No Tokio runtime available, background lock sweeps disabled");
            return;
        };

        let mut sweeps = self.shared.sweeps();
        for (kind, period) in plan {
            if period.is_zero() {
                warn!(sweep = ?kind, "Sweep interval is zero, sweep disabled");
                continue;
            }
            sweeps.push(runtime.spawn(run_sweep(
                Arc::downgrade(&self.shared),
                self.shared.shutdown.clone(),
                kind,
                period,
            )));
        }
    }
}

async fn run_sweep(
    shared: Weak<Shared>,
    shutdown: CancellationToken,
    kind: SweepKind,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let manager = LockManager { shared };
                match kind {
                    SweepKind::Expiry => {
                        manager.sweep_expired_locks();
                    }
                    SweepKind::Deadlock => {
                        manager.detect_deadlocks();
                    }
                }
            }
        }
    }

    debug!(sweep = ?kind, "Lock sweep stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::event::LockEventType;

    fn quiet_config() -> ConcurrencyConfig {
        ConcurrencyConfig::default()
            .with_deadlock_detection(false)
            .with_lock_timeout(false)
    }

    fn create_test_manager() -> LockManager {
        LockManager::without_sweeps(quiet_config())
    }

    async fn acquire(
        manager: &LockManager,
        resource_id: &str,
        lock_type: LockType,
        owner_id: &str,
        timeout_ms: u64,
    ) -> LockResult<Lock> {
        manager
            .acquire_lock(
                resource_id,
                lock_type,
                owner_id,
                "test",
                Some(Duration::from_millis(timeout_ms)),
                None,
            )
            .await
            .map(|acquisition| acquisition.lock)
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let manager = create_test_manager();

        let lock = acquire(&manager, "doc-1", LockType::Write, "owner-1", 100)
            .await
            .expect("Failed to acquire lock");

        assert_eq!(lock.status, LockStatus::Acquired);
        assert_eq!(lock.resource_id, "doc-1");
        assert!(lock.acquired_at.is_some());
        assert_eq!(manager.lock_statistics().active_locks, 1);

        manager
            .release_lock(lock.id, "owner-1")
            .expect("Failed to release lock");

        assert_eq!(manager.lock_statistics().active_locks, 0);
        assert!(manager.locks_for_resource("doc-1").is_empty());
    }

    #[tokio::test]
    async fn test_release_unknown_lock() {
        let manager = create_test_manager();
        let lock_id = Uuid::new_v4();

        let err = manager.release_lock(lock_id, "owner-1").unwrap_err();
        assert_eq!(err, LockError::NotFound(lock_id));
    }

    #[tokio::test]
    async fn test_release_by_wrong_owner() {
        let manager = create_test_manager();
        let lock = acquire(&manager, "doc-1", LockType::Read, "owner-1", 100)
            .await
            .unwrap();

        let err = manager.release_lock(lock.id, "owner-2").unwrap_err();
        assert!(matches!(err, LockError::NotAuthorized { .. }));

        let held = manager.locks_for_resource("doc-1");
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].status, LockStatus::Acquired);
    }

    #[tokio::test]
    async fn test_double_release_is_not_found() {
        let manager = create_test_manager();
        let lock = acquire(&manager, "doc-1", LockType::Read, "owner-1", 100)
            .await
            .unwrap();

        manager.release_lock(lock.id, "owner-1").unwrap();
        let err = manager.release_lock(lock.id, "owner-1").unwrap_err();
        assert_eq!(err.code(), "E302");
    }

    #[tokio::test]
    async fn test_write_waits_for_read_release() {
        let manager = create_test_manager();
        let read = acquire(&manager, "doc-1", LockType::Read, "reader", 1000)
            .await
            .unwrap();

        let err = acquire(&manager, "doc-1", LockType::Write, "writer", 50)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(manager.lock_statistics().pending_locks, 0);

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                acquire(&manager, "doc-1", LockType::Write, "writer", 1000).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.lock_statistics().pending_locks, 1);

        manager.release_lock(read.id, "reader").unwrap();
        let write = waiter.await.unwrap().expect("writer should be granted");
        assert_eq!(write.lock_type, LockType::Write);
        assert_eq!(write.status, LockStatus::Acquired);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let manager =
            LockManager::without_sweeps(quiet_config().with_max_locks_per_resource(2));

        acquire(&manager, "doc-1", LockType::Read, "a", 100).await.unwrap();
        acquire(&manager, "doc-1", LockType::Read, "b", 100).await.unwrap();
        assert!(!manager.can_acquire_lock("doc-1", LockType::Read));

        let err = acquire(&manager, "doc-1", LockType::Read, "c", 50)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::AcquireTimeout { .. }));
        assert_eq!(manager.lock_statistics().active_locks, 2);
    }

    #[tokio::test]
    async fn test_notification_prefers_latest_waiter() {
        let manager = create_test_manager();
        let holder = acquire(&manager, "doc-1", LockType::Write, "holder", 1000)
            .await
            .unwrap();

        let spawn_waiter = |owner: &'static str| {
            let manager = manager.clone();
            tokio::spawn(async move {
                acquire(&manager, "doc-1", LockType::Write, owner, 2000).await
            })
        };
        let older = spawn_waiter("older");
        tokio::time::sleep(Duration::from_millis(10)).await;
        let newer = spawn_waiter("newer");
        tokio::time::sleep(Duration::from_millis(10)).await;

        manager.release_lock(holder.id, "holder").unwrap();
        let granted = newer.await.unwrap().unwrap();
        assert_eq!(granted.owner_id, "newer");
        assert_eq!(manager.lock_statistics().pending_locks, 1);

        manager.release_lock(granted.id, "newer").unwrap();
        let granted = older.await.unwrap().unwrap();
        assert_eq!(granted.owner_id, "older");
    }

    #[tokio::test]
    async fn test_one_grant_per_release() {
        let manager = create_test_manager();
        let writer = acquire(&manager, "doc-1", LockType::Write, "writer", 1000)
            .await
            .unwrap();

        let mut readers = Vec::new();
        for owner in ["r1", "r2"] {
            let manager = manager.clone();
            readers.push(tokio::spawn(async move {
                acquire(&manager, "doc-1", LockType::Read, owner, 2000).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.release_lock(writer.id, "writer").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let stats = manager.lock_statistics();
        assert_eq!(stats.active_locks, 1);
        assert_eq!(stats.pending_locks, 1);

        // The sweep notifies resources that still have waiters
        manager.sweep_expired_locks();
        for reader in readers {
            reader.await.unwrap().expect("reader should be granted");
        }
        assert_eq!(manager.lock_statistics().active_locks, 2);
    }

    #[tokio::test]
    async fn test_sweep_expires_held_locks() {
        let manager = create_test_manager();
        acquire(&manager, "doc-1", LockType::Exclusive, "owner-1", 20)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let sweep = manager.sweep_expired_locks();

        assert_eq!(sweep.expired_locks.len(), 1);
        assert_eq!(sweep.expired_locks[0].status, LockStatus::Timeout);
        assert_eq!(manager.lock_statistics().active_locks, 0);
    }

    #[tokio::test]
    async fn test_sweep_rejects_expired_waiters() {
        let manager = create_test_manager();
        acquire(&manager, "doc-1", LockType::Write, "holder", 10_000)
            .await
            .unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                acquire(&manager, "doc-1", LockType::Read, "waiter", 10_000).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        {
            let mut table = manager.shared.table();
            for request in table.waiting.values_mut().flatten() {
                request.lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
            }
        }

        let sweep = manager.sweep_expired_locks();
        assert_eq!(sweep.expired_waiters.len(), 1);
        assert!(sweep.expired_locks.is_empty());

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, LockError::WaitExpired { .. }));
        assert_eq!(manager.lock_statistics().pending_locks, 0);
    }

    #[tokio::test]
    async fn test_detect_deadlock_releases_oldest_lock() {
        let manager = create_test_manager();
        let waiting_for = |resource: &str| Some(LockMetadata::new().with_waiting_for(resource));

        let first = manager
            .acquire_lock("a", LockType::Read, "owner-1", "test", None, waiting_for("b"))
            .await
            .unwrap()
            .lock;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = manager
            .acquire_lock("a", LockType::Read, "owner-2", "test", None, waiting_for("b"))
            .await
            .unwrap()
            .lock;
        manager
            .acquire_lock("b", LockType::Write, "owner-3", "test", None, waiting_for("a"))
            .await
            .unwrap();

        let resolved = manager.detect_deadlocks();

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, first.id);
        assert_eq!(resolved[0].status, LockStatus::Deadlock);
        assert_eq!(
            manager.release_lock(first.id, "owner-1").unwrap_err(),
            LockError::NotFound(first.id)
        );
        assert!(manager.release_lock(second.id, "owner-2").is_ok());
    }

    #[tokio::test]
    async fn test_no_deadlock_without_cycle() {
        let manager = create_test_manager();
        manager
            .acquire_lock(
                "a",
                LockType::Write,
                "owner-1",
                "test",
                None,
                Some(LockMetadata::new().with_waiting_for("b")),
            )
            .await
            .unwrap();

        assert!(manager.detect_deadlocks().is_empty());
        assert_eq!(manager.lock_statistics().active_locks, 1);
    }

    #[tokio::test]
    async fn test_statistics_breakdown() {
        let manager = create_test_manager();
        acquire(&manager, "doc-1", LockType::Read, "a", 100).await.unwrap();
        acquire(&manager, "doc-1", LockType::Read, "b", 100).await.unwrap();
        acquire(&manager, "doc-2", LockType::Exclusive, "c", 100).await.unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                acquire(&manager, "doc-2", LockType::Write, "d", 1000).await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let stats = manager.lock_statistics();
        assert_eq!(stats.total_locks, 4);
        assert_eq!(stats.active_locks, 3);
        assert_eq!(stats.pending_locks, 1);
        assert_eq!(stats.locks_by_type[&LockType::Read], 2);
        assert_eq!(stats.locks_by_type[&LockType::Exclusive], 1);
        assert_eq!(stats.locks_by_type[&LockType::Write], 1);
        assert_eq!(stats.locks_by_resource["doc-2"], 2);
        assert!(stats.average_wait_time >= Duration::from_millis(20));

        manager.cleanup();
        assert!(waiter.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_cleanup_rejects_waiters_and_is_idempotent() {
        let manager = LockManager::new(ConcurrencyConfig::default());
        assert!(manager.is_running());

        acquire(&manager, "doc-1", LockType::Exclusive, "holder", 1000)
            .await
            .unwrap();
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                acquire(&manager, "doc-1", LockType::Read, "waiter", 5000).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.cleanup();
        manager.cleanup();

        assert_eq!(
            waiter.await.unwrap().unwrap_err(),
            LockError::ManagerShutdown
        );
        assert_eq!(manager.lock_statistics(), LockStatistics::default());
        tokio::task::yield_now().await;
        assert!(!manager.is_running());
    }

    #[test]
    fn test_cleanup_without_runtime() {
        let manager = LockManager::new(ConcurrencyConfig::default());
        assert!(!manager.is_running());
        manager.cleanup();
    }

    #[tokio::test]
    async fn test_events_published() {
        let manager = create_test_manager();
        let mut events = manager.subscribe();

        let lock = acquire(&manager, "doc-1", LockType::Write, "owner-1", 100)
            .await
            .unwrap();
        manager.release_lock(lock.id, "owner-1").unwrap();

        let acquired = events.recv().await.unwrap();
        assert_eq!(acquired.event_type, LockEventType::LockAcquired);
        assert_eq!(acquired.lock_id, lock.id);

        let released = events.recv().await.unwrap();
        assert_eq!(released.event_type, LockEventType::LockReleased);
    }

    #[tokio::test]
    async fn test_dropped_waiter_is_skipped() {
        let manager = create_test_manager();
        let holder = acquire(&manager, "doc-1", LockType::Write, "holder", 1000)
            .await
            .unwrap();

        let abandoned = {
            let manager = manager.clone();
            tokio::spawn(async move {
                acquire(&manager, "doc-1", LockType::Write, "abandoned", 5000).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        abandoned.abort();
        let _ = abandoned.await;

        manager.release_lock(holder.id, "holder").unwrap();
        let stats = manager.lock_statistics();
        assert_eq!(stats.active_locks, 0);
        assert_eq!(stats.pending_locks, 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_hands_grant_on() {
        let manager = create_test_manager();
        let holder = acquire(&manager, "doc-1", LockType::Write, "holder", 1000)
            .await
            .unwrap();

        let spawn_waiter = |owner: &'static str| {
            let manager = manager.clone();
            tokio::spawn(async move {
                acquire(&manager, "doc-1", LockType::Write, owner, 5000).await
            })
        };
        let older = spawn_waiter("older");
        tokio::time::sleep(Duration::from_millis(10)).await;
        let cancelled = spawn_waiter("cancelled");
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The grant goes to the newest waiter, which is aborted before it runs
        manager.release_lock(holder.id, "holder").unwrap();
        cancelled.abort();
        assert!(cancelled.await.unwrap_err().is_cancelled());

        let granted = older.await.unwrap().expect("older waiter should be granted");
        assert_eq!(granted.owner_id, "older");

        let held = manager.locks_for_resource("doc-1");
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].owner_id, "older");
        assert_eq!(manager.lock_statistics().pending_locks, 0);
    }

    #[tokio::test]
    async fn test_cancelled_sole_waiter_frees_resource() {
        let manager = create_test_manager();
        let mut events = manager.subscribe();
        let holder = acquire(&manager, "doc-1", LockType::Write, "holder", 1000)
            .await
            .unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                acquire(&manager, "doc-1", LockType::Write, "waiter", 5000).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        manager.release_lock(holder.id, "holder").unwrap();
        waiter.abort();
        let _ = waiter.await;

        assert_eq!(manager.lock_statistics().active_locks, 0);
        assert!(manager.can_acquire_lock("doc-1", LockType::Write));

        let mut released = 0;
        while let Ok(event) = events.try_recv() {
            if event.event_type == LockEventType::LockReleased {
                released += 1;
            }
        }
        assert_eq!(released, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grant_after_deadline_is_revoked() {
        let manager = create_test_manager();
        let holder = acquire(&manager, "doc-1", LockType::Write, "holder", 10_000)
            .await
            .unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                acquire(&manager, "doc-1", LockType::Write, "late", 100).await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(manager.lock_statistics().pending_locks, 1);

        tokio::time::advance(Duration::from_millis(500)).await;
        manager.release_lock(holder.id, "holder").unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, LockError::AcquireTimeout { .. }));
        assert_eq!(manager.lock_statistics().active_locks, 0);
        assert!(manager.can_acquire_lock("doc-1", LockType::Write));
    }
}
