//! The flat lock manager.
//!
//! [`LockManager`] is the bookkeeping layer: which transactions hold which
//! locks on which resources, and which requests are waiting. It treats every
//! resource as an independent object - the multigranularity rules live in
//! [`crate::context`]. It follows that requests that are valid when resources
//! are viewed independently are allowed here even when they would violate the
//! parent-intention rule.
//!
//! # Queueing discipline
//!
//! Each resource has a FIFO wait queue, processed from the front every time
//! a lock on the resource is released, stopping at the first request that is
//! still incompatible. A queue `[S X S]` whose head becomes grantable
//! therefore admits only the head: the trailing S never bypasses the X.
//! Two request kinds jump to the *front* of the queue instead of the back:
//! promotions and acquire-and-release, which upgrade locks the transaction
//! already holds rather than admit new work.
//!
//! # Blocking protocol
//!
//! All structural mutation happens under a single table mutex. A thread
//! never parks while holding it: the decision to wait is made inside the
//! critical section (and the transaction is marked blocked there), the mutex
//! is released, and only then does the requesting thread park. Wakeups from
//! queue draining are likewise delivered after the mutex is dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use granule_common::{ResourceName, TxnId};

use crate::context::LockContext;
use crate::error::{LockError, LockResult};
use crate::mode::LockMode;
use crate::txn::TxnRef;

/// A granted lock: resource, mode, owning transaction.
///
/// The mode is overwritten in place by a promotion, which keeps the lock's
/// position in both indices (acquisition order is stable across promotions).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    /// The resource the lock covers.
    pub resource: ResourceName,
    /// The current mode.
    pub mode: LockMode,
    /// The owning transaction.
    pub txn_id: TxnId,
}

impl Lock {
    fn new(resource: ResourceName, mode: LockMode, txn_id: TxnId) -> Self {
        Self {
            resource,
            mode,
            txn_id,
        }
    }
}

/// A pending request: the lock to grant, and the locks to release atomically
/// when the grant happens (empty for a plain acquire).
struct LockRequest {
    txn: TxnRef,
    lock: Lock,
    release: Vec<Lock>,
}

/// Per-resource state: granted locks in acquisition order, plus the FIFO
/// queue of requests that could not be satisfied yet.
#[derive(Default)]
struct ResourceEntry {
    granted: Vec<Lock>,
    waiting: VecDeque<LockRequest>,
}

impl ResourceEntry {
    /// True if any lock granted to another transaction is incompatible with
    /// `mode`. A transaction never conflicts with its own locks.
    fn conflicts_with(&self, mode: LockMode, txn: TxnId) -> bool {
        self.granted
            .iter()
            .any(|lock| lock.txn_id != txn && !lock.mode.is_compatible_with(mode))
    }

    fn is_empty(&self) -> bool {
        self.granted.is_empty() && self.waiting.is_empty()
    }
}

/// The two lock indices, maintained in lockstep: every granted lock appears
/// exactly once per resource and once in its transaction's list.
#[derive(Default)]
struct LockTable {
    by_resource: HashMap<ResourceName, ResourceEntry>,
    by_transaction: HashMap<TxnId, Vec<Lock>>,
}

impl LockTable {
    fn mode_of(&self, txn: TxnId, name: &ResourceName) -> LockMode {
        self.by_resource
            .get(name)
            .and_then(|entry| entry.granted.iter().find(|lock| lock.txn_id == txn))
            .map_or(LockMode::NoLock, |lock| lock.mode)
    }

    fn has_conflict(&self, name: &ResourceName, mode: LockMode, txn: TxnId) -> bool {
        self.by_resource
            .get(name)
            .is_some_and(|entry| entry.conflicts_with(mode, txn))
    }

    /// The blocking rule for fresh admissions: wait on a conflict, or on a
    /// non-empty queue even when compatible (no barging past waiters).
    fn must_wait(&self, name: &ResourceName, mode: LockMode, txn: TxnId) -> bool {
        self.by_resource
            .get(name)
            .is_some_and(|entry| entry.conflicts_with(mode, txn) || !entry.waiting.is_empty())
    }

    fn install(&mut self, lock: Lock) {
        self.by_transaction
            .entry(lock.txn_id)
            .or_default()
            .push(lock.clone());
        self.by_resource
            .entry(lock.resource.clone())
            .or_default()
            .granted
            .push(lock);
    }

    /// Removes the transaction's lock on `name` from both indices, pruning
    /// entries that become empty.
    fn remove(&mut self, txn: TxnId, name: &ResourceName) -> Option<Lock> {
        let entry = self.by_resource.get_mut(name)?;
        let pos = entry.granted.iter().position(|lock| lock.txn_id == txn)?;
        let lock = entry.granted.remove(pos);
        if entry.is_empty() {
            self.by_resource.remove(name);
        }
        if let Some(locks) = self.by_transaction.get_mut(&txn) {
            locks.retain(|held| &held.resource != name);
            if locks.is_empty() {
                self.by_transaction.remove(&txn);
            }
        }
        Some(lock)
    }

    /// Rewrites the mode of a held lock in place, in both indices. The
    /// lock's slot - and therefore its acquisition order - is unchanged.
    fn overwrite_mode(&mut self, txn: TxnId, name: &ResourceName, mode: LockMode) {
        if let Some(entry) = self.by_resource.get_mut(name) {
            if let Some(lock) = entry.granted.iter_mut().find(|lock| lock.txn_id == txn) {
                lock.mode = mode;
            }
        }
        if let Some(locks) = self.by_transaction.get_mut(&txn) {
            if let Some(lock) = locks.iter_mut().find(|lock| &lock.resource == name) {
                lock.mode = mode;
            }
        }
    }

    fn enqueue_back(&mut self, request: LockRequest) {
        self.by_resource
            .entry(request.lock.resource.clone())
            .or_default()
            .waiting
            .push_back(request);
    }

    fn enqueue_front(&mut self, request: LockRequest) {
        self.by_resource
            .entry(request.lock.resource.clone())
            .or_default()
            .waiting
            .push_front(request);
    }

    /// Installs a grant, releasing its release-set atomically. A released
    /// lock on the granted resource itself keeps its slot (the new mode is
    /// written in place); every other released resource is appended to
    /// `work` so its queue gets inspected in turn.
    fn grant(&mut self, lock: Lock, mut release: Vec<Lock>, work: &mut VecDeque<ResourceName>) {
        let same = release
            .iter()
            .position(|held| held.resource == lock.resource && held.txn_id == lock.txn_id);
        if let Some(pos) = same {
            let held = release.remove(pos);
            self.overwrite_mode(held.txn_id, &held.resource, lock.mode);
        } else {
            self.install(lock);
        }
        for held in release {
            let _ = self.remove(held.txn_id, &held.resource);
            work.push_back(held.resource);
        }
    }

    /// Drains wait queues over an iterative worklist of resources. For each
    /// resource the head request is granted while compatible; a grant whose
    /// release-set touches other resources pushes those onto the worklist,
    /// which is how releases cascade without unbounded recursion. Returns
    /// the transactions to unblock, in grant order.
    fn drain(&mut self, start: ResourceName) -> Vec<TxnRef> {
        let mut woken = Vec::new();
        let mut work = VecDeque::new();
        work.push_back(start);
        while let Some(res) = work.pop_front() {
            loop {
                let admit = {
                    let Some(entry) = self.by_resource.get(&res) else {
                        break;
                    };
                    match entry.waiting.front() {
                        Some(head) => !entry.conflicts_with(head.lock.mode, head.lock.txn_id),
                        None => false,
                    }
                };
                if !admit {
                    break;
                }
                let Some(request) = self
                    .by_resource
                    .get_mut(&res)
                    .and_then(|entry| entry.waiting.pop_front())
                else {
                    break;
                };
                let LockRequest { txn, lock, release } = request;
                trace!(txn = %lock.txn_id, resource = %lock.resource, mode = %lock.mode,
                       "granting queued request");
                self.grant(lock, release, &mut work);
                woken.push(txn);
            }
        }
        woken
    }
}

/// Counters over the lock manager's activity.
#[derive(Debug, Default)]
pub struct LockStats {
    /// Locks granted (immediately or from a queue).
    pub acquisitions: AtomicU64,
    /// Locks released.
    pub releases: AtomicU64,
    /// Requests that had to queue.
    pub waits: AtomicU64,
    /// In-place promotions.
    pub promotions: AtomicU64,
    /// Subtree escalations.
    pub escalations: AtomicU64,
}

impl LockStats {
    fn record_acquisition(&self) {
        self.acquisitions.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_release(&self) {
        self.releases.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_wait(&self) {
        self.waits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_promotion(&self) {
        self.promotions.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn record_escalation(&self) {
        self.escalations.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

/// The flat lock manager: per-resource grant lists and wait queues behind a
/// single mutex, plus the per-transaction lock index.
///
/// Code should generally go through [`LockContext`] instead of calling this
/// directly; the contexts layer the multigranularity constraints on top.
pub struct LockManager {
    table: Mutex<LockTable>,
    contexts: Mutex<HashMap<String, Arc<LockContext>>>,
    stats: LockStats,
}

impl LockManager {
    /// Creates an empty lock manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            contexts: Mutex::new(HashMap::new()),
            stats: LockStats::default(),
        }
    }

    /// Acquires a `mode` lock on `name` for `txn`.
    ///
    /// Blocks the calling thread if the lock conflicts with another
    /// transaction's lock or if other requests are already queued on the
    /// resource; the request then waits at the back of the queue.
    ///
    /// # Errors
    ///
    /// [`LockError::DuplicateLockRequest`] if `txn` already holds a lock on
    /// `name` (of any mode; upgrades go through [`LockManager::promote`]).
    pub fn acquire(&self, txn: &TxnRef, name: &ResourceName, mode: LockMode) -> LockResult<()> {
        let queued = {
            let mut table = self.table.lock();
            let id = txn.id();
            if table.mode_of(id, name) != LockMode::NoLock {
                return Err(LockError::DuplicateLockRequest {
                    txn_id: id,
                    resource: name.clone(),
                });
            }
            let lock = Lock::new(name.clone(), mode, id);
            if table.must_wait(name, mode, id) {
                trace!(txn = %id, resource = %name, mode = %mode, "lock request queued");
                table.enqueue_back(LockRequest {
                    txn: Arc::clone(txn),
                    lock,
                    release: Vec::new(),
                });
                txn.mark_blocked();
                true
            } else {
                table.install(lock);
                false
            }
        };
        if queued {
            self.stats.record_wait();
            txn.block();
        } else {
            self.stats.record_acquisition();
        }
        Ok(())
    }

    /// Releases `txn`'s lock on `name` and drains the resource's queue.
    ///
    /// # Errors
    ///
    /// [`LockError::NoLockHeld`] if `txn` holds no lock on `name`.
    pub fn release(&self, txn: &TxnRef, name: &ResourceName) -> LockResult<()> {
        let woken = {
            let mut table = self.table.lock();
            let Some(lock) = table.remove(txn.id(), name) else {
                return Err(LockError::NoLockHeld {
                    txn_id: txn.id(),
                    resource: name.clone(),
                });
            };
            trace!(txn = %lock.txn_id, resource = %lock.resource, mode = %lock.mode, "lock released");
            table.drain(name.clone())
        };
        self.stats.record_release();
        self.wake(woken);
        Ok(())
    }

    /// Promotes `txn`'s lock on `name` to the strictly stronger `new_mode`.
    ///
    /// An uncontended promotion rewrites the mode in place, preserving the
    /// lock's acquisition order. A contended one waits at the *front* of the
    /// queue with the old lock attached as its release-set.
    ///
    /// # Errors
    ///
    /// [`LockError::NoLockHeld`] if nothing is held,
    /// [`LockError::DuplicateLockRequest`] if `new_mode` is already held,
    /// [`LockError::InvalidLock`] if `new_mode` is not substitutable for the
    /// held mode.
    pub fn promote(&self, txn: &TxnRef, name: &ResourceName, new_mode: LockMode) -> LockResult<()> {
        let queued = {
            let mut table = self.table.lock();
            let id = txn.id();
            let current = table.mode_of(id, name);
            if current == LockMode::NoLock {
                return Err(LockError::NoLockHeld {
                    txn_id: id,
                    resource: name.clone(),
                });
            }
            if current == new_mode {
                return Err(LockError::DuplicateLockRequest {
                    txn_id: id,
                    resource: name.clone(),
                });
            }
            if !new_mode.substitutes_for(current) {
                return Err(LockError::InvalidLock {
                    txn_id: id,
                    resource: name.clone(),
                    reason: "requested mode is not a promotion of the held mode",
                });
            }
            if table.has_conflict(name, new_mode, id) {
                trace!(txn = %id, resource = %name, mode = %new_mode, "promotion queued at front");
                let held = Lock::new(name.clone(), current, id);
                table.enqueue_front(LockRequest {
                    txn: Arc::clone(txn),
                    lock: Lock::new(name.clone(), new_mode, id),
                    release: vec![held],
                });
                txn.mark_blocked();
                true
            } else {
                table.overwrite_mode(id, name, new_mode);
                false
            }
        };
        if queued {
            self.stats.record_wait();
            txn.block();
        } else {
            self.stats.record_promotion();
        }
        Ok(())
    }

    /// Acquires a `mode` lock on `name` and releases every lock named in
    /// `release`, as one atomic action. Releases happen only after the new
    /// lock is granted. If the request must wait it is placed at the *front*
    /// of the queue with the release-set attached, and nothing is released
    /// until the grant fires.
    ///
    /// A release of the old lock on `name` itself keeps the lock's slot:
    /// the resource counts as acquired at the original time.
    ///
    /// # Errors
    ///
    /// [`LockError::DuplicateLockRequest`] if `txn` holds a lock on `name`
    /// that is not being released; [`LockError::NoLockHeld`] if any resource
    /// in `release` is not currently locked by `txn`. Both are checked
    /// before any lock is touched.
    pub fn acquire_and_release(
        &self,
        txn: &TxnRef,
        name: &ResourceName,
        mode: LockMode,
        release: &[ResourceName],
    ) -> LockResult<()> {
        let (queued, woken) = {
            let mut table = self.table.lock();
            let id = txn.id();
            if table.mode_of(id, name) != LockMode::NoLock && !release.contains(name) {
                return Err(LockError::DuplicateLockRequest {
                    txn_id: id,
                    resource: name.clone(),
                });
            }
            let mut to_release = Vec::with_capacity(release.len());
            for res in release {
                let held = table.mode_of(id, res);
                if held == LockMode::NoLock {
                    return Err(LockError::NoLockHeld {
                        txn_id: id,
                        resource: res.clone(),
                    });
                }
                to_release.push(Lock::new(res.clone(), held, id));
            }
            let lock = Lock::new(name.clone(), mode, id);
            if table.must_wait(name, mode, id) {
                trace!(txn = %id, resource = %name, mode = %mode,
                       releases = release.len(), "acquire-and-release queued at front");
                table.enqueue_front(LockRequest {
                    txn: Arc::clone(txn),
                    lock,
                    release: to_release,
                });
                txn.mark_blocked();
                (true, Vec::new())
            } else {
                let mut work = VecDeque::new();
                table.grant(lock, to_release, &mut work);
                let mut woken = Vec::new();
                while let Some(res) = work.pop_front() {
                    woken.extend(table.drain(res));
                }
                (false, woken)
            }
        };
        if queued {
            self.stats.record_wait();
        } else {
            self.stats.record_acquisition();
        }
        self.wake(woken);
        if queued {
            txn.block();
        }
        Ok(())
    }

    /// Returns the mode `txn` holds on `name`, or `NL`.
    #[must_use]
    pub fn lock_mode(&self, txn: TxnId, name: &ResourceName) -> LockMode {
        self.table.lock().mode_of(txn, name)
    }

    /// Returns a snapshot of the locks granted on `name`, in acquisition
    /// order. Promotions and acquire-and-release count as acquired at the
    /// original time.
    #[must_use]
    pub fn resource_locks(&self, name: &ResourceName) -> Vec<Lock> {
        self.table
            .lock()
            .by_resource
            .get(name)
            .map(|entry| entry.granted.clone())
            .unwrap_or_default()
    }

    /// Returns a snapshot of the locks held by `txn`, in acquisition order.
    #[must_use]
    pub fn transaction_locks(&self, txn: TxnId) -> Vec<Lock> {
        self.table
            .lock()
            .by_transaction
            .get(&txn)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the activity counters.
    #[must_use]
    pub fn stats(&self) -> &LockStats {
        &self.stats
    }

    /// Returns the context for the root of the main hierarchy, creating it
    /// on first use.
    #[must_use]
    pub fn database_context(self: &Arc<Self>) -> Arc<LockContext> {
        self.top_level_context(granule_common::ROOT_RESOURCE)
    }

    /// Returns a parentless context disjoint from the main hierarchy.
    ///
    /// # Panics
    ///
    /// Panics if `name` is the reserved main-hierarchy root name.
    #[must_use]
    pub fn orphan_context(self: &Arc<Self>, name: &str) -> Arc<LockContext> {
        assert_ne!(
            name,
            granule_common::ROOT_RESOURCE,
            "orphan context cannot use the main hierarchy root name"
        );
        self.top_level_context(name)
    }

    fn top_level_context(self: &Arc<Self>, name: &str) -> Arc<LockContext> {
        let mut contexts = self.contexts.lock();
        Arc::clone(
            contexts
                .entry(name.to_string())
                .or_insert_with(|| LockContext::new_root(self, name)),
        )
    }

    fn wake(&self, woken: Vec<TxnRef>) {
        for waiter in woken {
            self.stats.record_acquisition();
            waiter.unblock();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_quiescent(&self) -> bool {
        let table = self.table.lock();
        table.by_resource.is_empty() && table.by_transaction.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let table = self.table.lock();
        for (name, entry) in &table.by_resource {
            assert!(!entry.is_empty(), "empty entry not pruned for {name}");
            // at most one lock per transaction, all pairs compatible
            for (i, a) in entry.granted.iter().enumerate() {
                assert_eq!(&a.resource, name);
                for b in &entry.granted[i + 1..] {
                    assert_ne!(a.txn_id, b.txn_id, "two locks by {} on {name}", a.txn_id);
                    assert!(
                        a.mode.is_compatible_with(b.mode),
                        "incompatible grants {} and {} on {name}",
                        a.mode,
                        b.mode
                    );
                }
                let listed = table
                    .by_transaction
                    .get(&a.txn_id)
                    .map_or(0, |locks| locks.iter().filter(|l| *l == a).count());
                assert_eq!(listed, 1, "index mismatch for {} on {name}", a.txn_id);
            }
            for request in &entry.waiting {
                assert!(request.txn.is_blocked(), "queued txn not blocked");
            }
        }
        for (txn, locks) in &table.by_transaction {
            assert!(!locks.is_empty(), "empty lock list not pruned for {txn}");
            for lock in locks {
                assert_eq!(lock.txn_id, *txn);
                let granted = table
                    .by_resource
                    .get(&lock.resource)
                    .map_or(0, |e| e.granted.iter().filter(|g| *g == lock).count());
                assert_eq!(granted, 1, "index mismatch for {txn} on {}", lock.resource);
            }
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
