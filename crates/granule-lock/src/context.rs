//! Hierarchical lock contexts.
//!
//! A [`LockContext`] is one node of the multigranularity hierarchy
//! (database, table, page, ...). It wraps the flat [`LockManager`] with the
//! constraints the flat layer deliberately ignores:
//!
//! - an acquisition must be covered by an intention lock on the parent;
//! - a release must not orphan locks held on descendants;
//! - escalation collapses a transaction's subtree locks into one coarse
//!   lock at this level.
//!
//! Contexts also track, per transaction, how many locks are held on
//! descendants of each node. That count feeds the saturation heuristic the
//! declarative layer uses to decide when escalation is worthwhile.
//!
//! The tree is collectively owned by the manager: children are owned by
//! their parent's map, and parent/manager links are non-owning back-pointers.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use granule_common::{ContextSpec, ResourceName, TxnId, ROOT_RESOURCE};

use crate::error::{LockError, LockResult};
use crate::manager::LockManager;
use crate::mode::LockMode;
use crate::txn::TxnRef;

/// A node in the lock hierarchy.
pub struct LockContext {
    manager: Weak<LockManager>,
    parent: Option<Weak<LockContext>>,
    name: ResourceName,
    readonly: bool,
    child_locks_disabled: AtomicBool,
    /// Capacity override; 0 means "derive from the live child count".
    capacity: AtomicUsize,
    /// Locks held on descendants of this node, per transaction.
    num_child_locks: Mutex<HashMap<TxnId, usize>>,
    children: Mutex<HashMap<String, Arc<LockContext>>>,
}

impl LockContext {
    pub(crate) fn new_root(manager: &Arc<LockManager>, name: &str) -> Arc<Self> {
        Arc::new(Self {
            manager: Arc::downgrade(manager),
            parent: None,
            name: ResourceName::root(name),
            readonly: false,
            child_locks_disabled: AtomicBool::new(false),
            capacity: AtomicUsize::new(0),
            num_child_locks: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
        })
    }

    /// Resolves `name` to its context, creating intermediate contexts as
    /// needed. The first path component selects the main hierarchy or an
    /// orphan hierarchy.
    #[must_use]
    pub fn from_resource_name(manager: &Arc<LockManager>, name: &ResourceName) -> Arc<Self> {
        let mut ctx: Option<Arc<LockContext>> = None;
        for component in name.components() {
            ctx = Some(match ctx {
                None if component == ROOT_RESOURCE => manager.database_context(),
                None => manager.orphan_context(component),
                Some(parent) => parent.child_context(component),
            });
        }
        ctx.expect("resource names have at least one component")
    }

    /// Builds a context subtree from a declarative spec, applying capacity
    /// overrides and child-lock disabling as it goes. Children listed under
    /// a node that disables child locks are created readonly.
    #[must_use]
    pub fn from_spec(manager: &Arc<LockManager>, spec: &ContextSpec) -> Arc<Self> {
        let root = if spec.name == ROOT_RESOURCE {
            manager.database_context()
        } else {
            manager.orphan_context(&spec.name)
        };
        Self::apply_spec(&root, spec);
        root
    }

    fn apply_spec(ctx: &Arc<LockContext>, spec: &ContextSpec) {
        if let Some(capacity) = spec.capacity {
            ctx.set_capacity(capacity);
        }
        if spec.disable_child_locks {
            ctx.disable_child_locks();
        }
        for child_spec in &spec.children {
            let child = ctx.child_context(child_spec.name.as_str());
            Self::apply_spec(&child, child_spec);
        }
    }

    /// Returns the resource this context pertains to.
    #[must_use]
    pub fn name(&self) -> &ResourceName {
        &self.name
    }

    /// Returns the parent context, or `None` at a hierarchy root.
    #[must_use]
    pub fn parent_context(&self) -> Option<Arc<LockContext>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Returns the context for the child named `name`, creating it lazily.
    /// Children of a readonly context, and children created while child
    /// locks are disabled, are themselves readonly.
    #[must_use]
    pub fn child_context(self: &Arc<Self>, name: impl Into<String>) -> Arc<LockContext> {
        let name = name.into();
        let mut children = self.children.lock();
        Arc::clone(children.entry(name.clone()).or_insert_with(|| {
            Arc::new(LockContext {
                manager: self.manager.clone(),
                parent: Some(Arc::downgrade(self)),
                name: self.name.child(name),
                readonly: self.readonly
                    || self.child_locks_disabled.load(AtomicOrdering::Relaxed),
                child_locks_disabled: AtomicBool::new(false),
                capacity: AtomicUsize::new(0),
                num_child_locks: Mutex::new(HashMap::new()),
                children: Mutex::new(HashMap::new()),
            })
        }))
    }

    fn manager(&self) -> Arc<LockManager> {
        // contexts are owned by the manager, so the back-pointer is live for
        // as long as any context operation can run
        self.manager.upgrade().expect("lock manager dropped")
    }

    /// Acquires a `mode` lock at this level for `txn`.
    ///
    /// # Errors
    ///
    /// [`LockError::Unsupported`] on a readonly context;
    /// [`LockError::InvalidLock`] if the parent does not hold a sufficient
    /// intention lock; the flat layer's
    /// [`LockError::DuplicateLockRequest`] passes through.
    pub fn acquire(&self, txn: &TxnRef, mode: LockMode) -> LockResult<()> {
        self.check_writable()?;
        let manager = self.manager();
        if let Some(parent) = self.parent_context() {
            let held = manager.lock_mode(txn.id(), parent.name());
            if !held.substitutes_for(mode.parent_mode()) {
                return Err(LockError::InvalidLock {
                    txn_id: txn.id(),
                    resource: self.name.clone(),
                    reason: "parent holds no sufficient intention lock",
                });
            }
        }
        manager.acquire(txn, &self.name, mode)?;
        self.for_each_ancestor(|ancestor| ancestor.add_child_lock(txn.id()));
        Ok(())
    }

    /// Releases `txn`'s lock at this level.
    ///
    /// # Errors
    ///
    /// [`LockError::Unsupported`] on a readonly context;
    /// [`LockError::InvalidLock`] if `txn` still holds locks on descendants
    /// (releasing would orphan them); the flat layer's
    /// [`LockError::NoLockHeld`] passes through.
    pub fn release(&self, txn: &TxnRef) -> LockResult<()> {
        self.check_writable()?;
        if self.child_lock_count(txn.id()) > 0 {
            return Err(LockError::InvalidLock {
                txn_id: txn.id(),
                resource: self.name.clone(),
                reason: "descendant locks would be orphaned",
            });
        }
        self.manager().release(txn, &self.name)?;
        self.for_each_ancestor(|ancestor| ancestor.remove_child_lock(txn.id()));
        Ok(())
    }

    /// Promotes `txn`'s lock at this level to `new_mode`. Keeping the
    /// parent-intention invariant across a promotion is the caller's
    /// responsibility (the declarative layer promotes ancestors first).
    ///
    /// # Errors
    ///
    /// [`LockError::Unsupported`] on a readonly context; otherwise whatever
    /// the flat promotion reports.
    pub fn promote(&self, txn: &TxnRef, new_mode: LockMode) -> LockResult<()> {
        self.check_writable()?;
        self.manager().promote(txn, &self.name, new_mode)
    }

    /// Replaces every lock `txn` holds on this subtree with a single lock
    /// at this level: X if any subtree lock allows writes (IX, SIX, X),
    /// otherwise S. Calling escalate again without intervening changes is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// [`LockError::Unsupported`] on a readonly context;
    /// [`LockError::NoLockHeld`] if `txn` holds no lock at this level.
    pub fn escalate(&self, txn: &TxnRef) -> LockResult<()> {
        self.check_writable()?;
        let manager = self.manager();
        let explicit = manager.lock_mode(txn.id(), &self.name);
        if explicit == LockMode::NoLock {
            return Err(LockError::NoLockHeld {
                txn_id: txn.id(),
                resource: self.name.clone(),
            });
        }
        if self.child_lock_count(txn.id()) == 0
            && matches!(explicit, LockMode::Shared | LockMode::Exclusive)
        {
            return Ok(());
        }

        let mut target = LockMode::Shared;
        let mut releases = Vec::new();
        let mut descendants = Vec::new();
        for lock in manager.transaction_locks(txn.id()) {
            let in_subtree =
                lock.resource == self.name || lock.resource.is_descendant_of(&self.name);
            if !in_subtree {
                continue;
            }
            if !matches!(lock.mode, LockMode::IntentionShared | LockMode::Shared) {
                target = LockMode::Exclusive;
            }
            if lock.resource != self.name {
                descendants.push(lock.resource.clone());
            }
            releases.push(lock.resource);
        }

        debug!(txn = %txn.id(), resource = %self.name, target = %target,
               collapsed = releases.len(), "escalating subtree");
        manager.acquire_and_release(txn, &self.name, target, &releases)?;
        manager.stats().record_escalation();

        // every ancestor of a released descendant loses one child lock;
        // the walk covers this context (down to zero) and everything above
        for released in descendants {
            let mut ctx = Self::from_resource_name(&manager, &released);
            while let Some(parent) = ctx.parent_context() {
                parent.remove_child_lock(txn.id());
                ctx = parent;
            }
        }
        Ok(())
    }

    /// Returns the mode `txn` holds on exactly this resource, or `NL`.
    #[must_use]
    pub fn explicit_lock_mode(&self, txn: TxnId) -> LockMode {
        self.manager().lock_mode(txn, &self.name)
    }

    /// Returns the mode `txn` may exercise at this level, explicitly held
    /// or inherited: S, X and SIX flow down from ancestors (SIX confers S),
    /// intention-only ancestors confer nothing.
    #[must_use]
    pub fn effective_lock_mode(&self, txn: TxnId) -> LockMode {
        let explicit = self.explicit_lock_mode(txn);
        if explicit != LockMode::NoLock {
            return explicit;
        }
        match self.parent_context() {
            None => LockMode::NoLock,
            Some(parent) => match parent.effective_lock_mode(txn) {
                LockMode::Shared | LockMode::SharedIntentionExclusive => LockMode::Shared,
                LockMode::Exclusive => LockMode::Exclusive,
                _ => LockMode::NoLock,
            },
        }
    }

    /// Returns the number of locks `txn` holds on descendants of this node.
    #[must_use]
    pub fn child_lock_count(&self, txn: TxnId) -> usize {
        self.num_child_locks.lock().get(&txn).copied().unwrap_or(0)
    }

    /// Returns the fraction of this node's capacity covered by `txn`'s
    /// descendant locks (0 when the capacity is 0).
    #[must_use]
    pub fn saturation(&self, txn: TxnId) -> f64 {
        let capacity = self.capacity();
        if capacity == 0 {
            return 0.0;
        }
        self.child_lock_count(txn) as f64 / capacity as f64
    }

    /// Returns the capacity: the override if one was set, otherwise the
    /// number of child contexts created so far.
    #[must_use]
    pub fn capacity(&self) -> usize {
        let overridden = self.capacity.load(AtomicOrdering::Relaxed);
        if overridden != 0 {
            overridden
        } else {
            self.children.lock().len()
        }
    }

    /// Overrides the capacity (e.g. a table declares its page count without
    /// materializing a context per page).
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, AtomicOrdering::Relaxed);
    }

    /// Makes all child contexts created from now on readonly. Used for
    /// subtrees where finer-grain locking is not allowed, such as indices
    /// and temporary tables.
    pub fn disable_child_locks(&self) {
        self.child_locks_disabled.store(true, AtomicOrdering::Relaxed);
    }

    /// Returns true if mutating operations are rejected at this level.
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn check_writable(&self) -> LockResult<()> {
        if self.readonly {
            return Err(LockError::Unsupported {
                resource: self.name.clone(),
            });
        }
        Ok(())
    }

    fn for_each_ancestor(&self, mut apply: impl FnMut(&Arc<LockContext>)) {
        let mut current = self.parent_context();
        while let Some(ctx) = current {
            apply(&ctx);
            current = ctx.parent_context();
        }
    }

    fn add_child_lock(&self, txn: TxnId) {
        *self.num_child_locks.lock().entry(txn).or_insert(0) += 1;
    }

    fn remove_child_lock(&self, txn: TxnId) {
        let mut counts = self.num_child_locks.lock();
        if let Some(count) = counts.get_mut(&txn) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&txn);
            }
        }
    }
}

impl fmt::Debug for LockContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockContext")
            .field("name", &self.name)
            .field("readonly", &self.readonly)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::testing::txn;
    use LockMode::*;

    fn setup() -> (Arc<LockManager>, Arc<LockContext>) {
        let manager = Arc::new(LockManager::new());
        let db = manager.database_context();
        (manager, db)
    }

    #[test]
    fn test_parent_intention_is_required() {
        let (_manager, db) = setup();
        let t1 = txn(1);
        let table = db.child_context("table1");

        let err = table.acquire(&t1, Shared).expect_err("no parent intent");
        assert!(matches!(err, LockError::InvalidLock { .. }));

        db.acquire(&t1, IntentionShared).expect("root grant");
        table.acquire(&t1, Shared).expect("covered by IS");

        // X needs IX (or better) above, IS is not enough
        let table2 = db.child_context("table2");
        let err = table2.acquire(&t1, Exclusive).expect_err("IS under X");
        assert!(matches!(err, LockError::InvalidLock { .. }));
    }

    #[test]
    fn test_child_lock_counts_cover_all_descendants() {
        let (_manager, db) = setup();
        let t1 = txn(1);
        let table = db.child_context("table1");
        let page = table.child_context("page3");

        db.acquire(&t1, IntentionShared).expect("grant");
        table.acquire(&t1, IntentionShared).expect("grant");
        page.acquire(&t1, Shared).expect("grant");

        assert_eq!(db.child_lock_count(t1.id()), 2);
        assert_eq!(table.child_lock_count(t1.id()), 1);
        assert_eq!(page.child_lock_count(t1.id()), 0);
    }

    #[test]
    fn test_release_refuses_to_orphan_descendants() {
        let (_manager, db) = setup();
        let t1 = txn(1);
        let table = db.child_context("table1");

        db.acquire(&t1, IntentionShared).expect("grant");
        table.acquire(&t1, Shared).expect("grant");

        let err = db.release(&t1).expect_err("would orphan table lock");
        assert!(matches!(err, LockError::InvalidLock { .. }));

        table.release(&t1).expect("leaf first");
        db.release(&t1).expect("then the root");
        assert_eq!(db.child_lock_count(t1.id()), 0);
    }

    #[test]
    fn test_readonly_propagates_to_new_children() {
        let (_manager, db) = setup();
        let t1 = txn(1);
        let index = db.child_context("index1");
        index.disable_child_locks();
        let leaf = index.child_context("leaf0");

        assert!(!index.is_readonly());
        assert!(leaf.is_readonly());
        // and grandchildren of a readonly context stay readonly
        assert!(leaf.child_context("cell0").is_readonly());

        let err = leaf.acquire(&t1, Shared).expect_err("readonly");
        assert!(matches!(err, LockError::Unsupported { .. }));
        let err = leaf.release(&t1).expect_err("readonly");
        assert!(matches!(err, LockError::Unsupported { .. }));
        let err = leaf.escalate(&t1).expect_err("readonly");
        assert!(matches!(err, LockError::Unsupported { .. }));
    }

    #[test]
    fn test_effective_lock_inference() {
        let (_manager, db) = setup();
        let t1 = txn(1);
        let table = db.child_context("table1");
        let page = table.child_context("page3");

        assert_eq!(page.effective_lock_mode(t1.id()), NoLock);

        db.acquire(&t1, Exclusive).expect("grant");
        assert_eq!(page.effective_lock_mode(t1.id()), Exclusive);
        assert_eq!(page.explicit_lock_mode(t1.id()), NoLock);
        db.release(&t1).expect("release");

        // intention locks confer nothing downward
        db.acquire(&t1, IntentionExclusive).expect("grant");
        assert_eq!(page.effective_lock_mode(t1.id()), NoLock);
        assert_eq!(db.effective_lock_mode(t1.id()), IntentionExclusive);
        db.release(&t1).expect("release");

        // SIX reads as SIX at its own level and confers S below
        db.acquire(&t1, SharedIntentionExclusive).expect("grant");
        assert_eq!(db.effective_lock_mode(t1.id()), SharedIntentionExclusive);
        assert_eq!(table.effective_lock_mode(t1.id()), Shared);
        assert_eq!(page.effective_lock_mode(t1.id()), Shared);
    }

    #[test]
    fn test_escalate_collapses_the_subtree() {
        let (_manager, db) = setup();
        let t1 = txn(1);
        let table1 = db.child_context("table1");
        let table2 = db.child_context("table2");
        let page3 = table1.child_context("page3");
        let page5 = table1.child_context("page5");

        db.acquire(&t1, IntentionExclusive).expect("grant");
        table1.acquire(&t1, IntentionExclusive).expect("grant");
        table2.acquire(&t1, Shared).expect("grant");
        page3.acquire(&t1, Shared).expect("grant");
        page5.acquire(&t1, Exclusive).expect("grant");
        assert_eq!(db.child_lock_count(t1.id()), 4);

        table1.escalate(&t1).expect("escalate");

        // the X on page5 forces an X at the table
        assert_eq!(table1.explicit_lock_mode(t1.id()), Exclusive);
        assert_eq!(page3.explicit_lock_mode(t1.id()), NoLock);
        assert_eq!(page5.explicit_lock_mode(t1.id()), NoLock);
        assert_eq!(page3.effective_lock_mode(t1.id()), Exclusive);
        // untouched siblings stay as they were
        assert_eq!(db.explicit_lock_mode(t1.id()), IntentionExclusive);
        assert_eq!(table2.explicit_lock_mode(t1.id()), Shared);
        // page3 and page5 are gone from the counts; table1 itself remains
        assert_eq!(db.child_lock_count(t1.id()), 2);
        assert_eq!(table1.child_lock_count(t1.id()), 0);
    }

    #[test]
    fn test_escalate_to_shared_when_subtree_only_reads() {
        let (_manager, db) = setup();
        let t1 = txn(1);
        let table = db.child_context("table1");
        let page = table.child_context("page1");

        db.acquire(&t1, IntentionShared).expect("grant");
        table.acquire(&t1, IntentionShared).expect("grant");
        page.acquire(&t1, Shared).expect("grant");

        table.escalate(&t1).expect("escalate");
        assert_eq!(table.explicit_lock_mode(t1.id()), Shared);
        assert_eq!(page.explicit_lock_mode(t1.id()), NoLock);
    }

    #[test]
    fn test_escalate_twice_is_a_noop() {
        let (manager, db) = setup();
        let t1 = txn(1);
        let table = db.child_context("table1");
        let page = table.child_context("page1");

        db.acquire(&t1, IntentionShared).expect("grant");
        table.acquire(&t1, IntentionShared).expect("grant");
        page.acquire(&t1, Shared).expect("grant");

        table.escalate(&t1).expect("escalate");
        let held = manager.transaction_locks(t1.id());
        table.escalate(&t1).expect("no-op");
        assert_eq!(manager.transaction_locks(t1.id()), held);
        assert_eq!(
            manager
                .stats()
                .escalations
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_escalate_requires_a_lock_at_this_level() {
        let (_manager, db) = setup();
        let t1 = txn(1);
        let err = db.escalate(&t1).expect_err("nothing held");
        assert!(matches!(err, LockError::NoLockHeld { .. }));
    }

    #[test]
    fn test_escalate_upgrades_a_bare_intention_lock() {
        let (_manager, db) = setup();
        let t1 = txn(1);

        db.acquire(&t1, IntentionExclusive).expect("grant");
        db.escalate(&t1).expect("escalate");
        assert_eq!(db.explicit_lock_mode(t1.id()), Exclusive);
    }

    #[test]
    fn test_capacity_and_saturation() {
        let (_manager, db) = setup();
        let t1 = txn(1);
        let table = db.child_context("table1");

        // capacity defaults to the number of children created
        assert_eq!(db.capacity(), 1);
        table.set_capacity(10);
        assert_eq!(table.capacity(), 10);

        db.acquire(&t1, IntentionShared).expect("grant");
        table.acquire(&t1, IntentionShared).expect("grant");
        for i in 0..8 {
            table
                .child_context(format!("page{i}"))
                .acquire(&t1, Shared)
                .expect("grant");
        }
        assert!((table.saturation(t1.id()) - 0.8).abs() < f64::EPSILON);
        // no children, no capacity: saturation is zero
        let empty = table.child_context("page0").child_context("rec0");
        assert_eq!(empty.saturation(t1.id()), 0.0);
    }

    #[test]
    fn test_orphan_hierarchy_is_disjoint() {
        let (manager, db) = setup();
        let t1 = txn(1);
        let orphan = manager.orphan_context("scratch");

        orphan.acquire(&t1, Exclusive).expect("own root");
        assert_eq!(db.explicit_lock_mode(t1.id()), NoLock);
        assert_eq!(orphan.child_context("x").effective_lock_mode(t1.id()), Exclusive);
    }

    #[test]
    #[should_panic(expected = "orphan context")]
    fn test_orphan_context_rejects_the_root_name() {
        let manager = Arc::new(LockManager::new());
        let _ = manager.orphan_context(ROOT_RESOURCE);
    }

    #[test]
    fn test_from_resource_name_resolves_and_creates() {
        let (manager, db) = setup();
        let name = ResourceName::root(ROOT_RESOURCE)
            .child("table1")
            .child("page3");
        let ctx = LockContext::from_resource_name(&manager, &name);
        assert_eq!(ctx.name(), &name);
        let parent = ctx.parent_context().expect("has parent");
        assert_eq!(parent.name(), db.child_context("table1").name());
    }

    #[test]
    fn test_from_spec_builds_the_tree() {
        let manager = Arc::new(LockManager::new());
        let spec = ContextSpec::new(ROOT_RESOURCE)
            .with_child(ContextSpec::new("table1").with_capacity(10))
            .with_child(ContextSpec::new("index1").without_child_locks());
        let db = LockContext::from_spec(&manager, &spec);

        assert_eq!(db.capacity(), 2);
        assert_eq!(db.child_context("table1").capacity(), 10);
        assert!(db
            .child_context("index1")
            .child_context("leaf0")
            .is_readonly());
    }
}
