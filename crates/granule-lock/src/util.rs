//! Declarative lock acquisition.
//!
//! [`ensure_sufficient`] is the layer callers should normally use: given a
//! context and the lock level an operation needs (S or X), it brings the
//! whole hierarchy into a state where that level is effectively held -
//! acquiring intention locks on ancestors, promoting, or escalating as
//! needed - while granting the least permissive set of locks that works.
//!
//! The helper is deliberately lenient: requests it cannot interpret
//! (an intention mode) and lock-manager errors along the way are silent
//! no-ops rather than new failure kinds.

use crate::context::LockContext;
use crate::mode::LockMode;
use crate::txn::TxnRef;

/// Ensures `txn` can perform actions requiring `required` on `ctx`.
///
/// `required` must be S or X; intention modes are ignored.
pub fn ensure_sufficient(txn: &TxnRef, ctx: &LockContext, required: LockMode) {
    if !matches!(required, LockMode::Shared | LockMode::Exclusive) {
        return;
    }
    let id = txn.id();
    let needed_above = required.parent_mode();
    let effective = ctx.effective_lock_mode(id);

    if effective == required {
        return;
    }
    if effective == LockMode::NoLock {
        if let Some(parent) = ctx.parent_context() {
            acquire_ancestors(txn, needed_above, &parent);
        }
        let _ = ctx.acquire(txn, required);
        return;
    }
    if effective.substitutes_for(required) {
        // already holding something stronger
        return;
    }
    if required.substitutes_for(effective) {
        // a plain upgrade: raise the ancestors first, then this level
        if let Some(parent) = ctx.parent_context() {
            promote_ancestors(txn, needed_above, &parent);
        }
        let _ = ctx.promote(txn, required);
        return;
    }
    // a fine-grained read pattern asking for a coarse read: one escalation
    // covers it
    if required == LockMode::Shared
        && ctx.explicit_lock_mode(id) == LockMode::IntentionShared
        && ctx.child_lock_count(id) > 0
    {
        let _ = ctx.escalate(txn);
        return;
    }
    // collapse the subtree, then upgrade if the collapsed lock still falls
    // short of what was asked for
    let _ = ctx.escalate(txn);
    if !ctx.effective_lock_mode(id).substitutes_for(required) {
        if let Some(parent) = ctx.parent_context() {
            promote_ancestors(txn, needed_above, &parent);
        }
        let _ = ctx.promote(txn, required);
    }
}

/// Acquires `mode` on every ancestor that holds nothing, root first. An
/// ancestor holding anything is left alone: by the parent-intention rule
/// everything above it is already covered.
fn acquire_ancestors(txn: &TxnRef, mode: LockMode, ctx: &LockContext) {
    if ctx.effective_lock_mode(txn.id()) != LockMode::NoLock {
        return;
    }
    if let Some(parent) = ctx.parent_context() {
        acquire_ancestors(txn, mode, &parent);
    }
    let _ = ctx.acquire(txn, mode);
}

/// Promotes to `mode` every ancestor holding a strictly weaker lock that
/// `mode` substitutes for. Recurses before acting, so the root is promoted
/// first and the parent-intention rule holds throughout.
fn promote_ancestors(txn: &TxnRef, mode: LockMode, ctx: &LockContext) {
    if let Some(parent) = ctx.parent_context() {
        promote_ancestors(txn, mode, &parent);
    }
    let current = ctx.effective_lock_mode(txn.id());
    if current != LockMode::NoLock && current != mode && mode.substitutes_for(current) {
        let _ = ctx.promote(txn, mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::LockManager;
    use crate::txn::testing::txn;
    use granule_common::TxnId;
    use std::sync::Arc;
    use LockMode::*;

    fn setup() -> (Arc<LockManager>, Arc<LockContext>) {
        let manager = Arc::new(LockManager::new());
        let db = manager.database_context();
        (manager, db)
    }

    fn modes_held(manager: &LockManager, id: TxnId) -> Vec<(String, LockMode)> {
        manager
            .transaction_locks(id)
            .into_iter()
            .map(|lock| (lock.resource.to_string(), lock.mode))
            .collect()
    }

    #[test]
    fn test_acquires_intents_down_to_the_target() {
        let (manager, db) = setup();
        let t1 = txn(1);
        let page5 = db.child_context("table1").child_context("page5");

        ensure_sufficient(&t1, &page5, Exclusive);
        assert_eq!(
            modes_held(&manager, t1.id()),
            vec![
                ("database".to_string(), IntentionExclusive),
                ("database/table1".to_string(), IntentionExclusive),
                ("database/table1/page5".to_string(), Exclusive),
            ]
        );
    }

    #[test]
    fn test_noop_when_already_covered() {
        let (manager, db) = setup();
        let t1 = txn(1);
        let page = db.child_context("table1").child_context("page1");

        db.acquire(&t1, Shared).expect("grant");
        let before = modes_held(&manager, t1.id());

        // an inherited S covers a shared request anywhere below
        ensure_sufficient(&t1, &page, Shared);
        assert_eq!(modes_held(&manager, t1.id()), before);

        // and an explicit X covers a shared request at its own level
        let (manager, db) = setup();
        db.acquire(&t1, Exclusive).expect("grant");
        let before = modes_held(&manager, t1.id());
        ensure_sufficient(&t1, &db, Shared);
        assert_eq!(modes_held(&manager, t1.id()), before);
    }

    #[test]
    fn test_upgrade_promotes_ancestors_first() {
        let (manager, db) = setup();
        let t1 = txn(1);
        let table = db.child_context("table1");
        let page = table.child_context("page1");

        ensure_sufficient(&t1, &page, Shared);
        assert_eq!(
            modes_held(&manager, t1.id()),
            vec![
                ("database".to_string(), IntentionShared),
                ("database/table1".to_string(), IntentionShared),
                ("database/table1/page1".to_string(), Shared),
            ]
        );

        ensure_sufficient(&t1, &page, Exclusive);
        assert_eq!(
            modes_held(&manager, t1.id()),
            vec![
                ("database".to_string(), IntentionExclusive),
                ("database/table1".to_string(), IntentionExclusive),
                ("database/table1/page1".to_string(), Exclusive),
            ]
        );
    }

    #[test]
    fn test_saturated_read_escalates_instead_of_promoting() {
        let (manager, db) = setup();
        let t1 = txn(1);
        let table = db.child_context("table1");
        table.set_capacity(10);

        for i in 0..8 {
            ensure_sufficient(
                &t1,
                &table.child_context(format!("page{i}")),
                Shared,
            );
        }
        assert!(table.saturation(t1.id()) >= 0.8);

        ensure_sufficient(&t1, &table, Shared);
        assert_eq!(
            modes_held(&manager, t1.id()),
            vec![
                ("database".to_string(), IntentionShared),
                ("database/table1".to_string(), Shared),
            ]
        );
    }

    #[test]
    fn test_escalate_then_promote_when_still_short() {
        let (manager, db) = setup();
        let t1 = txn(1);
        let table = db.child_context("table1");
        let page = table.child_context("page1");

        ensure_sufficient(&t1, &page, Shared);
        // asking for a coarse write over a read-locked subtree: the
        // escalation yields S, which must then be promoted to X with the
        // ancestors raised to IX
        ensure_sufficient(&t1, &table, Exclusive);
        assert_eq!(
            modes_held(&manager, t1.id()),
            vec![
                ("database".to_string(), IntentionExclusive),
                ("database/table1".to_string(), Exclusive),
            ]
        );
    }

    #[test]
    fn test_escalation_absorbs_write_intents() {
        let (manager, db) = setup();
        let t1 = txn(1);
        let table = db.child_context("table1");
        let page = table.child_context("page1");

        ensure_sufficient(&t1, &page, Exclusive);
        // the IX at the table is neither sufficient for S nor upgradable to
        // it; escalation collapses the subtree and the X it produces covers
        // the request
        ensure_sufficient(&t1, &table, Shared);
        assert_eq!(
            modes_held(&manager, t1.id()),
            vec![
                ("database".to_string(), IntentionExclusive),
                ("database/table1".to_string(), Exclusive),
            ]
        );
    }

    #[test]
    fn test_idempotent() {
        let (manager, db) = setup();
        let t1 = txn(1);
        let page = db.child_context("table1").child_context("page1");

        ensure_sufficient(&t1, &page, Exclusive);
        let once = modes_held(&manager, t1.id());
        ensure_sufficient(&t1, &page, Exclusive);
        assert_eq!(modes_held(&manager, t1.id()), once);

        ensure_sufficient(&t1, &db, Shared);
        let once = modes_held(&manager, t1.id());
        ensure_sufficient(&t1, &db, Shared);
        assert_eq!(modes_held(&manager, t1.id()), once);
    }

    #[test]
    fn test_intention_requests_are_ignored() {
        let (manager, db) = setup();
        let t1 = txn(1);

        ensure_sufficient(&t1, &db, IntentionExclusive);
        ensure_sufficient(&t1, &db, NoLock);
        assert!(modes_held(&manager, t1.id()).is_empty());
    }
}
