//! The transaction capability the lock manager consumes.
//!
//! The lock manager never inspects transaction state beyond the operations
//! of [`TransactionHandle`]: a stable id, and the block/unblock pair used to
//! park a transaction's thread while a lock request waits in a queue.
//!
//! Blocking is two-phase. The manager calls [`TransactionHandle::mark_blocked`]
//! while it still holds the lock-table mutex (the instant the request is
//! enqueued), releases the mutex, and only then calls
//! [`TransactionHandle::block`]. A wakeup that arrives between the two calls
//! is therefore never lost: `block` returns immediately if the flag has
//! already been cleared by [`TransactionHandle::unblock`].

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use granule_common::TxnId;

/// Shared handle to a transaction, as stored in wait queues.
pub type TxnRef = Arc<dyn TransactionHandle>;

/// The capability the enclosing engine supplies for each transaction.
///
/// A transaction is *blocked* exactly while one of its lock requests sits in
/// some resource's wait queue.
pub trait TransactionHandle: Send + Sync {
    /// Returns the stable transaction id.
    fn id(&self) -> TxnId;

    /// Marks the transaction blocked. Called by the lock manager inside its
    /// critical section, before the requesting thread parks.
    fn mark_blocked(&self);

    /// Parks the calling thread until [`TransactionHandle::unblock`] runs.
    /// Returns immediately if the transaction is not marked blocked.
    fn block(&self);

    /// Clears the blocked state and wakes the transaction's thread.
    fn unblock(&self);

    /// Returns true while a lock request of this transaction is queued.
    fn is_blocked(&self) -> bool;
}

/// Standard parking implementation of [`TransactionHandle`].
///
/// `block` suspends the calling thread on a condition variable until another
/// thread (running a release or a queue drain) calls `unblock`.
pub struct Transaction {
    id: TxnId,
    blocked: Mutex<bool>,
    unblocked: Condvar,
}

impl Transaction {
    /// Creates a transaction with the given id.
    #[must_use]
    pub fn new(id: impl Into<TxnId>) -> Self {
        Self {
            id: id.into(),
            blocked: Mutex::new(false),
            unblocked: Condvar::new(),
        }
    }

    /// Creates a transaction and returns it as a shared [`TxnRef`] handle.
    #[must_use]
    pub fn new_handle(id: impl Into<TxnId>) -> TxnRef {
        Arc::new(Self::new(id))
    }
}

impl TransactionHandle for Transaction {
    fn id(&self) -> TxnId {
        self.id
    }

    fn mark_blocked(&self) {
        *self.blocked.lock() = true;
    }

    fn block(&self) {
        let mut blocked = self.blocked.lock();
        while *blocked {
            self.unblocked.wait(&mut blocked);
        }
    }

    fn unblock(&self) {
        let mut blocked = self.blocked.lock();
        *blocked = false;
        self.unblocked.notify_all();
    }

    fn is_blocked(&self) -> bool {
        *self.blocked.lock()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_unblock_before_block_is_not_lost() {
        let txn = Transaction::new(1u64);
        txn.mark_blocked();
        assert!(txn.is_blocked());
        txn.unblock();
        // must not park
        txn.block();
        assert!(!txn.is_blocked());
    }

    #[test]
    fn test_block_parks_until_unblocked() {
        let txn = Transaction::new_handle(1u64);
        txn.mark_blocked();

        let waiter = {
            let txn = Arc::clone(&txn);
            std::thread::spawn(move || txn.block())
        };
        // give the waiter a moment to park; it must still be blocked
        std::thread::sleep(Duration::from_millis(20));
        assert!(txn.is_blocked());

        txn.unblock();
        waiter.join().expect("waiter thread");
        assert!(!txn.is_blocked());
    }

    #[test]
    fn test_block_without_mark_returns_immediately() {
        let txn = Transaction::new(7u64);
        txn.block();
        assert!(!txn.is_blocked());
    }
}
