//! Error types for the lock manager.
//!
//! Every failure kind is raised before any lock state is mutated, so a
//! caller that observes an error can assume the manager is unchanged.

use granule_common::{ResourceName, TxnId};
use thiserror::Error;

/// Result type alias for lock operations.
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Errors reported by the lock manager and the hierarchical contexts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The transaction already holds a lock on the resource.
    #[error("transaction {txn_id} already holds a lock on {resource}")]
    DuplicateLockRequest {
        /// The requesting transaction.
        txn_id: TxnId,
        /// The resource the duplicate request targeted.
        resource: ResourceName,
    },

    /// A release or promotion targeted a resource the transaction holds no
    /// lock on.
    #[error("transaction {txn_id} holds no lock on {resource}")]
    NoLockHeld {
        /// The requesting transaction.
        txn_id: TxnId,
        /// The resource with no lock to operate on.
        resource: ResourceName,
    },

    /// The request is structurally invalid: a promotion target that is not
    /// substitutable for the held mode, an acquisition that would break the
    /// parent-intention rule, or a release that would orphan descendant
    /// locks.
    #[error("invalid lock request by transaction {txn_id} on {resource}: {reason}")]
    InvalidLock {
        /// The requesting transaction.
        txn_id: TxnId,
        /// The resource the request targeted.
        resource: ResourceName,
        /// What made the request invalid.
        reason: &'static str,
    },

    /// A mutating operation was attempted on a readonly context.
    #[error("context {resource} is readonly")]
    Unsupported {
        /// The readonly resource.
        resource: ResourceName,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LockError::NoLockHeld {
            txn_id: TxnId::new(3),
            resource: ResourceName::root("database").child("table1"),
        };
        assert_eq!(
            err.to_string(),
            "transaction 3 holds no lock on database/table1"
        );

        let err = LockError::Unsupported {
            resource: ResourceName::root("database").child("index1"),
        };
        assert_eq!(err.to_string(), "context database/index1 is readonly");
    }
}
