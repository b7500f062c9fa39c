//! # granule-lock
//!
//! Multigranularity lock manager for GranuleDB.
//!
//! This crate mediates access to a tree of named resources
//! (database -> table -> page -> record) on behalf of transactions,
//! enforcing standard lock compatibility plus the constraints of
//! hierarchical (intention) locking:
//!
//! - **Lock modes**: S, X and the intention modes IS, IX, SIX, with the
//!   compatibility, substitutability and parent-mode algebra over them.
//!
//! - **Flat manager**: per-resource grant lists and FIFO wait queues with
//!   head-of-line fairness; promotions and acquire-and-release requests
//!   wait at the front of the queue instead of the back.
//!
//! - **Hierarchical contexts**: parent-intention enforcement, descendant
//!   lock counting, escalation, and effective-lock inference.
//!
//! - **Declarative helper**: one call that brings the hierarchy to a
//!   requested lock level with the least permissive set of locks.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                   ensure_sufficient (util)                │
//! │                            │                              │
//! │                            ▼                              │
//! │                   ┌─────────────────┐                     │
//! │                   │   LockContext   │  parent/child tree, │
//! │                   │                 │  escalation, counts │
//! │                   └────────┬────────┘                     │
//! │                            ▼                              │
//! │                   ┌─────────────────┐                     │
//! │                   │   LockManager   │  grant lists, wait  │
//! │                   │                 │  queues, draining   │
//! │                   └────────┬────────┘                     │
//! │                            ▼                              │
//! │                TransactionHandle::block / unblock         │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use granule_lock::{ensure_sufficient, LockManager, LockMode, Transaction, TransactionHandle};
//!
//! let manager = Arc::new(LockManager::new());
//! let txn = Transaction::new_handle(1u64);
//!
//! let page = manager
//!     .database_context()
//!     .child_context("table1")
//!     .child_context("page5");
//! ensure_sufficient(&txn, &page, LockMode::Exclusive);
//!
//! // the helper took intention locks on the ancestors automatically
//! let db = manager.database_context();
//! assert_eq!(db.explicit_lock_mode(txn.id()), LockMode::IntentionExclusive);
//! assert_eq!(page.explicit_lock_mode(txn.id()), LockMode::Exclusive);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Hierarchical lock contexts.
pub mod context;

/// Lock error types.
pub mod error;

/// The flat lock manager.
pub mod manager;

/// Lock modes and the lock-type algebra.
pub mod mode;

/// The transaction capability consumed by the lock manager.
pub mod txn;

/// Declarative lock acquisition.
pub mod util;

// Re-export commonly used types

pub use context::LockContext;
pub use error::{LockError, LockResult};
pub use manager::{Lock, LockManager, LockStats};
pub use mode::LockMode;
pub use txn::{Transaction, TransactionHandle, TxnRef};
pub use util::ensure_sufficient;
