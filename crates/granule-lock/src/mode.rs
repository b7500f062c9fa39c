//! Lock modes and the multigranularity lock-type algebra.
//!
//! Six modes cover both direct locks (S, X) and the intention locks used at
//! non-leaf levels of the hierarchy (IS, IX, SIX). `NL` stands for "no lock"
//! and is what lookups return for resources a transaction holds nothing on.
//!
//! # Lock Compatibility Matrix
//!
//! ```text
//!          │ IS │ IX │ S  │ SIX │ X  │
//! ─────────┼────┼────┼────┼─────┼────┤
//!     IS   │ ✓  │ ✓  │ ✓  │ ✓   │ ✗  │
//!     IX   │ ✓  │ ✓  │ ✗  │ ✗   │ ✗  │
//!     S    │ ✓  │ ✗  │ ✓  │ ✗   │ ✗  │
//!     SIX  │ ✓  │ ✗  │ ✗  │ ✗   │ ✗  │
//!     X    │ ✗  │ ✗  │ ✗  │ ✗   │ ✗  │
//! ```
//!
//! `NL` is compatible with everything.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lock mode for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// No lock held.
    NoLock,
    /// Intention shared (declares intent to take S locks on descendants).
    IntentionShared,
    /// Intention exclusive (declares intent to take X locks on descendants).
    IntentionExclusive,
    /// Shared lock (read lock).
    Shared,
    /// Shared + intention exclusive (reads here, intends X on descendants).
    SharedIntentionExclusive,
    /// Exclusive lock (write lock).
    Exclusive,
}

impl LockMode {
    /// Checks if this lock mode is compatible with another.
    ///
    /// Two modes are compatible if different transactions may hold them on
    /// the same resource at the same time. The relation is symmetric.
    #[must_use]
    pub fn is_compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        matches!(
            (self, other),
            (NoLock, _) | (_, NoLock) |
            // IS is compatible with everything but X
            (IntentionShared, IntentionShared)
                | (IntentionShared, IntentionExclusive)
                | (IntentionExclusive, IntentionShared)
                | (IntentionShared, Shared)
                | (Shared, IntentionShared)
                | (IntentionShared, SharedIntentionExclusive)
                | (SharedIntentionExclusive, IntentionShared)
                // IX admits other intents
                | (IntentionExclusive, IntentionExclusive)
                // S admits other readers
                | (Shared, Shared)
        )
    }

    /// Checks if holding this mode grants every permission of `required`.
    ///
    /// Always true when the modes are equal or nothing is required. Beyond
    /// that, X and SIX substitute for S, IX and SIX substitute for IS, and
    /// SIX and X substitute for IX.
    #[must_use]
    pub fn substitutes_for(self, required: LockMode) -> bool {
        use LockMode::*;
        if self == required || required == NoLock {
            return true;
        }
        matches!(
            (self, required),
            (Exclusive, Shared)
                | (SharedIntentionExclusive, Shared)
                | (IntentionExclusive, IntentionShared)
                | (SharedIntentionExclusive, IntentionShared)
                | (SharedIntentionExclusive, IntentionExclusive)
                | (Exclusive, IntentionExclusive)
        )
    }

    /// Returns the weakest mode that must be held on the parent resource
    /// for a lock of this mode to be taken on a child.
    #[must_use]
    pub fn parent_mode(self) -> LockMode {
        use LockMode::*;
        match self {
            NoLock => NoLock,
            IntentionShared | Shared => IntentionShared,
            IntentionExclusive | SharedIntentionExclusive | Exclusive => IntentionExclusive,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::NoLock => write!(f, "NL"),
            LockMode::IntentionShared => write!(f, "IS"),
            LockMode::IntentionExclusive => write!(f, "IX"),
            LockMode::Shared => write!(f, "S"),
            LockMode::SharedIntentionExclusive => write!(f, "SIX"),
            LockMode::Exclusive => write!(f, "X"),
        }
    }
}
