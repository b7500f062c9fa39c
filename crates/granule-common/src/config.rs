//! Lock hierarchy configuration.
//!
//! Lock state is never persisted: the enclosing engine rebuilds its lock
//! contexts at start-up. [`ContextSpec`] is the declarative description it
//! uses to do so - the shape of the hierarchy, per-node capacity overrides
//! (a table declares its page count), and subtrees where finer-grain locks
//! are disabled (indices, temporary tables).

use serde::{Deserialize, Serialize};

use crate::types::ROOT_RESOURCE;

/// Declarative description of one node of a lock hierarchy.
///
/// # Example
///
/// ```rust
/// use granule_common::config::ContextSpec;
///
/// let spec = ContextSpec::new("database")
///     .with_child(ContextSpec::new("table1").with_capacity(10))
///     .with_child(ContextSpec::new("index1").without_child_locks());
/// assert_eq!(spec.children.len(), 2);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSpec {
    /// Name of this node (a single path component).
    pub name: String,

    /// Capacity override for saturation accounting. When absent, capacity
    /// defaults to the number of children created so far.
    #[serde(default)]
    pub capacity: Option<usize>,

    /// Whether children of this node are created readonly (no finer-grain
    /// locks below this level).
    #[serde(default)]
    pub disable_child_locks: bool,

    /// Child nodes to create eagerly.
    #[serde(default)]
    pub children: Vec<ContextSpec>,
}

impl ContextSpec {
    /// Creates a spec for a node with no children and no overrides.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: None,
            disable_child_locks: false,
            children: Vec::new(),
        }
    }

    /// Sets the capacity override.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Marks children of this node readonly.
    #[must_use]
    pub fn without_child_locks(mut self) -> Self {
        self.disable_child_locks = true;
        self
    }

    /// Appends a child spec.
    #[must_use]
    pub fn with_child(mut self, child: ContextSpec) -> Self {
        self.children.push(child);
        self
    }
}

impl Default for ContextSpec {
    fn default() -> Self {
        Self::new(ROOT_RESOURCE)
    }
}
