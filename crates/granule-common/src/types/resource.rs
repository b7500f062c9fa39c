//! Hierarchical resource names.
//!
//! A [`ResourceName`] identifies a node in the lockable hierarchy
//! (database, table, page, record, ...) as the full path from the root.
//! Equality and hashing are over the full path, so resource names can be
//! used directly as lock-table keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Conventional name of the root of the main hierarchy.
pub const ROOT_RESOURCE: &str = "database";

/// An immutable path from a hierarchy root to a resource.
///
/// Resource names are cheap to compare and hash, and answer the
/// parent/ancestor queries the hierarchical lock layer relies on.
///
/// # Example
///
/// ```rust
/// use granule_common::types::ResourceName;
///
/// let db = ResourceName::root("database");
/// let page = db.child("table1").child("page3");
/// assert_eq!(page.to_string(), "database/table1/page3");
/// assert!(page.is_descendant_of(&db));
/// assert_eq!(page.parent().unwrap(), db.child("table1"));
/// ```
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceName {
    parts: Vec<String>,
}

impl ResourceName {
    /// Creates a top-level resource name with a single component.
    #[must_use]
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            parts: vec![name.into()],
        }
    }

    /// Returns the name of a direct child of this resource.
    #[must_use]
    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut parts = self.parts.clone();
        parts.push(name.into());
        Self { parts }
    }

    /// Returns the parent resource name, or `None` at a hierarchy root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.parts.len() <= 1 {
            return None;
        }
        Some(Self {
            parts: self.parts[..self.parts.len() - 1].to_vec(),
        })
    }

    /// Returns the last path component.
    #[must_use]
    pub fn leaf(&self) -> &str {
        // parts is never empty by construction
        &self.parts[self.parts.len() - 1]
    }

    /// Returns the number of path components.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.parts.len()
    }

    /// Returns true if this name is a hierarchy root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parts.len() == 1
    }

    /// Iterates over the path components, root first.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().map(String::as_str)
    }

    /// Returns true if this name is a strict descendant of `other`.
    #[must_use]
    pub fn is_descendant_of(&self, other: &Self) -> bool {
        self.parts.len() > other.parts.len()
            && self.parts[..other.parts.len()] == other.parts[..]
    }

    /// Returns true if this name is a strict ancestor of `other`.
    #[must_use]
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        other.is_descendant_of(self)
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.parts.join("/"))
    }
}

impl fmt::Debug for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceName({})", self)
    }
}
