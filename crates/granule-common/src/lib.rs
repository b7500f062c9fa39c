//! # granule-common
//!
//! Common types and configuration for GranuleDB.
//!
//! This crate provides the foundational types shared across GranuleDB
//! components:
//!
//! - **Types**: `TxnId` (transaction identifier) and `ResourceName`
//!   (hierarchical resource path)
//! - **Config**: `ContextSpec`, a declarative description of a lock
//!   hierarchy used to rebuild lock contexts at engine start-up
//!
//! ## Example
//!
//! ```rust
//! use granule_common::types::{ResourceName, TxnId};
//!
//! let txn = TxnId::new(1);
//! let table = ResourceName::root("database").child("table1");
//! assert_eq!(table.to_string(), "database/table1");
//! assert!(txn.is_valid());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod types;

// Re-export commonly used items at the crate root
pub use config::ContextSpec;
pub use types::{ResourceName, TxnId, ROOT_RESOURCE};
