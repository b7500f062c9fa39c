//! Type definitions for GranuleDB.
//!
//! This module contains the core type definitions used across the lock
//! manager and the surrounding engine.

mod ids;
mod resource;

pub use ids::TxnId;
pub use resource::{ResourceName, ROOT_RESOURCE};
