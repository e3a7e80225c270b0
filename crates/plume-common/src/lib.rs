//! # Plume Common
//!
//! Common types, utilities, and shared abstractions for Plume.
//!
//! This crate provides foundational types used across all Plume subsystems:
//! - Block and grid-space coordinate types
//! - Generation-tagged arena handles and scene IDs
//! - Version watermarks for configuration snapshots
//! - Common error types
//! - Prelude for convenient imports

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod coords;
pub mod error;
pub mod ids;
pub mod version;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::coords::*;
    pub use crate::error::*;
    pub use crate::ids::*;
    pub use crate::version::*;
}

pub use prelude::*;
