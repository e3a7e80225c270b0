//! # Plume Engine
//!
//! Scene orchestration for Plume sparse-grid simulation.
//!
//! This crate drives grids frame by frame on top of `plume-kernel`:
//! - Engine configuration and the fixed-step substep clock
//! - Versioned grid snapshots and their material, emitter, and collider data
//! - Device topology: pass-through, async compute, and multi-GPU queues
//! - Per-grid scenes with proxies, volume rendering, and volume shadows
//! - Particle interaction and distance-field collision callbacks
//! - A typed task queue that carries authoring work to the submission thread
//!
//! ## Threading
//!
//! A [`Context`] and its scenes live on one thread. Authoring threads hold a
//! [`ContextHandle`] and record [`Task`] values; nothing they send refers
//! back into a scene.
//!
//! ## Backpressure
//!
//! Scenes on dedicated queues skip substeps while too many frames are in
//! flight. Skipped work is lost; the per-frame path never waits on a fence.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod context;
pub mod debug_info;
pub mod distance_field;
pub mod material_map;
pub mod particles;
pub mod properties;
pub mod scene;
pub mod shadow;
pub mod task;
pub mod timing;
pub mod topology;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::*;
    pub use crate::context::*;
    pub use crate::debug_info::*;
    pub use crate::distance_field::*;
    pub use crate::material_map::*;
    pub use crate::particles::*;
    pub use crate::properties::*;
    pub use crate::scene::*;
    pub use crate::shadow::*;
    pub use crate::task::*;
    pub use crate::timing::*;
    pub use crate::topology::*;
}

pub use prelude::*;
