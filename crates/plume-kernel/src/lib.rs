//! # Plume Kernel
//!
//! Device queues, sparse grids, and proxy transport for Plume.
//!
//! This crate provides the scheduling core below the scene layer:
//! - Host binding traits and the software and wgpu backends
//! - Device queues with fence bookkeeping and backpressure status
//! - The sparse virtual-to-physical block table
//! - Grids, grid materials, and immutable grid exports
//! - Grid proxies that move exports between queues and devices
//! - The double-buffered custom emission protocol
//! - Render materials, volume rendering, and volume shadows
//!
//! ## Fences
//!
//! Every queue counts fences from 1. Recorded work is submitted on flush and
//! tagged with the next fence value; `frames_in_flight` is the number of
//! submissions whose fence has not completed. Nothing in the per-frame path
//! waits on a fence; only teardown does.
//!
//! ## Exports
//!
//! A grid update publishes a new `Arc<GridExport>` generation. Proxies hand
//! generations to the render side only after the transport fence passes, so
//! a reader never observes a generation that is still being written.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod backend;
pub mod block_table;
pub mod device;
pub mod emit;
pub mod emit_custom;
pub mod export;
pub mod grid;
pub mod material;
pub mod proxy;
pub mod render;
pub mod sdf;
pub mod software;
pub mod wgpu_backend;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::backend::*;
    pub use crate::block_table::*;
    pub use crate::device::*;
    pub use crate::emit::*;
    pub use crate::emit_custom::*;
    pub use crate::export::*;
    pub use crate::grid::*;
    pub use crate::material::*;
    pub use crate::proxy::*;
    pub use crate::render::*;
    pub use crate::sdf::*;
    pub use crate::software::*;
    pub use crate::wgpu_backend::*;
}

pub use prelude::*;

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_software_scene_step_reaches_render() {
        let host = SoftwareHost::new(SoftwareHostDesc::default());
        let mut queues = QueueSet::new();
        let queue = queues.insert(DeviceQueue::new("host", QueueKind::Graphics, false, host.render_queue()));

        let desc = GridDesc {
            virtual_dim: glam::UVec3::splat(64),
            resident_scale: 1.0,
            ..GridDesc::default()
        };
        let mut grid = Grid::new(GridId::from_raw(1), desc, DEFAULT_RELEASE_HYSTERESIS).expect("grid");
        let mut proxy = GridProxy::new(GridProxyType::PassThrough, grid.grid_export());
        let params = GridProxyFlushParams::single(queue);

        grid.emit(&[ShapeDesc::Sphere { radius: 0.1 }], &[EmitParams::sphere(Vec3::ZERO, 0.1)]);
        if let Some(q) = queues.get_mut(queue) {
            grid.update(q, 1.0 / 60.0, &mut EmitCustomRegistry::new());
        }
        proxy.push(grid.grid_export(), &mut queues, &params);
        proxy.flush(&mut queues, &params);

        let export = proxy.get_grid_export();
        assert_eq!(export.version(), 1);
        assert!(export.num_blocks(GridTextureChannel::Velocity) >= 1);

        let fence = queues.get_mut(queue).map(DeviceQueue::flush);
        assert_eq!(fence, Some(1));
        assert!(host
            .submitted_commands()
            .iter()
            .any(|c| matches!(c, GpuCommand::GridUpdate { version: 1, .. })));
    }
}
