//! Host graphics/compute binding.
//!
//! The scheduling layer never talks to a graphics API directly. It records
//! [`GpuCommand`] values onto device queues and hands them to a
//! [`QueueBackend`] in [`Submission`]s, each tagged with the fence value the
//! backend signals once the work completes on the GPU.
//!
//! Two implementations ship with the crate: [`crate::software::SoftwareHost`],
//! a deterministic stand-in used for headless runs and tests, and
//! [`crate::wgpu_backend::WgpuHost`], which binds queues to wgpu devices.

use std::fmt;
use std::sync::Arc;

use plume_common::DeviceError;

use crate::export::GridTextureChannel;
use crate::grid::{GridId, GridParams};

/// Kind of native submission queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// General graphics queue
    Graphics,
    /// Compute-only queue (async compute)
    Compute,
    /// Copy/transfer queue
    Copy,
}

impl QueueKind {
    /// Short name for logs and errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Graphics => "graphics",
            Self::Compute => "compute",
            Self::Copy => "copy",
        }
    }
}

/// Whether a device reuses the host's device or is dedicated to simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceMode {
    /// Shares the host's existing device
    Proxy,
    /// A separate physical device acquired for simulation
    Unique,
}

/// Which render pass a volume render command belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPass {
    /// Color pass, optionally composited after translucency
    Color {
        /// Only composite color written by an earlier depth pass
        color_composite_only: bool,
    },
    /// Depth-only pre-composite pass
    Depth,
    /// Shadow debug overlay
    ShadowDebug,
}

/// One unit of GPU work recorded by the scheduling layer.
///
/// Commands carry only values so a submission can outlive whatever
/// recorded it.
#[derive(Debug, Clone, PartialEq)]
pub enum GpuCommand {
    /// Batched emitter/collider shapes consumed by the next grid update
    EmitShapes {
        /// Target grid
        grid: GridId,
        /// Emit and collide records in the batch
        records: u32,
        /// Shape descriptors referenced by the records
        shapes: u32,
    },
    /// One custom emission dispatch for a channel of a layer
    CustomEmit {
        /// Target grid
        grid: GridId,
        /// Channel written
        channel: GridTextureChannel,
        /// Layer index
        layer: u32,
    },
    /// One simulation step
    GridUpdate {
        /// Target grid
        grid: GridId,
        /// Export version produced by this step
        version: u64,
        /// Step size in seconds
        dt: f32,
        /// Active blocks after allocation
        active_blocks: u32,
        /// Solver and debug settings the step runs with
        params: GridParams,
    },
    /// Copy of an export's block table, block list, and channel data
    ExportCopy {
        /// Source grid
        grid: GridId,
        /// Export version copied
        version: u64,
        /// Active blocks copied
        blocks: u32,
    },
    /// Shadow map update from a resolved export
    ShadowUpdate {
        /// Source grid
        grid: GridId,
        /// Export version shadowed
        version: u64,
        /// Shadow blocks touched
        blocks: u32,
    },
    /// Volume rasterization of a resolved export
    VolumeRender {
        /// Source grid
        grid: GridId,
        /// Export version rendered
        version: u64,
        /// Pass being recorded
        pass: RenderPass,
    },
}

impl GpuCommand {
    /// Grid the command operates on.
    #[must_use]
    pub const fn grid(&self) -> GridId {
        match self {
            Self::EmitShapes { grid, .. }
            | Self::CustomEmit { grid, .. }
            | Self::GridUpdate { grid, .. }
            | Self::ExportCopy { grid, .. }
            | Self::ShadowUpdate { grid, .. }
            | Self::VolumeRender { grid, .. } => *grid,
        }
    }
}

impl fmt::Display for GpuCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmitShapes { grid, records, shapes } => {
                write!(f, "emit {grid}: {records} records, {shapes} shapes")
            }
            Self::CustomEmit { grid, channel, layer } => {
                write!(f, "custom emit {grid}: {channel:?} layer {layer}")
            }
            Self::GridUpdate {
                grid,
                version,
                dt,
                active_blocks,
                params,
            } => write!(
                f,
                "update {grid} v{version}: dt {dt:.4}, {active_blocks} blocks, debug vis {:#x}",
                params.debug_vis_flags.bits()
            ),
            Self::ExportCopy { grid, version, blocks } => {
                write!(f, "copy {grid} v{version}: {blocks} blocks")
            }
            Self::ShadowUpdate { grid, version, blocks } => {
                write!(f, "shadow {grid} v{version}: {blocks} blocks")
            }
            Self::VolumeRender { grid, version, pass } => {
                write!(f, "render {grid} v{version}: {pass:?}")
            }
        }
    }
}

/// Work handed to a queue backend in one submit.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    /// Fence value signaled when this work completes
    pub fence_value: u64,
    /// Commands in recording order
    pub commands: Vec<GpuCommand>,
}

/// One native command queue.
pub trait QueueBackend: Send + Sync + fmt::Debug {
    /// Submits recorded work; completion signals `submission.fence_value`.
    fn submit(&self, submission: Submission);

    /// Highest fence value known to be complete. Never blocks.
    fn completed_fence(&self) -> u64;

    /// Blocks until `fence_value` completes. Teardown only.
    fn wait_for_fence(&self, fence_value: u64);
}

/// A physical device able to create queues.
pub trait DeviceBackend: Send + Sync + fmt::Debug {
    /// Adapter name for logs.
    fn name(&self) -> &str;

    /// Creates a queue of the given kind.
    fn create_queue(&self, kind: QueueKind, low_latency: bool) -> Result<Arc<dyn QueueBackend>, DeviceError>;
}

/// The host renderer's device, queue, and feature probes.
pub trait HostBackend: Send + Sync + fmt::Debug {
    /// The host's own graphics queue, where pass-through work lands.
    fn render_queue(&self) -> Arc<dyn QueueBackend>;

    /// The host's device, used for proxy-mode queues.
    fn render_device(&self) -> Arc<dyn DeviceBackend>;

    /// Whether a second physical device could be dedicated to simulation.
    fn dedicated_device_available(&self) -> bool;

    /// Whether the host device exposes an independent compute queue.
    fn dedicated_device_queue_available(&self) -> bool;

    /// Acquires a device other than the host's.
    fn create_dedicated_device(&self) -> Result<Arc<dyn DeviceBackend>, DeviceError>;
}
