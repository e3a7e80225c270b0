//! Grid proxies.
//!
//! A proxy carries grid exports from the queue that simulates to the queue
//! that renders. Three variants exist:
//!
//! - [`GridProxyType::PassThrough`]: both sides share a queue. `push` makes
//!   the export visible at once and `flush` does nothing.
//! - [`GridProxyType::MultiGpu`]: `push` records a cross-device copy and
//!   stages the export. `flush` submits the copy; once the render copy
//!   queue's fence passes, a later `flush` flips the render-side view to it.
//! - [`GridProxyType::InterQueue`]: like multi-GPU without the copy; the
//!   grid queue's fence gates the flip.
//!
//! A proxy holds at most one staged and one in-flight export. A newer push
//! supersedes an older staged one, so outstanding transfers stay bounded.
//! [`GridProxy::get_grid_export`] only reads the resolved front slot.

use std::sync::Arc;

use tracing::debug;

use crate::backend::GpuCommand;
use crate::device::{QueueId, QueueSet};
use crate::emit_custom::SwapBuffer;
use crate::export::{GridExport, GridTextureChannel};

/// Transport selected when the proxy is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GridProxyType {
    /// Simulation and rendering share one queue
    PassThrough,
    /// Simulation runs on a dedicated device
    MultiGpu,
    /// Simulation runs on a separate queue of the render device
    InterQueue,
}

/// Queues a proxy moves data between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridProxyFlushParams {
    /// Queue that simulates
    pub grid_queue: QueueId,
    /// Copy queue on the simulation device
    pub grid_copy_queue: QueueId,
    /// Copy queue on the render device
    pub render_copy_queue: QueueId,
}

impl GridProxyFlushParams {
    /// Params for a topology where one queue does everything.
    #[must_use]
    pub const fn single(queue: QueueId) -> Self {
        Self {
            grid_queue: queue,
            grid_copy_queue: queue,
            render_copy_queue: queue,
        }
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    export: Arc<GridExport>,
    queue: QueueId,
    fence_value: u64,
}

/// Transport and generation gate between simulation and rendering.
#[derive(Debug)]
pub struct GridProxy {
    kind: GridProxyType,
    resolved: SwapBuffer<Arc<GridExport>>,
    staged: Option<Arc<GridExport>>,
    in_flight: Option<InFlight>,
    pushes: u64,
    superseded: u64,
}

impl GridProxy {
    /// Creates a proxy whose render side starts at `initial`.
    #[must_use]
    pub fn new(kind: GridProxyType, initial: Arc<GridExport>) -> Self {
        debug!("Creating {:?} proxy for {}", kind, initial.grid());
        Self {
            kind,
            resolved: SwapBuffer::new(Arc::clone(&initial), initial),
            staged: None,
            in_flight: None,
            pushes: 0,
            superseded: 0,
        }
    }

    /// Proxy variant.
    #[must_use]
    pub const fn kind(&self) -> GridProxyType {
        self.kind
    }

    /// Hands a new generation to the proxy. Call at most once per substep.
    pub fn push(&mut self, export: Arc<GridExport>, queues: &mut QueueSet, params: &GridProxyFlushParams) {
        self.pushes += 1;
        match self.kind {
            GridProxyType::PassThrough => {
                *self.resolved.front_mut() = export;
            }
            GridProxyType::MultiGpu | GridProxyType::InterQueue => {
                if self.kind == GridProxyType::MultiGpu {
                    queues.record(
                        params.grid_copy_queue,
                        GpuCommand::ExportCopy {
                            grid: export.grid(),
                            version: export.version(),
                            blocks: export.num_blocks(GridTextureChannel::Velocity)
                                + export.num_blocks(GridTextureChannel::Density),
                        },
                    );
                }
                if let Some(old) = self.staged.replace(export) {
                    debug!("{} v{} superseded before flush", old.grid(), old.version());
                    self.superseded += 1;
                }
            }
        }
    }

    /// Resolves completed transfers and starts the next one.
    ///
    /// Idempotent when nothing is pending.
    pub fn flush(&mut self, queues: &mut QueueSet, params: &GridProxyFlushParams) {
        if self.kind == GridProxyType::PassThrough {
            return;
        }

        if let Some(transfer) = self.in_flight.take() {
            let done = queues
                .get(transfer.queue)
                .map_or(true, |q| q.is_fence_complete(transfer.fence_value));
            if done {
                debug!(
                    "{} v{} visible to render ({:?})",
                    transfer.export.grid(),
                    transfer.export.version(),
                    self.kind
                );
                let mut generation = self.resolved.begin();
                *generation.write() = transfer.export;
                generation.commit();
            } else {
                self.in_flight = Some(transfer);
            }
        }

        if self.in_flight.is_some() {
            return;
        }
        let Some(export) = self.staged.take() else {
            return;
        };
        let gate = match self.kind {
            GridProxyType::MultiGpu => {
                queues.request_flush(params.grid_copy_queue);
                params.render_copy_queue
            }
            _ => params.grid_queue,
        };
        queues.request_flush(gate);
        let fence_value = queues.status(gate).next_fence_value;
        self.in_flight = Some(InFlight {
            export,
            queue: gate,
            fence_value,
        });
    }

    /// The latest generation visible to the render side. Never blocks.
    #[must_use]
    pub fn get_grid_export(&self) -> &Arc<GridExport> {
        self.resolved.read()
    }

    /// Transfers pushed but not yet visible: staged plus in flight.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        usize::from(self.staged.is_some()) + usize::from(self.in_flight.is_some())
    }

    /// Fence of the transfer in flight, if any.
    #[must_use]
    pub fn pending_fence(&self) -> Option<(QueueId, u64)> {
        self.in_flight.as_ref().map(|t| (t.queue, t.fence_value))
    }

    /// Pushes received.
    #[must_use]
    pub const fn pushes(&self) -> u64 {
        self.pushes
    }

    /// Staged generations replaced by a newer push before they were flushed.
    #[must_use]
    pub const fn superseded(&self) -> u64 {
        self.superseded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HostBackend, QueueKind};
    use crate::device::DeviceQueue;
    use crate::grid::GridId;
    use crate::software::{FenceCompletion, SoftwareHost, SoftwareHostDesc};
    use glam::{UVec3, Vec3};
    use plume_common::GridSpace;

    fn export(version: u64) -> Arc<GridExport> {
        let space = GridSpace::new(Vec3::ZERO, Vec3::ONE, UVec3::splat(32));
        Arc::new(GridExport::new(GridId::from_raw(1), version, space, 8, Vec::new(), Vec::new()))
    }

    fn setup() -> (SoftwareHost, QueueSet, GridProxyFlushParams) {
        let host = SoftwareHost::new(SoftwareHostDesc {
            completion: FenceCompletion::Manual,
            ..SoftwareHostDesc::default()
        });
        let mut queues = QueueSet::new();
        let grid = queues.insert(DeviceQueue::new("grid", QueueKind::Graphics, false, host.render_queue()));
        let copy = queues.insert(DeviceQueue::new("copy", QueueKind::Copy, false, host.render_queue()));
        let params = GridProxyFlushParams {
            grid_queue: grid,
            grid_copy_queue: copy,
            render_copy_queue: copy,
        };
        (host, queues, params)
    }

    fn flush_requested(queues: &mut QueueSet, params: &GridProxyFlushParams) {
        for id in [params.grid_queue, params.render_copy_queue] {
            if let Some(queue) = queues.get_mut(id) {
                queue.conditional_flush();
            }
        }
    }

    fn refresh(queues: &mut QueueSet, params: &GridProxyFlushParams) {
        for id in [params.grid_queue, params.render_copy_queue] {
            if let Some(queue) = queues.get_mut(id) {
                queue.update_context();
            }
        }
    }

    #[test]
    fn test_pass_through_is_live() {
        let (_host, mut queues, params) = setup();
        let mut proxy = GridProxy::new(GridProxyType::PassThrough, export(0));
        proxy.push(export(1), &mut queues, &params);
        assert_eq!(proxy.get_grid_export().version(), 1);
        proxy.flush(&mut queues, &params);
        assert_eq!(proxy.get_grid_export().version(), 1);
        assert_eq!(proxy.outstanding(), 0);
    }

    #[test]
    fn test_push_without_flush_keeps_previous_generation() {
        for kind in [GridProxyType::MultiGpu, GridProxyType::InterQueue] {
            let (_host, mut queues, params) = setup();
            let mut proxy = GridProxy::new(kind, export(5));
            proxy.push(export(6), &mut queues, &params);
            proxy.push(export(7), &mut queues, &params);
            assert_eq!(proxy.get_grid_export().version(), 5);
            assert_eq!(proxy.outstanding(), 1);
            assert_eq!(proxy.superseded(), 1);
        }
    }

    #[test]
    fn test_flip_waits_for_fence() {
        let (host, mut queues, params) = setup();
        let mut proxy = GridProxy::new(GridProxyType::MultiGpu, export(0));
        proxy.push(export(1), &mut queues, &params);
        proxy.flush(&mut queues, &params);
        flush_requested(&mut queues, &params);
        assert_eq!(proxy.outstanding(), 1);

        refresh(&mut queues, &params);
        proxy.flush(&mut queues, &params);
        assert_eq!(proxy.get_grid_export().version(), 0);

        host.complete_all();
        refresh(&mut queues, &params);
        proxy.flush(&mut queues, &params);
        assert_eq!(proxy.get_grid_export().version(), 1);
        assert_eq!(proxy.outstanding(), 0);

        // Nothing pending: repeated flushes change nothing.
        proxy.flush(&mut queues, &params);
        proxy.flush(&mut queues, &params);
        assert_eq!(proxy.get_grid_export().version(), 1);
    }

    #[test]
    fn test_multi_gpu_records_copy() {
        let (_host, mut queues, params) = setup();
        let mut proxy = GridProxy::new(GridProxyType::MultiGpu, export(0));
        proxy.push(export(1), &mut queues, &params);
        let copy = queues.get(params.grid_copy_queue).expect("copy queue");
        assert!(matches!(copy.recorded(), [GpuCommand::ExportCopy { version: 1, .. }]));
    }

    #[test]
    fn test_outstanding_stays_bounded() {
        let (host, mut queues, params) = setup();
        let mut proxy = GridProxy::new(GridProxyType::InterQueue, export(0));
        for version in 1..50 {
            proxy.push(export(version), &mut queues, &params);
            assert!(proxy.outstanding() <= 2);
            proxy.flush(&mut queues, &params);
            flush_requested(&mut queues, &params);
            if version % 3 == 0 {
                host.complete_all();
            }
            refresh(&mut queues, &params);
        }
        assert!(proxy.get_grid_export().version() > 0);
    }
}
