//! Device topology of a context.
//!
//! Every context starts with the host's graphics queue. When the
//! configuration allows it, extra queues are created once and shared by
//! every scene:
//!
//! | topology      | device                  | queues                    |
//! |---------------|-------------------------|---------------------------|
//! | any dedicated | host device (proxy)     | render copy               |
//! | async compute | host device (proxy)     | render compute            |
//! | multi-GPU     | second device (unique)  | grid graphics, grid copy  |
//!
//! Creation failures are logged and leave the context on the simpler
//! topology; they are never reported to the caller.

use plume_common::DeviceError;
use plume_kernel::{
    Device, DeviceMode, DeviceQueue, GridProxyFlushParams, GridProxyType, HostBackend, QueueId, QueueKind, QueueSet,
};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::properties::Properties;

/// Queues one scene simulates and renders on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneQueues {
    /// Transport between the grid and render queues
    pub proxy_type: GridProxyType,
    /// Queues the proxy moves data between
    pub params: GridProxyFlushParams,
    /// Host queue render passes land on
    pub render_queue: QueueId,
}

impl SceneQueues {
    /// Everything on the host queue.
    #[must_use]
    pub const fn pass_through(render_queue: QueueId) -> Self {
        Self {
            proxy_type: GridProxyType::PassThrough,
            params: GridProxyFlushParams::single(render_queue),
            render_queue,
        }
    }
}

/// Devices and shared queues of a context.
#[derive(Debug)]
pub struct DeviceTopology {
    multi_gpu_supported: bool,
    async_compute_supported: bool,
    multi_gpu_active: bool,
    async_compute_active: bool,

    render_queue: QueueId,
    render_device: Option<Device>,
    render_copy_queue: Option<QueueId>,
    render_compute_queue: Option<QueueId>,

    grid_device: Option<Device>,
    grid_queue: Option<QueueId>,
    grid_copy_queue: Option<QueueId>,

    frames_in_flight_multi_gpu: u32,
    frames_in_flight_async_compute: u32,
}

impl DeviceTopology {
    /// Wraps the host queue and probes what the host could offer.
    pub fn new(host: &dyn HostBackend, queues: &mut QueueSet) -> Self {
        let render_queue = queues.insert(DeviceQueue::new(
            "host graphics",
            QueueKind::Graphics,
            false,
            host.render_queue(),
        ));
        let multi_gpu_supported = host.dedicated_device_available();
        let async_compute_supported = host.dedicated_device_queue_available();
        info!(
            "Device probe: dedicated device {}, dedicated compute queue {}",
            multi_gpu_supported, async_compute_supported
        );
        Self {
            multi_gpu_supported,
            async_compute_supported,
            multi_gpu_active: false,
            async_compute_active: false,
            render_queue,
            render_device: None,
            render_copy_queue: None,
            render_compute_queue: None,
            grid_device: None,
            grid_queue: None,
            grid_copy_queue: None,
            frames_in_flight_multi_gpu: 0,
            frames_in_flight_async_compute: 0,
        }
    }

    /// Activates the dedicated topologies the configuration allows and
    /// creates their queues. Already active topologies are left alone.
    pub fn conditional_init(&mut self, host: &dyn HostBackend, queues: &mut QueueSet, config: &EngineConfig) {
        if !self.multi_gpu_active {
            self.multi_gpu_active = self.multi_gpu_supported && config.multi_gpu_allowed();
        }
        if !self.async_compute_active {
            self.async_compute_active = self.async_compute_supported && config.async_compute_allowed();
        }
        if !self.multi_gpu_active && !self.async_compute_active {
            return;
        }

        if self.render_device.is_none() {
            match create_device_queues(host, DeviceMode::Proxy, &[(QueueKind::Copy, false)]) {
                Ok((device, created)) => {
                    self.render_copy_queue = created.into_iter().next().map(|q| queues.insert(q));
                    self.render_device = Some(device);
                },
                Err(e) => {
                    warn!("Proxy device unavailable, staying on the host queue: {e}");
                    self.disable_all();
                    return;
                },
            }
        }

        if self.async_compute_active && self.render_compute_queue.is_none() {
            let created = self
                .render_device
                .as_ref()
                .map(|d| d.create_queue(QueueKind::Compute, true));
            match created {
                Some(Ok(queue)) => self.render_compute_queue = Some(queues.insert(queue)),
                Some(Err(e)) => {
                    warn!("Async compute unavailable: {e}");
                    self.async_compute_supported = false;
                    self.async_compute_active = false;
                },
                None => self.async_compute_active = false,
            }
        }

        if self.multi_gpu_active && self.grid_device.is_none() {
            match create_device_queues(
                host,
                DeviceMode::Unique,
                &[(QueueKind::Graphics, false), (QueueKind::Copy, false)],
            ) {
                Ok((device, created)) => {
                    let mut ids = created.into_iter().map(|q| queues.insert(q));
                    self.grid_queue = ids.next();
                    self.grid_copy_queue = ids.next();
                    self.grid_device = Some(device);
                    if let Some(queue) = self.grid_queue.and_then(|id| queues.get_mut(id)) {
                        self.frames_in_flight_multi_gpu = queue.update_context().frames_in_flight;
                    }
                },
                Err(e) => {
                    warn!("Dedicated simulation device unavailable: {e}");
                    self.multi_gpu_supported = false;
                    self.multi_gpu_active = false;
                },
            }
        }
    }

    /// Probes the host again, forgetting earlier creation failures.
    pub fn reprobe(&mut self, host: &dyn HostBackend) {
        self.multi_gpu_supported = host.dedicated_device_available();
        self.async_compute_supported = host.dedicated_device_queue_available();
        debug!(
            "Device re-probe: dedicated device {}, dedicated compute queue {}",
            self.multi_gpu_supported, self.async_compute_supported
        );
    }

    fn disable_all(&mut self) {
        self.multi_gpu_supported = false;
        self.async_compute_supported = false;
        self.multi_gpu_active = false;
        self.async_compute_active = false;
    }

    /// Refreshes fence status of every queue. Call once per frame before
    /// any scene decides whether to simulate.
    pub fn interop_begin(&mut self, queues: &mut QueueSet) {
        if let Some(queue) = queues.get_mut(self.render_queue) {
            queue.update_context();
        }
        if let Some(queue) = self.grid_queue.and_then(|id| queues.get_mut(id)) {
            self.frames_in_flight_multi_gpu = queue.update_context().frames_in_flight;
        }
        for id in [self.grid_copy_queue, self.render_copy_queue].into_iter().flatten() {
            if let Some(queue) = queues.get_mut(id) {
                queue.update_context();
            }
        }
        if let Some(queue) = self.render_compute_queue.and_then(|id| queues.get_mut(id)) {
            self.frames_in_flight_async_compute = queue.update_context().frames_in_flight;
        }
    }

    /// Submits the frame's work.
    ///
    /// With `compute_only`, dedicated queues flush when a flush was
    /// requested; `should_flush` requests one on the simulation queues for
    /// every scene at once. Work recorded on the host queue is always handed
    /// back. Returns the number of submissions made.
    pub fn interop_end(&mut self, queues: &mut QueueSet, compute_only: bool, should_flush: bool) -> u32 {
        let mut submissions = 0;
        if compute_only {
            if should_flush {
                for id in [self.grid_queue, self.render_compute_queue].into_iter().flatten() {
                    queues.request_flush(id);
                }
            }
            let dedicated = [
                self.grid_queue,
                self.grid_copy_queue,
                self.render_copy_queue,
                self.render_compute_queue,
            ];
            for id in dedicated.into_iter().flatten() {
                if queues.get_mut(id).and_then(DeviceQueue::conditional_flush).is_some() {
                    submissions += 1;
                }
            }
        }
        if queues
            .get_mut(self.render_queue)
            .and_then(DeviceQueue::flush_recorded)
            .is_some()
        {
            submissions += 1;
        }
        submissions
    }

    /// Picks the queues for a new scene.
    ///
    /// Grids opt into multi-GPU or async compute through their snapshot;
    /// configuration levels above one override the opt-in. Async compute is
    /// only used when multi-GPU is not, unless its level is above two and
    /// greater than the multi-GPU level.
    #[must_use]
    pub fn select(&self, props: &Properties, config: &EngineConfig) -> SceneQueues {
        let mut multi_gpu = props.multi_adapter_enabled && self.multi_gpu_active;
        let mut async_compute = !multi_gpu && props.async_compute_enabled && self.async_compute_active;
        if config.multi_gpu > 1 {
            multi_gpu = self.multi_gpu_active;
        }
        if config.async_compute > 1 {
            async_compute = !multi_gpu && self.async_compute_active;
        }
        if config.async_compute > 2 && config.async_compute > config.multi_gpu {
            multi_gpu = false;
            async_compute = self.async_compute_active;
        }

        if multi_gpu {
            if let (Some(grid_queue), Some(grid_copy_queue), Some(render_copy_queue)) =
                (self.grid_queue, self.grid_copy_queue, self.render_copy_queue)
            {
                return SceneQueues {
                    proxy_type: GridProxyType::MultiGpu,
                    params: GridProxyFlushParams {
                        grid_queue,
                        grid_copy_queue,
                        render_copy_queue,
                    },
                    render_queue: self.render_queue,
                };
            }
            debug!("Multi-GPU queues missing for '{}', using pass-through", props.name);
        } else if async_compute {
            if let (Some(compute), Some(render_copy_queue)) = (self.render_compute_queue, self.render_copy_queue) {
                return SceneQueues {
                    proxy_type: GridProxyType::InterQueue,
                    params: GridProxyFlushParams {
                        grid_queue: compute,
                        grid_copy_queue: render_copy_queue,
                        render_copy_queue,
                    },
                    render_queue: self.render_queue,
                };
            }
            debug!("Async compute queue missing for '{}', using pass-through", props.name);
        }
        SceneQueues::pass_through(self.render_queue)
    }

    /// Waits for the dedicated queues to drain and drops them with their
    /// devices. The only blocking wait of a context.
    pub fn release(&mut self, queues: &mut QueueSet) {
        let dedicated = [
            self.grid_queue.take(),
            self.grid_copy_queue.take(),
            self.render_copy_queue.take(),
            self.render_compute_queue.take(),
        ];
        for id in dedicated.into_iter().flatten() {
            if let Some(mut queue) = queues.remove(id) {
                queue.wait_idle();
                debug!("Released {}", queue.label());
            }
        }
        let grid_device = self.grid_device.take();
        let render_device = self.render_device.take();
        if grid_device.is_some() || render_device.is_some() {
            info!("Released dedicated devices");
        }
        self.multi_gpu_active = false;
        self.async_compute_active = false;
    }

    /// Host graphics queue.
    #[must_use]
    pub const fn render_queue(&self) -> QueueId {
        self.render_queue
    }

    /// Whether a second device is simulating.
    #[must_use]
    pub const fn multi_gpu_active(&self) -> bool {
        self.multi_gpu_active
    }

    /// Whether the async compute queue is in use.
    #[must_use]
    pub const fn async_compute_active(&self) -> bool {
        self.async_compute_active
    }

    /// Incomplete submissions on the dedicated device's graphics queue.
    #[must_use]
    pub const fn frames_in_flight_multi_gpu(&self) -> u32 {
        self.frames_in_flight_multi_gpu
    }

    /// Incomplete submissions on the async compute queue.
    #[must_use]
    pub const fn frames_in_flight_async_compute(&self) -> u32 {
        self.frames_in_flight_async_compute
    }
}

/// Creates a device and the listed queues on it.
fn create_device_queues(
    host: &dyn HostBackend,
    mode: DeviceMode,
    kinds: &[(QueueKind, bool)],
) -> Result<(Device, Vec<DeviceQueue>), DeviceError> {
    let device = Device::create(host, mode)?;
    let queues = kinds
        .iter()
        .map(|&(kind, low_latency)| device.create_queue(kind, low_latency))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((device, queues))
}

#[cfg(test)]
mod tests {
    use super::*;
    use plume_kernel::{SoftwareHost, SoftwareHostDesc};

    fn host(dedicated_device: bool, dedicated_queue: bool) -> SoftwareHost {
        SoftwareHost::new(SoftwareHostDesc {
            dedicated_device,
            dedicated_queue,
            ..SoftwareHostDesc::default()
        })
    }

    fn levels(multi_gpu: u32, async_compute: u32) -> EngineConfig {
        EngineConfig {
            multi_gpu,
            async_compute,
            ..EngineConfig::default()
        }
    }

    fn opted(multi: bool, async_compute: bool) -> Properties {
        Properties {
            multi_adapter_enabled: multi,
            async_compute_enabled: async_compute,
            ..Properties::default()
        }
    }

    #[test]
    fn test_host_only_stays_pass_through() {
        let host = host(false, false);
        let mut queues = QueueSet::new();
        let mut topology = DeviceTopology::new(&host, &mut queues);
        topology.conditional_init(&host, &mut queues, &levels(2, 2));

        assert!(!topology.multi_gpu_active());
        assert!(!topology.async_compute_active());
        assert_eq!(queues.len(), 1);
        let selected = topology.select(&opted(true, true), &levels(2, 2));
        assert_eq!(selected.proxy_type, GridProxyType::PassThrough);
    }

    #[test]
    fn test_full_topology_creates_shared_queues() {
        let host = host(true, true);
        let mut queues = QueueSet::new();
        let mut topology = DeviceTopology::new(&host, &mut queues);
        topology.conditional_init(&host, &mut queues, &EngineConfig::default());

        assert!(topology.multi_gpu_active());
        assert!(topology.async_compute_active());
        // host, render copy, render compute, grid graphics, grid copy
        assert_eq!(queues.len(), 5);

        topology.conditional_init(&host, &mut queues, &EngineConfig::default());
        assert_eq!(queues.len(), 5);
    }

    #[test]
    fn test_disabled_levels_create_nothing() {
        let host = host(true, true);
        let mut queues = QueueSet::new();
        let mut topology = DeviceTopology::new(&host, &mut queues);
        topology.conditional_init(&host, &mut queues, &levels(0, 0));
        assert_eq!(queues.len(), 1);
    }

    #[test]
    fn test_selection_rules() {
        let host = host(true, true);
        let mut queues = QueueSet::new();
        let mut topology = DeviceTopology::new(&host, &mut queues);
        topology.conditional_init(&host, &mut queues, &EngineConfig::default());

        let cases = [
            (opted(false, false), levels(1, 1), GridProxyType::PassThrough),
            (opted(true, true), levels(1, 1), GridProxyType::MultiGpu),
            (opted(false, true), levels(1, 1), GridProxyType::InterQueue),
            (opted(false, false), levels(2, 1), GridProxyType::MultiGpu),
            (opted(false, false), levels(1, 2), GridProxyType::InterQueue),
            (opted(true, false), levels(1, 2), GridProxyType::MultiGpu),
            (opted(true, false), levels(1, 3), GridProxyType::InterQueue),
            (opted(true, false), levels(3, 3), GridProxyType::MultiGpu),
        ];
        for (props, config, expected) in cases {
            assert_eq!(
                topology.select(&props, &config).proxy_type,
                expected,
                "multi {} async {} with levels {}/{}",
                props.multi_adapter_enabled,
                props.async_compute_enabled,
                config.multi_gpu,
                config.async_compute
            );
        }
    }

    #[test]
    fn test_interop_end_flushes_only_requested() {
        let host = host(false, true);
        let mut queues = QueueSet::new();
        let mut topology = DeviceTopology::new(&host, &mut queues);
        topology.conditional_init(&host, &mut queues, &levels(0, 2));
        let selected = topology.select(&Properties::default(), &levels(0, 2));
        assert_eq!(selected.proxy_type, GridProxyType::InterQueue);

        topology.interop_begin(&mut queues);
        assert_eq!(topology.interop_end(&mut queues, true, false), 0);

        queues.record(
            selected.params.grid_queue,
            plume_kernel::GpuCommand::GridUpdate {
                grid: plume_kernel::GridId::from_raw(1),
                version: 1,
                dt: 0.0,
                active_blocks: 0,
                params: plume_kernel::GridParams::default(),
            },
        );
        assert_eq!(topology.interop_end(&mut queues, true, true), 1);
        assert_eq!(host.submission_count(), 1);
    }

    #[test]
    fn test_release_drops_dedicated_queues() {
        let host = host(true, true);
        let mut queues = QueueSet::new();
        let mut topology = DeviceTopology::new(&host, &mut queues);
        topology.conditional_init(&host, &mut queues, &EngineConfig::default());
        topology.release(&mut queues);

        assert_eq!(queues.len(), 1);
        assert!(!topology.multi_gpu_active());
        let selected = topology.select(&opted(true, true), &EngineConfig::default());
        assert_eq!(selected, SceneQueues::pass_through(topology.render_queue()));
    }
}
