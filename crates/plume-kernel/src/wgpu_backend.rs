//! wgpu host binding.
//!
//! Each wgpu adapter becomes one device. wgpu exposes a single queue per
//! device, so graphics and copy queues share it and no independent compute
//! queue is offered; async compute therefore falls back to pass-through.
//!
//! Commands are encoded as debug markers so GPU captures show the schedule.
//! Fence completion is tracked with `Queue::on_submitted_work_done`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use plume_common::DeviceError;
use tracing::{error, info, warn};

use crate::backend::{DeviceBackend, HostBackend, QueueBackend, QueueKind, Submission};

/// Polls allowed while waiting on a fence before giving up.
const MAX_FENCE_POLLS: u32 = 16;

/// Returns wgpu instance flags with validation enabled for debug builds.
#[must_use]
pub fn gpu_instance_flags() -> wgpu::InstanceFlags {
    if cfg!(debug_assertions) {
        info!("GPU validation layer enabled (debug build)");
        wgpu::InstanceFlags::VALIDATION | wgpu::InstanceFlags::DEBUG
    } else {
        wgpu::InstanceFlags::empty()
    }
}

/// Creates a wgpu instance with appropriate validation settings.
#[must_use]
pub fn create_validated_instance() -> wgpu::Instance {
    wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        flags: gpu_instance_flags(),
        ..Default::default()
    })
}

/// Handles wgpu device errors by logging them.
pub fn handle_device_error(error: &wgpu::Error) {
    error!("GPU device error: {error}");
}

/// One wgpu device and its only queue.
#[derive(Debug)]
pub struct WgpuDevice {
    name: String,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
}

impl WgpuDevice {
    fn request(adapter: &wgpu::Adapter) -> Result<Self, DeviceError> {
        let info = adapter.get_info();
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Plume Device"),
                ..Default::default()
            },
            None,
        ))
        .map_err(|e| DeviceError::DeviceCreation(e.to_string()))?;
        device.on_uncaptured_error(Box::new(|e: wgpu::Error| handle_device_error(&e)));
        info!("Opened wgpu device {} ({:?})", info.name, info.backend);
        Ok(Self {
            name: info.name,
            device: Arc::new(device),
            queue: Arc::new(queue),
        })
    }
}

impl DeviceBackend for WgpuDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_queue(&self, kind: QueueKind, _low_latency: bool) -> Result<Arc<dyn QueueBackend>, DeviceError> {
        if kind == QueueKind::Compute {
            return Err(DeviceError::UnsupportedQueue(kind.name()));
        }
        Ok(Arc::new(WgpuQueue::new(
            format!("{} {}", self.name, kind.name()),
            Arc::clone(&self.device),
            Arc::clone(&self.queue),
        )))
    }
}

/// A fence-tracked view of a wgpu queue.
#[derive(Debug)]
pub struct WgpuQueue {
    label: String,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    completed: Arc<AtomicU64>,
}

impl WgpuQueue {
    fn new(label: String, device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self {
            label,
            device,
            queue,
            completed: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl QueueBackend for WgpuQueue {
    fn submit(&self, submission: Submission) {
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(&self.label),
        });
        encoder.push_debug_group(&format!("fence {}", submission.fence_value));
        for command in &submission.commands {
            encoder.insert_debug_marker(&command.to_string());
        }
        encoder.pop_debug_group();
        self.queue.submit(Some(encoder.finish()));

        let completed = Arc::clone(&self.completed);
        let fence_value = submission.fence_value;
        self.queue.on_submitted_work_done(move || {
            completed.fetch_max(fence_value, Ordering::AcqRel);
        });
    }

    fn completed_fence(&self) -> u64 {
        self.device.poll(wgpu::Maintain::Poll);
        self.completed.load(Ordering::Acquire)
    }

    fn wait_for_fence(&self, fence_value: u64) {
        for _ in 0..MAX_FENCE_POLLS {
            if self.completed.load(Ordering::Acquire) >= fence_value {
                return;
            }
            self.device.poll(wgpu::Maintain::Wait);
        }
        warn!("{}: fence {} did not signal", self.label, fence_value);
    }
}

/// Host binding over the adapters wgpu can see.
#[derive(Debug)]
pub struct WgpuHost {
    instance: wgpu::Instance,
    render: Arc<WgpuDevice>,
    render_queue: Arc<dyn QueueBackend>,
    render_adapter: wgpu::AdapterInfo,
}

impl WgpuHost {
    /// Opens the default adapter as the host device.
    pub fn new() -> Result<Self, DeviceError> {
        let instance = create_validated_instance();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| DeviceError::AdapterUnavailable("no wgpu adapter".into()))?;
        let render_adapter = adapter.get_info();
        let render = Arc::new(WgpuDevice::request(&adapter)?);
        let render_queue = render.create_queue(QueueKind::Graphics, false)?;
        Ok(Self {
            instance,
            render,
            render_queue,
            render_adapter,
        })
    }

    fn other_adapters(&self) -> Vec<wgpu::Adapter> {
        self.instance
            .enumerate_adapters(wgpu::Backends::all())
            .into_iter()
            .filter(|a| {
                let info = a.get_info();
                info.device_type != wgpu::DeviceType::Cpu
                    && (info.vendor, info.device) != (self.render_adapter.vendor, self.render_adapter.device)
            })
            .collect()
    }
}

impl HostBackend for WgpuHost {
    fn render_queue(&self) -> Arc<dyn QueueBackend> {
        Arc::clone(&self.render_queue)
    }

    fn render_device(&self) -> Arc<dyn DeviceBackend> {
        self.render.clone()
    }

    fn dedicated_device_available(&self) -> bool {
        !self.other_adapters().is_empty()
    }

    fn dedicated_device_queue_available(&self) -> bool {
        false
    }

    fn create_dedicated_device(&self) -> Result<Arc<dyn DeviceBackend>, DeviceError> {
        let adapter = self
            .other_adapters()
            .into_iter()
            .next()
            .ok_or_else(|| DeviceError::AdapterUnavailable("no second adapter".into()))?;
        Ok(Arc::new(WgpuDevice::request(&adapter)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GpuCommand;
    use crate::grid::GridId;

    fn create_test_host() -> Option<WgpuHost> {
        WgpuHost::new().ok()
    }

    #[test]
    fn test_fence_signals_after_wait() {
        let Some(host) = create_test_host() else {
            return;
        };
        let queue = host.render_queue();
        queue.submit(Submission {
            fence_value: 1,
            commands: vec![GpuCommand::ExportCopy {
                grid: GridId::from_raw(1),
                version: 1,
                blocks: 0,
            }],
        });
        queue.wait_for_fence(1);
        assert!(queue.completed_fence() >= 1);
    }

    #[test]
    fn test_no_independent_compute_queue() {
        let Some(host) = create_test_host() else {
            return;
        };
        assert!(!host.dedicated_device_queue_available());
        assert!(host.render_device().create_queue(QueueKind::Compute, false).is_err());
    }
}
