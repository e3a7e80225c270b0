//! Devices and device queues.
//!
//! A [`DeviceQueue`] wraps one native queue together with its fence
//! bookkeeping and the commands recorded for its next submission. Fence
//! values start at 1; a queue that has never submitted reports 0 completed
//! and 0 frames in flight.

use std::sync::Arc;

use plume_common::{Arena, DeviceError, Handle};
use tracing::{debug, info};

use crate::backend::{DeviceBackend, DeviceMode, GpuCommand, HostBackend, QueueBackend, QueueKind, Submission};

/// Fence and backpressure status of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    /// Submitted units of work not yet complete on the GPU
    pub frames_in_flight: u32,
    /// Highest completed fence value
    pub last_fence_completed: u64,
    /// Fence value the next flush will signal
    pub next_fence_value: u64,
}

/// A native queue plus its fence counter and pending recording.
#[derive(Debug)]
pub struct DeviceQueue {
    label: String,
    kind: QueueKind,
    low_latency: bool,
    backend: Arc<dyn QueueBackend>,
    recorded: Vec<GpuCommand>,
    flush_requested: bool,
    last_fence_completed: u64,
    next_fence_value: u64,
    submissions: u64,
}

impl DeviceQueue {
    /// Wraps an existing native queue.
    pub fn new(label: impl Into<String>, kind: QueueKind, low_latency: bool, backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            label: label.into(),
            kind,
            low_latency,
            backend,
            recorded: Vec::new(),
            flush_requested: false,
            last_fence_completed: 0,
            next_fence_value: 1,
            submissions: 0,
        }
    }

    /// Creates a queue on `device`. No GPU work is submitted.
    pub fn create(device: &Device, kind: QueueKind, low_latency: bool) -> Result<Self, DeviceError> {
        let backend = device.backend.create_queue(kind, low_latency)?;
        let label = format!("{} {}", device.name(), kind.name());
        info!("Created {} queue on {} (low latency: {})", kind.name(), device.name(), low_latency);
        Ok(Self::new(label, kind, low_latency, backend))
    }

    /// Queue label for logs.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queue kind.
    #[must_use]
    pub const fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Whether the queue was created for low-latency submission.
    #[must_use]
    pub const fn low_latency(&self) -> bool {
        self.low_latency
    }

    /// Refreshes fence bookkeeping from the backend.
    ///
    /// Call once per host frame before any submission decision.
    pub fn update_context(&mut self) -> QueueStatus {
        let submitted = self.next_fence_value - 1;
        let completed = self.backend.completed_fence().min(submitted);
        self.last_fence_completed = self.last_fence_completed.max(completed);
        self.status()
    }

    /// Status as of the last [`Self::update_context`].
    #[must_use]
    pub const fn status(&self) -> QueueStatus {
        QueueStatus {
            frames_in_flight: (self.next_fence_value - 1 - self.last_fence_completed) as u32,
            last_fence_completed: self.last_fence_completed,
            next_fence_value: self.next_fence_value,
        }
    }

    /// Returns true once `fence_value` is known complete.
    #[must_use]
    pub const fn is_fence_complete(&self, fence_value: u64) -> bool {
        fence_value <= self.last_fence_completed
    }

    /// Appends a command to the next submission.
    pub fn record(&mut self, command: GpuCommand) {
        self.recorded.push(command);
    }

    /// Commands recorded since the last flush.
    #[must_use]
    pub fn recorded(&self) -> &[GpuCommand] {
        &self.recorded
    }

    /// Sets the sticky flush request honored by [`Self::conditional_flush`].
    pub fn request_flush(&mut self) {
        self.flush_requested = true;
    }

    /// Whether a flush has been requested since the last flush.
    #[must_use]
    pub const fn flush_requested(&self) -> bool {
        self.flush_requested
    }

    /// Submits all recorded work and advances the fence counter.
    ///
    /// Returns the fence value the submission will signal.
    pub fn flush(&mut self) -> u64 {
        let fence_value = self.next_fence_value;
        let commands = std::mem::take(&mut self.recorded);
        debug!("Flushing {} ({} commands, fence {})", self.label, commands.len(), fence_value);
        self.backend.submit(Submission { fence_value, commands });
        self.next_fence_value += 1;
        self.flush_requested = false;
        self.submissions += 1;
        fence_value
    }

    /// Flushes only if a flush was requested.
    pub fn conditional_flush(&mut self) -> Option<u64> {
        if self.flush_requested {
            Some(self.flush())
        } else {
            None
        }
    }

    /// Flushes only if work was recorded. Used to hand work back to the host queue.
    pub fn flush_recorded(&mut self) -> Option<u64> {
        if self.recorded.is_empty() {
            None
        } else {
            Some(self.flush())
        }
    }

    /// Blocks until `fence_value` completes. Teardown only.
    pub fn wait_on_fence(&mut self, fence_value: u64) {
        if self.is_fence_complete(fence_value) {
            return;
        }
        debug!("Waiting on {} fence {}", self.label, fence_value);
        self.backend.wait_for_fence(fence_value);
        self.update_context();
    }

    /// Blocks until everything submitted so far completes. Teardown only.
    pub fn wait_idle(&mut self) {
        let submitted = self.next_fence_value - 1;
        if submitted > 0 {
            self.wait_on_fence(submitted);
        }
    }

    /// Number of submissions made through this queue.
    #[must_use]
    pub const fn submissions(&self) -> u64 {
        self.submissions
    }
}

/// Stable handle to a queue in a [`QueueSet`].
pub type QueueId = Handle<DeviceQueue>;

/// All queues owned by one context, addressed by generation-tagged handles.
#[derive(Debug, Default)]
pub struct QueueSet {
    queues: Arena<DeviceQueue>,
}

impl QueueSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a queue.
    pub fn insert(&mut self, queue: DeviceQueue) -> QueueId {
        self.queues.insert(queue)
    }

    /// Removes a queue, returning it.
    pub fn remove(&mut self, id: QueueId) -> Option<DeviceQueue> {
        self.queues.remove(id)
    }

    /// Borrows a queue.
    #[must_use]
    pub fn get(&self, id: QueueId) -> Option<&DeviceQueue> {
        self.queues.get(id)
    }

    /// Mutably borrows a queue.
    pub fn get_mut(&mut self, id: QueueId) -> Option<&mut DeviceQueue> {
        self.queues.get_mut(id)
    }

    /// Records a command on a queue, ignoring stale handles.
    pub fn record(&mut self, id: QueueId, command: GpuCommand) {
        if let Some(queue) = self.queues.get_mut(id) {
            queue.record(command);
        }
    }

    /// Sets the flush request on a queue, ignoring stale handles.
    pub fn request_flush(&mut self, id: QueueId) {
        if let Some(queue) = self.queues.get_mut(id) {
            queue.request_flush();
        }
    }

    /// Status of a queue; default for stale handles.
    #[must_use]
    pub fn status(&self, id: QueueId) -> QueueStatus {
        self.queues.get(id).map(DeviceQueue::status).unwrap_or_default()
    }

    /// Number of queues.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.queues.len()
    }

    /// Returns true if no queues exist.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

/// A physical device shared by one or more queues.
#[derive(Debug, Clone)]
pub struct Device {
    mode: DeviceMode,
    backend: Arc<dyn DeviceBackend>,
}

impl Device {
    /// Creates a device in the given mode.
    ///
    /// Proxy mode wraps the host's device; unique mode acquires a dedicated one.
    pub fn create(host: &dyn HostBackend, mode: DeviceMode) -> Result<Self, DeviceError> {
        let backend = match mode {
            DeviceMode::Proxy => host.render_device(),
            DeviceMode::Unique => {
                if !host.dedicated_device_available() {
                    return Err(DeviceError::AdapterUnavailable("no second device".into()));
                }
                host.create_dedicated_device()?
            }
        };
        info!("Created {:?} device on {}", mode, backend.name());
        Ok(Self { mode, backend })
    }

    /// Device mode.
    #[must_use]
    pub const fn mode(&self) -> DeviceMode {
        self.mode
    }

    /// Adapter name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.backend.name()
    }

    /// Creates a queue on this device.
    pub fn create_queue(&self, kind: QueueKind, low_latency: bool) -> Result<DeviceQueue, DeviceError> {
        DeviceQueue::create(self, kind, low_latency)
    }
}
