//! Deterministic software host.
//!
//! Stands in for a real graphics binding in headless runs and tests. Every
//! queue logs what it receives, and fence completion is either immediate or
//! driven explicitly by the caller, so backpressure and proxy resolution can
//! be exercised frame by frame.

use std::sync::Arc;

use parking_lot::Mutex;
use plume_common::DeviceError;
use tracing::debug;

use crate::backend::{DeviceBackend, GpuCommand, HostBackend, QueueBackend, QueueKind, Submission};

/// When submitted work completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FenceCompletion {
    /// Work completes as soon as it is submitted
    #[default]
    Immediate,
    /// Work completes only through [`SoftwareHost::complete_through`] and friends
    Manual,
}

/// Capabilities of a software host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SoftwareHostDesc {
    /// Expose a second device for multi-GPU simulation
    pub dedicated_device: bool,
    /// Expose an independent compute queue on the host device
    pub dedicated_queue: bool,
    /// Fence completion mode for every queue
    pub completion: FenceCompletion,
}

#[derive(Debug, Default)]
struct QueueLog {
    submissions: Vec<Submission>,
    completed: u64,
    submitted: u64,
}

/// One software queue.
#[derive(Debug)]
pub struct SoftwareQueue {
    label: String,
    kind: QueueKind,
    completion: FenceCompletion,
    log: Mutex<QueueLog>,
}

impl SoftwareQueue {
    fn new(label: String, kind: QueueKind, completion: FenceCompletion) -> Self {
        Self {
            label,
            kind,
            completion,
            log: Mutex::new(QueueLog::default()),
        }
    }

    /// Queue label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queue kind.
    #[must_use]
    pub const fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Marks every submission up to `fence_value` complete.
    pub fn complete_through(&self, fence_value: u64) {
        let mut log = self.log.lock();
        log.completed = log.completed.max(fence_value.min(log.submitted));
    }

    /// Marks everything submitted so far complete.
    pub fn complete_all(&self) {
        let mut log = self.log.lock();
        log.completed = log.submitted;
    }

    /// Number of submissions received.
    #[must_use]
    pub fn submission_count(&self) -> usize {
        self.log.lock().submissions.len()
    }

    /// Copies of every command received, in submission order.
    #[must_use]
    pub fn commands(&self) -> Vec<GpuCommand> {
        let log = self.log.lock();
        log.submissions.iter().flat_map(|s| s.commands.iter().cloned()).collect()
    }
}

impl QueueBackend for SoftwareQueue {
    fn submit(&self, submission: Submission) {
        let mut log = self.log.lock();
        log.submitted = log.submitted.max(submission.fence_value);
        if self.completion == FenceCompletion::Immediate {
            log.completed = log.submitted;
        }
        debug!("{}: fence {} ({} commands)", self.label, submission.fence_value, submission.commands.len());
        log.submissions.push(submission);
    }

    fn completed_fence(&self) -> u64 {
        self.log.lock().completed
    }

    fn wait_for_fence(&self, fence_value: u64) {
        // The software GPU drains instantly once someone waits on it.
        self.complete_through(fence_value);
    }
}

#[derive(Debug)]
struct HostShared {
    completion: FenceCompletion,
    dedicated_queue: bool,
    queues: Mutex<Vec<Arc<SoftwareQueue>>>,
}

impl HostShared {
    fn create_queue(&self, label: String, kind: QueueKind) -> Arc<SoftwareQueue> {
        let queue = Arc::new(SoftwareQueue::new(label, kind, self.completion));
        self.queues.lock().push(Arc::clone(&queue));
        queue
    }
}

/// One software device.
#[derive(Debug)]
pub struct SoftwareDevice {
    name: String,
    compute_queue: bool,
    shared: Arc<HostShared>,
}

impl DeviceBackend for SoftwareDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_queue(&self, kind: QueueKind, _low_latency: bool) -> Result<Arc<dyn QueueBackend>, DeviceError> {
        if kind == QueueKind::Compute && !self.compute_queue {
            return Err(DeviceError::UnsupportedQueue(kind.name()));
        }
        let label = format!("{} {}", self.name, kind.name());
        Ok(self.shared.create_queue(label, kind))
    }
}

/// Software host with a configurable set of devices and queues.
#[derive(Debug, Clone)]
pub struct SoftwareHost {
    desc: SoftwareHostDesc,
    shared: Arc<HostShared>,
    render_device: Arc<SoftwareDevice>,
    render_queue: Arc<SoftwareQueue>,
}

impl SoftwareHost {
    /// Creates a host with the given capabilities.
    #[must_use]
    pub fn new(desc: SoftwareHostDesc) -> Self {
        let shared = Arc::new(HostShared {
            completion: desc.completion,
            dedicated_queue: desc.dedicated_queue,
            queues: Mutex::new(Vec::new()),
        });
        let render_device = Arc::new(SoftwareDevice {
            name: "software:0".into(),
            compute_queue: desc.dedicated_queue,
            shared: Arc::clone(&shared),
        });
        let render_queue = shared.create_queue("host graphics".into(), QueueKind::Graphics);
        Self {
            desc,
            shared,
            render_device,
            render_queue,
        }
    }

    /// Host capabilities.
    #[must_use]
    pub const fn desc(&self) -> SoftwareHostDesc {
        self.desc
    }

    /// Every queue created so far, host queue first.
    #[must_use]
    pub fn queues(&self) -> Vec<Arc<SoftwareQueue>> {
        self.shared.queues.lock().clone()
    }

    /// The host's own graphics queue.
    #[must_use]
    pub fn host_queue(&self) -> Arc<SoftwareQueue> {
        Arc::clone(&self.render_queue)
    }

    /// Completes work through `fence_value` on every queue.
    pub fn complete_through(&self, fence_value: u64) {
        for queue in self.shared.queues.lock().iter() {
            queue.complete_through(fence_value);
        }
    }

    /// Completes all submitted work on every queue.
    pub fn complete_all(&self) {
        for queue in self.shared.queues.lock().iter() {
            queue.complete_all();
        }
    }

    /// Total submissions across every queue.
    #[must_use]
    pub fn submission_count(&self) -> usize {
        self.shared.queues.lock().iter().map(|q| q.submission_count()).sum()
    }

    /// Every submitted command across all queues, queue by queue.
    #[must_use]
    pub fn submitted_commands(&self) -> Vec<GpuCommand> {
        self.shared.queues.lock().iter().flat_map(|q| q.commands()).collect()
    }
}

impl HostBackend for SoftwareHost {
    fn render_queue(&self) -> Arc<dyn QueueBackend> {
        self.render_queue.clone()
    }

    fn render_device(&self) -> Arc<dyn DeviceBackend> {
        self.render_device.clone()
    }

    fn dedicated_device_available(&self) -> bool {
        self.desc.dedicated_device
    }

    fn dedicated_device_queue_available(&self) -> bool {
        self.shared.dedicated_queue
    }

    fn create_dedicated_device(&self) -> Result<Arc<dyn DeviceBackend>, DeviceError> {
        if !self.desc.dedicated_device {
            return Err(DeviceError::AdapterUnavailable("software host has one device".into()));
        }
        Ok(Arc::new(SoftwareDevice {
            name: "software:1".into(),
            compute_queue: true,
            shared: Arc::clone(&self.shared),
        }))
    }
}
