//! Typed task queue between authoring threads and the submission thread.
//!
//! Authoring threads never touch scenes directly. They record [`Task`]
//! values through a [`crate::context::ContextHandle`]; the thread that owns
//! GPU submission drains the queue and runs the tasks in the order they were
//! recorded. Tasks carry values and immutable snapshots only.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::config::EngineConfig;
use crate::particles::{GridExportParams, ParticleSimulationParams};
use crate::properties::{GridKey, Properties};
use crate::shadow::LightEnvironment;

/// The snapshot one grid presents for a frame.
#[derive(Debug, Clone)]
pub struct GridSnapshot {
    /// Grid identity
    pub key: GridKey,
    /// Latest configuration
    pub properties: Arc<Properties>,
}

impl GridSnapshot {
    /// Pairs a key with its snapshot.
    #[must_use]
    pub fn new(key: GridKey, properties: Arc<Properties>) -> Self {
        Self { key, properties }
    }
}

/// Everything needed to simulate one frame.
#[derive(Debug, Clone, Default)]
pub struct FrameTask {
    /// Every grid present this frame
    pub grids: Vec<GridSnapshot>,
    /// Lights that may shadow grids
    pub lights: LightEnvironment,
}

/// Work recorded for the submission thread.
#[derive(Debug)]
pub enum Task {
    /// Replace the engine configuration
    UpdateConfig(Arc<EngineConfig>),
    /// Simulate every grid and update their render views
    SimulateFrame(FrameTask),
    /// Record the color pass of one grid
    RenderGrid(GridKey),
    /// Record depth passes of every grid that generates depth
    PreComposite,
    /// Collect grid exports for a particle system and queue its particles
    QueryGridExports {
        /// The particle system
        particles: ParticleSimulationParams,
        /// Most exports returned
        max_count: usize,
        /// Where the exports are sent
        reply: Sender<Vec<GridExportParams>>,
    },
    /// Release the scene of a grid
    ReleaseGrid(GridKey),
}

impl Task {
    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::UpdateConfig(_) => "update config",
            Self::SimulateFrame(_) => "simulate frame",
            Self::RenderGrid(_) => "render grid",
            Self::PreComposite => "pre-composite",
            Self::QueryGridExports { .. } => "query grid exports",
            Self::ReleaseGrid(_) => "release grid",
        }
    }
}

/// Multi-producer, single-consumer task queue.
#[derive(Debug)]
pub struct TaskQueue {
    /// Cloned into every handle
    sender: Sender<Task>,
    /// Drained by the submission thread
    receiver: Receiver<Task>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    /// Creates a new sender handle for recording tasks.
    #[must_use]
    pub fn sender(&self) -> Sender<Task> {
        self.sender.clone()
    }

    /// Takes every pending task in recording order.
    pub fn drain(&self) -> Vec<Task> {
        let mut tasks = Vec::new();
        while let Ok(task) = self.receiver.try_recv() {
            tasks.push(task);
        }
        tasks
    }

    /// Returns the number of pending tasks.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_keeps_recording_order() {
        let queue = TaskQueue::new();
        let sender = queue.sender();
        sender.send(Task::RenderGrid(GridKey(2))).expect("send");
        sender.send(Task::PreComposite).expect("send");
        sender.send(Task::ReleaseGrid(GridKey(2))).expect("send");
        assert_eq!(queue.pending_count(), 3);

        let names: Vec<_> = queue.drain().iter().map(Task::name).collect();
        assert_eq!(names, vec!["render grid", "pre-composite", "release grid"]);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_tasks_cross_threads() {
        let queue = TaskQueue::new();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let sender = queue.sender();
                std::thread::spawn(move || {
                    let props = Arc::new(Properties::named(format!("grid {i}")));
                    let frame = FrameTask {
                        grids: vec![GridSnapshot::new(GridKey(i), props)],
                        lights: LightEnvironment::default(),
                    };
                    sender.send(Task::SimulateFrame(frame)).expect("send");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        let tasks = queue.drain();
        assert_eq!(tasks.len(), 4);
        assert!(tasks.iter().all(|t| matches!(t, Task::SimulateFrame(f) if f.grids.len() == 1)));
    }
}
