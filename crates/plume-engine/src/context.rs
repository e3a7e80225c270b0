//! Simulation context and the frame driver.
//!
//! A [`Context`] owns the queues, the device topology, and every scene. It
//! lives on the thread that submits GPU work. Other threads talk to it
//! through a [`ContextHandle`], which records [`Task`]s and can retire
//! scenes; the context runs the tasks when [`Context::run_pending`] is
//! called.
//!
//! ## Frame order
//!
//! 1. Create dedicated devices if the configuration allows them
//! 2. Refresh fence status of every queue
//! 3. Update each scene present in the frame, creating or retiring it
//! 4. Update every grid view, collecting debug lines
//! 5. Flush the dedicated queues
//! 6. Release retired scenes

use std::sync::Arc;

use ahash::AHashSet;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use plume_common::SceneIdAllocator;
use plume_kernel::{GridExport, GridProxyType, GridStats, HostBackend, QueueSet};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::debug_info::DebugInfoQueue;
use crate::distance_field::SdfRegistry;
use crate::particles::{grid_affects_particles, particles_affect_grid, GridExportParams, ParticleSimulationParams};
use crate::properties::{GridKey, MeshKey};
use crate::scene::{Scene, SceneResources, SceneStats};
use crate::shadow::LightEnvironment;
use crate::task::{FrameTask, GridSnapshot, Task, TaskQueue};
use crate::topology::DeviceTopology;

/// Live scenes and scenes waiting for release.
#[derive(Debug, Default)]
struct SceneList {
    scenes: Vec<Scene>,
    cleanup: Vec<Scene>,
}

impl SceneList {
    fn position(&self, key: GridKey) -> Option<usize> {
        self.scenes.iter().position(|s| s.key() == key)
    }

    /// Moves a scene to the cleanup list.
    fn retire(&mut self, key: GridKey) -> bool {
        match self.position(key) {
            Some(index) => {
                let scene = self.scenes.remove(index);
                self.cleanup.push(scene);
                true
            },
            None => false,
        }
    }
}

/// Summary of one simulated frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameReport {
    /// Frame number, starting at 1
    pub frame: u64,
    /// Live scenes after the frame
    pub scenes: usize,
    /// Scenes that processed a new snapshot
    pub updated: usize,
    /// Whether dedicated simulation queues were asked to flush
    pub should_flush: bool,
    /// Submissions made at the end of the frame
    pub submissions: u32,
}

/// Simulation context.
#[derive(Debug)]
pub struct Context {
    config: Arc<EngineConfig>,
    host: Arc<dyn HostBackend>,
    queues: QueueSet,
    topology: DeviceTopology,
    scenes: Arc<Mutex<SceneList>>,
    sdfs: SdfRegistry,
    debug_info: Arc<DebugInfoQueue>,
    scene_ids: SceneIdAllocator,
    tasks: TaskQueue,
    reset_pending: bool,
    last_frame: FrameReport,
}

impl Context {
    /// Creates a context on the host's graphics queue.
    pub fn new(host: Arc<dyn HostBackend>, config: Arc<EngineConfig>) -> Self {
        let mut queues = QueueSet::new();
        let topology = DeviceTopology::new(host.as_ref(), &mut queues);
        info!(
            "Context created (multi-GPU level {}, async compute level {})",
            config.multi_gpu, config.async_compute
        );
        Self {
            reset_pending: config.multi_gpu_reset_request,
            config,
            host,
            queues,
            topology,
            scenes: Arc::new(Mutex::new(SceneList::default())),
            sdfs: SdfRegistry::new(),
            debug_info: Arc::new(DebugInfoQueue::new()),
            scene_ids: SceneIdAllocator::new(),
            tasks: TaskQueue::new(),
            last_frame: FrameReport::default(),
        }
    }

    /// Creates a handle for other threads.
    #[must_use]
    pub fn handle(&self) -> ContextHandle {
        ContextHandle {
            sender: self.tasks.sender(),
            scenes: Arc::clone(&self.scenes),
        }
    }

    /// Replaces the configuration. A reset request recreates every scene
    /// on the next frame.
    pub fn set_config(&mut self, config: Arc<EngineConfig>) {
        if config.multi_gpu_reset_request {
            info!("Scene reset requested");
            self.reset_pending = true;
        }
        self.config = config;
    }

    /// Runs every task recorded so far, in order. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let tasks = self.tasks.drain();
        let count = tasks.len();
        for task in tasks {
            debug!("Running {}", task.name());
            match task {
                Task::UpdateConfig(config) => self.set_config(config),
                Task::SimulateFrame(FrameTask { grids, lights }) => {
                    self.simulate_frame(&grids, &lights);
                },
                Task::RenderGrid(key) => {
                    self.render_grid(key);
                },
                Task::PreComposite => {
                    self.pre_composite();
                },
                Task::QueryGridExports {
                    particles,
                    max_count,
                    reply,
                } => {
                    let exports = self.query_grid_export_params(particles, max_count);
                    if reply.send(exports).is_err() {
                        debug!("Grid export query dropped by its caller");
                    }
                },
                Task::ReleaseGrid(key) => {
                    self.release_grid(key);
                },
            }
        }
        count
    }

    /// Simulates one frame of every grid in `grids`.
    ///
    /// Grids missing from `grids` keep their scenes untouched. Never blocks
    /// on the GPU.
    pub fn simulate_frame(&mut self, grids: &[GridSnapshot], lights: &LightEnvironment) -> FrameReport {
        let reset = std::mem::take(&mut self.reset_pending);
        if reset {
            self.topology.reprobe(self.host.as_ref());
        }
        self.topology
            .conditional_init(self.host.as_ref(), &mut self.queues, &self.config);
        self.topology.interop_begin(&mut self.queues);

        let mut should_flush = false;
        let mut updated = 0;

        let scenes = Arc::clone(&self.scenes);
        let mut list = scenes.lock();
        for snapshot in grids {
            let active = snapshot.properties.active && !reset;
            if self.update_scene(&mut list, snapshot, active, &mut should_flush) {
                updated += 1;
            }
        }

        self.debug_info.start_submit_info(self.config.debug_info);
        for scene in &mut list.scenes {
            scene.update_grid_view(&mut self.queues, lights, &self.debug_info);
        }
        self.debug_info.finish_submit_info();

        let referenced: AHashSet<MeshKey> = list
            .scenes
            .iter()
            .flat_map(|s| s.distance_field_keys().iter().copied())
            .collect();
        let scene_count = list.scenes.len();
        drop(list);

        let submissions = self.topology.interop_end(&mut self.queues, true, should_flush);
        self.cleanup_scene_list_deferred();
        self.sdfs.retain_referenced(&referenced);

        self.last_frame = FrameReport {
            frame: self.last_frame.frame + 1,
            scenes: scene_count,
            updated,
            should_flush,
            submissions,
        };
        self.last_frame
    }

    /// Creates, updates, or retires the scene of one snapshot. Returns
    /// whether a new snapshot was processed.
    fn update_scene(
        &mut self,
        list: &mut SceneList,
        snapshot: &GridSnapshot,
        active: bool,
        should_flush: &mut bool,
    ) -> bool {
        if !active {
            list.retire(snapshot.key);
            return false;
        }

        let index = match list.position(snapshot.key) {
            Some(index) => index,
            None => {
                let queues = self.topology.select(&snapshot.properties, &self.config);
                let scene = Scene::init(
                    self.scene_ids.allocate(),
                    snapshot.key,
                    Arc::clone(&snapshot.properties),
                    queues,
                    &self.config,
                );
                match scene {
                    Ok(scene) => {
                        list.scenes.push(scene);
                        list.scenes.len() - 1
                    },
                    Err(e) => {
                        warn!("Failed to create scene for {}: {e}", snapshot.key);
                        return false;
                    },
                }
            },
        };

        let mut res = SceneResources {
            queues: &mut self.queues,
            topology: &self.topology,
            config: &self.config,
            sdfs: &mut self.sdfs,
        };
        list.scenes[index].update(Arc::clone(&snapshot.properties), &mut res, should_flush)
    }

    /// Records the color pass of one grid and submits host queue work.
    ///
    /// Particle-mode grids only draw with their debug wireframe on.
    pub fn render_grid(&mut self, key: GridKey) -> bool {
        let scenes = Arc::clone(&self.scenes);
        let mut list = scenes.lock();
        let Some(scene) = list.scenes.iter_mut().find(|s| s.key() == key) else {
            debug!("No scene for {key}");
            return false;
        };
        let render = &scene.properties().render;
        let hidden = scene.properties().particle_mode_enabled && !render.debug_wireframe;
        let rendered = !hidden && scene.render(&mut self.queues, &self.config);
        drop(list);

        self.topology.interop_end(&mut self.queues, false, false);
        rendered
    }

    /// Records depth passes of every grid that generates depth. Returns the
    /// number of passes recorded.
    pub fn pre_composite(&mut self) -> u32 {
        if !self.should_do_pre_composite() {
            return 0;
        }
        let scenes = Arc::clone(&self.scenes);
        let mut list = scenes.lock();
        let mut passes = 0;
        for scene in &mut list.scenes {
            if scene.render_depth(&mut self.queues) {
                passes += 1;
            }
        }
        drop(list);

        self.topology.interop_end(&mut self.queues, false, false);
        passes
    }

    /// Whether a depth pre-composite pass is needed this frame.
    #[must_use]
    pub fn should_do_pre_composite(&self) -> bool {
        self.config.depth > 0
            && self
                .scenes
                .lock()
                .scenes
                .iter()
                .any(|s| s.render_params().generate_depth)
    }

    /// Whether any grid collides with the global distance field.
    #[must_use]
    pub fn uses_global_distance_field(&self) -> bool {
        self.scenes
            .lock()
            .scenes
            .iter()
            .any(|s| s.properties().distance_field_collision_enabled)
    }

    /// Collects exports of grids that interact with `particles`, and queues
    /// the particles on grids they affect.
    ///
    /// At most `max_count` exports are returned; particles are queued on
    /// every affected grid regardless.
    pub fn query_grid_export_params(
        &mut self,
        particles: ParticleSimulationParams,
        max_count: usize,
    ) -> Vec<GridExportParams> {
        let mut list = self.scenes.lock();
        let mut exports = Vec::new();
        for scene in &mut list.scenes {
            let props = Arc::clone(scene.properties());
            if !props.particles_interaction_enabled {
                continue;
            }
            let bounds = scene.bounds();
            if !bounds.intersects(&particles.bounds) {
                continue;
            }
            let particle_response = particles.responses.get(props.interaction_channel);
            let grid_response = props.responses.get(particles.interaction_channel);
            if exports.len() < max_count && grid_affects_particles(particle_response, grid_response) {
                exports.push(GridExportParams {
                    grid: scene.key(),
                    bounds,
                    export: Arc::clone(scene.render_export()),
                });
            }
            if particles_affect_grid(particle_response, grid_response) {
                scene.queue_particles(particles.clone());
            }
        }
        exports
    }

    /// Retires the scene of a grid. It is released at the end of the next
    /// frame.
    pub fn release_grid(&mut self, key: GridKey) -> bool {
        self.scenes.lock().retire(key)
    }

    /// Releases retired scenes.
    fn cleanup_scene_list_deferred(&mut self) {
        let retired = std::mem::take(&mut self.scenes.lock().cleanup);
        for scene in retired {
            scene.release();
        }
    }

    /// Runs `f` on the scene of a grid.
    pub fn with_scene<R>(&self, key: GridKey, f: impl FnOnce(&Scene) -> R) -> Option<R> {
        let list = self.scenes.lock();
        list.position(key).map(|i| f(&list.scenes[i]))
    }

    /// Export the render passes of a grid read.
    #[must_use]
    pub fn grid_export(&self, key: GridKey) -> Option<Arc<GridExport>> {
        self.with_scene(key, |s| Arc::clone(s.render_export()))
    }

    /// Transport of a grid's scene.
    #[must_use]
    pub fn scene_proxy_type(&self, key: GridKey) -> Option<GridProxyType> {
        self.with_scene(key, Scene::proxy_type)
    }

    /// Update counters of a grid's scene.
    #[must_use]
    pub fn scene_stats(&self, key: GridKey) -> Option<SceneStats> {
        self.with_scene(key, Scene::stats)
    }

    /// Grid statistics of a grid's scene.
    #[must_use]
    pub fn grid_stats(&self, key: GridKey) -> Option<GridStats> {
        self.with_scene(key, Scene::grid_stats)
    }

    /// Number of live scenes.
    #[must_use]
    pub fn scene_count(&self) -> usize {
        self.scenes.lock().scenes.len()
    }

    /// Debug lines shared with overlays.
    #[must_use]
    pub fn debug_info(&self) -> Arc<DebugInfoQueue> {
        Arc::clone(&self.debug_info)
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Device topology.
    #[must_use]
    pub const fn topology(&self) -> &DeviceTopology {
        &self.topology
    }

    /// Every queue of the context.
    #[must_use]
    pub const fn queues(&self) -> &QueueSet {
        &self.queues
    }

    /// Summary of the last simulated frame.
    #[must_use]
    pub const fn last_frame(&self) -> FrameReport {
        self.last_frame
    }

    /// Releases every scene, then waits for the dedicated queues and drops
    /// them.
    pub fn release(mut self) {
        {
            let mut list = self.scenes.lock();
            let live = std::mem::take(&mut list.scenes);
            list.cleanup.extend(live);
        }
        self.cleanup_scene_list_deferred();
        self.topology.release(&mut self.queues);
        info!("Context released after {} frames", self.last_frame.frame);
    }
}

/// Cloneable handle to a [`Context`] for other threads.
///
/// Recording methods return false once the context is gone.
#[derive(Debug, Clone)]
pub struct ContextHandle {
    sender: Sender<Task>,
    scenes: Arc<Mutex<SceneList>>,
}

impl ContextHandle {
    fn send(&self, task: Task) -> bool {
        match self.sender.send(task) {
            Ok(()) => true,
            Err(e) => {
                warn!("Context gone, dropped {}", e.0.name());
                false
            },
        }
    }

    /// Records a frame of simulation.
    pub fn simulate_frame(&self, frame: FrameTask) -> bool {
        self.send(Task::SimulateFrame(frame))
    }

    /// Records the color pass of one grid.
    pub fn render_grid(&self, key: GridKey) -> bool {
        self.send(Task::RenderGrid(key))
    }

    /// Records the depth pre-composite.
    pub fn pre_composite(&self) -> bool {
        self.send(Task::PreComposite)
    }

    /// Records a configuration change.
    pub fn update_config(&self, config: Arc<EngineConfig>) -> bool {
        self.send(Task::UpdateConfig(config))
    }

    /// Records the release of a grid's scene.
    pub fn release_grid(&self, key: GridKey) -> bool {
        self.send(Task::ReleaseGrid(key))
    }

    /// Records a grid export query. The exports arrive on the returned
    /// receiver once the context runs the task.
    pub fn query_grid_exports(
        &self,
        particles: ParticleSimulationParams,
        max_count: usize,
    ) -> Option<Receiver<Vec<GridExportParams>>> {
        let (reply, exports) = bounded(1);
        self.send(Task::QueryGridExports {
            particles,
            max_count,
            reply,
        })
        .then_some(exports)
    }

    /// Retires a grid's scene right away. Safe from any thread; the scene is
    /// released at the end of the next frame.
    pub fn cleanup_scene(&self, key: GridKey) -> bool {
        self.scenes.lock().retire(key)
    }

    /// Number of live scenes.
    #[must_use]
    pub fn scene_count(&self) -> usize {
        self.scenes.lock().scenes.len()
    }
}
