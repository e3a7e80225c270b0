//! Per-grid scene driver.
//!
//! A scene owns one grid and everything needed to simulate and draw it: the
//! proxy that carries its exports to the render queue, the volume renderer,
//! an optional volume shadow, the render material pool, and the material
//! map. Each frame runs, in order:
//!
//! 1. [`Scene::update_parameters`] when the snapshot version advanced
//! 2. [`Scene::update_substep`] once per scheduled substep
//! 3. [`Scene::finalize_update`]
//! 4. [`Scene::update_grid_view`], batched with every other scene
//! 5. [`Scene::render`] / [`Scene::render_depth`], any number of times
//!
//! Nothing here blocks. A substep that would overrun the dedicated queue is
//! skipped and its contribution lost.

use std::sync::Arc;

use plume_common::{Aabb, GridError, SceneId, VersionWatermark};
use plume_kernel::{
    EmitCustomEmit, EmitCustomEmitParams, EmitCustomRegistry, EmitParams, Grid, GridDesc, GridExport, GridId,
    GridParams, GridProxy, GridProxyType, GridResetDesc, GridStats, GridTextureChannel, QueueSet, RenderMaterialPool,
    ShadowStats, ShapeSdf, VolumeRender, VolumeRenderParams, VolumeShadow, VolumeShadowParams, NO_MATERIAL,
};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::debug_info::DebugInfoQueue;
use crate::distance_field::{DistanceFieldCollider, SdfRegistry};
use crate::material_map::MaterialMap;
use crate::particles::{ParticleAlloc, ParticleDensityEmit, ParticleSimulationParams, ParticleVelocityEmit};
use crate::properties::{GridKey, MeshKey, Properties, RenderProperties};
use crate::shadow::{shadow_frustum, LightEnvironment};
use crate::topology::{DeviceTopology, SceneQueues};

/// Context state a scene borrows while it updates.
#[derive(Debug)]
pub struct SceneResources<'a> {
    /// Every queue of the context
    pub queues: &'a mut QueueSet,
    /// Shared devices and their fence status
    pub topology: &'a DeviceTopology,
    /// Engine configuration of this frame
    pub config: &'a EngineConfig,
    /// Distance fields shared by every scene
    pub sdfs: &'a mut SdfRegistry,
}

/// Update counters of one scene.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SceneStats {
    /// Snapshots processed
    pub updates: u64,
    /// Substeps simulated
    pub substeps_run: u64,
    /// Substeps skipped because the dedicated queue was saturated
    pub substeps_skipped: u64,
}

/// What [`Scene::release`] tore down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SceneRelease {
    /// Last export generation of the grid
    pub version: u64,
    /// Proxy transfers abandoned in flight
    pub outstanding_transfers: usize,
    /// Updates of the volume shadow, if the scene had one
    pub shadow_updates: Option<u64>,
    /// Color and depth passes the renderer recorded
    pub render_passes: u64,
    /// Render materials released
    pub render_materials: usize,
}

/// One grid instance and its render state.
#[derive(Debug)]
pub struct Scene {
    id: SceneId,
    key: GridKey,
    properties: Arc<Properties>,
    latest_version: VersionWatermark,
    queues: SceneQueues,

    grid_desc: GridDesc,
    grid_params: GridParams,
    grid: Grid,
    proxy: GridProxy,
    export_for_render: Arc<GridExport>,

    volume_render: VolumeRender,
    volume_shadow: Option<VolumeShadow>,
    render_material_pool: RenderMaterialPool,
    render_params: VolumeRenderParams,
    material_map: MaterialMap,

    /// Emitters with resolved material indices
    emit_params: Vec<EmitParams>,
    /// Meshes `ShapeDesc::Sdf` indices refer to
    sdf_meshes: Vec<MeshKey>,
    /// Particle batches queued for the next substep
    particles: Vec<ParticleSimulationParams>,

    stats: SceneStats,
}

impl Scene {
    /// Creates the grid and its render state on `queues`.
    ///
    /// The grid starts at the snapshot's `location`. Its topology is fixed
    /// for the scene's lifetime.
    pub fn init(
        id: SceneId,
        key: GridKey,
        properties: Arc<Properties>,
        queues: SceneQueues,
        config: &EngineConfig,
    ) -> Result<Self, GridError> {
        let mut grid_desc = properties.grid_desc;
        grid_desc.initial_location = properties.location;
        let grid = Grid::new(GridId::from_raw(id.raw()), grid_desc, config.release_hysteresis_frames)?;
        let proxy = GridProxy::new(queues.proxy_type, grid.grid_export());
        let export_for_render = Arc::clone(proxy.get_grid_export());

        info!("Created {} for '{}' ({:?})", id, properties.name, queues.proxy_type);
        Ok(Self {
            id,
            key,
            latest_version: VersionWatermark::new(),
            queues,
            grid_desc,
            grid_params: properties.grid_params,
            grid,
            proxy,
            export_for_render,
            volume_render: VolumeRender::new(),
            volume_shadow: None,
            render_material_pool: RenderMaterialPool::new(properties.color_map_resolution),
            render_params: volume_render_params(&properties.render, config),
            material_map: MaterialMap::new(),
            emit_params: Vec::new(),
            sdf_meshes: Vec::new(),
            particles: Vec::new(),
            stats: SceneStats::default(),
            properties,
        })
    }

    /// Runs one frame of simulation for `properties`.
    ///
    /// Parameters and substeps only run when the snapshot version is newer
    /// than the last one processed. Returns whether it was.
    pub fn update(
        &mut self,
        properties: Arc<Properties>,
        res: &mut SceneResources<'_>,
        should_flush: &mut bool,
    ) -> bool {
        self.properties = properties;
        let updated = self.latest_version.advance(self.properties.version);
        if updated {
            self.update_parameters(res.config, res.sdfs);
            let substep_size = self.properties.substep_size;
            let num_substeps = self.properties.num_scheduled_substeps;
            if substep_size > 0.0 {
                for substep in 0..num_substeps {
                    self.update_substep(res, substep_size, substep, num_substeps, should_flush);
                }
            }
        }
        self.finalize_update();
        updated
    }

    /// Applies the current snapshot: render parameters, materials, new
    /// distance fields, and emitter material indices.
    pub fn update_parameters(&mut self, config: &EngineConfig, sdfs: &mut SdfRegistry) {
        let props = Arc::clone(&self.properties);
        self.stats.updates += 1;
        self.grid_params = props.grid_params;
        self.render_params = volume_render_params(&props.render, config);
        self.grid.set_release_hysteresis(config.release_hysteresis_frames);

        for field in &props.new_distance_fields {
            if let Err(e) = sdfs.insert(field) {
                warn!("Distance field for {} rejected: {e}", field.mesh);
            }
        }
        self.sdf_meshes.clone_from(&props.distance_field_keys);

        let resolved = self
            .material_map
            .update(&mut self.grid, &mut self.render_material_pool, &props);
        self.emit_params = props
            .emit_params
            .iter()
            .enumerate()
            .map(|(i, params)| EmitParams {
                emit_material_index: resolved.indices.get(i).copied().unwrap_or(NO_MATERIAL),
                ..*params
            })
            .collect();
        self.grid.update_emit_materials(&resolved.materials);
    }

    /// Simulates one substep unless the dedicated queue is saturated.
    ///
    /// Sets `should_flush` when dedicated queues have new work. Returns
    /// whether the substep ran.
    pub fn update_substep(
        &mut self,
        res: &mut SceneResources<'_>,
        dt: f32,
        substep: u32,
        num_substeps: u32,
        should_flush: &mut bool,
    ) -> bool {
        let max = res.config.max_frames_in_flight;
        let in_flight = match self.queues.proxy_type {
            GridProxyType::MultiGpu => Some(res.topology.frames_in_flight_multi_gpu()),
            GridProxyType::InterQueue => Some(res.topology.frames_in_flight_async_compute()),
            GridProxyType::PassThrough => None,
        };
        // A push stages one transfer next to the one in flight.
        let transfers_after_push = usize::from(self.proxy.pending_fence().is_some()) + 1;
        let should_update = in_flight.map_or(true, |frames| {
            frames < max && transfers_after_push <= max as usize
        });
        *should_flush |= should_update && in_flight.is_some();

        if !should_update {
            self.stats.substeps_skipped += 1;
            debug!(
                "{} skipped substep {}/{} ({:?} frames in flight)",
                self.id,
                substep + 1,
                num_substeps,
                in_flight
            );
            return false;
        }
        self.update_substep_deferred(res.queues, res.sdfs, dt);
        self.stats.substeps_run += 1;
        true
    }

    fn update_substep_deferred(&mut self, queues: &mut QueueSet, sdfs: &SdfRegistry, dt: f32) {
        let props = Arc::clone(&self.properties);
        self.grid.set_params(self.grid_params);
        self.follow_location(&props);
        self.grid.emit(&props.emit_shapes, &self.emit_params);
        self.grid.emit(&props.collide_shapes, &props.collide_params);

        let Some(queue) = queues.get_mut(self.queues.params.grid_queue) else {
            warn!("{} lost its grid queue", self.id);
            return;
        };

        let fields: Vec<Option<&ShapeSdf>> = self
            .sdf_meshes
            .iter()
            .map(|mesh| sdfs.handle(*mesh).and_then(|h| sdfs.get(h)))
            .collect();
        let mut collider = if props.distance_field_collision_enabled {
            DistanceFieldCollider::new(&props.collide_shapes, &props.collide_params, &fields)
        } else {
            DistanceFieldCollider::new(&[], &[], &[])
        };
        let colliding = !collider.is_empty();

        let particles: &[ParticleSimulationParams] = &self.particles;
        let particle_driven = !particles.is_empty();
        let mut particle_alloc = ParticleAlloc::new(particles);
        let mut particle_velocity = ParticleVelocityEmit::new(particles);
        let mut particle_density = ParticleDensityEmit::new(particles);
        let mut velocity = |params: &mut EmitCustomEmitParams<'_>| {
            collider.emit(params);
            particle_velocity.emit(params);
        };

        let mut custom = EmitCustomRegistry::new();
        if particle_driven {
            custom.register_alloc_func(Some(&mut particle_alloc));
            custom.register_emit_func(GridTextureChannel::Density, Some(&mut particle_density));
        }
        if particle_driven || colliding {
            custom.register_emit_func(GridTextureChannel::Velocity, Some(&mut velocity));
        }
        self.grid.update(queue, dt, &mut custom);
        custom.unregister_all();

        self.proxy.push(self.grid.grid_export(), queues, &self.queues.params);
    }

    /// Follows the owner: a new half size resets the grid, a new location
    /// moves it.
    fn follow_location(&mut self, props: &Properties) {
        let half_size = props.grid_desc.half_size;
        if half_size != self.grid_desc.half_size {
            let reset = GridResetDesc {
                initial_location: props.location,
                half_size,
            };
            match self.grid.reset(reset) {
                Ok(()) => {
                    self.grid_desc.half_size = half_size;
                    self.grid_desc.initial_location = props.location;
                },
                Err(e) => warn!("{} kept its placement: {e}", self.id),
            }
        } else if props.location != self.grid_desc.initial_location && props.location.is_finite() {
            self.grid_desc.initial_location = props.location;
            self.grid.set_target_location(props.location);
        }
    }

    /// Drops per-frame particle batches.
    pub fn finalize_update(&mut self) {
        self.particles.clear();
    }

    /// Resolves the proxy, submits debug lines, and shadows the export the
    /// render passes will use.
    pub fn update_grid_view(
        &mut self,
        queues: &mut QueueSet,
        lights: &LightEnvironment,
        debug_info: &DebugInfoQueue,
    ) {
        self.proxy.flush(queues, &self.queues.params);
        let mut export = Arc::clone(self.proxy.get_grid_export());

        let name = &self.properties.name;
        if debug_info.is_collecting() {
            debug_info.submit_info(format!(
                "Grid '{}': velocity blocks = {} of {}",
                name,
                export.num_blocks(GridTextureChannel::Velocity),
                export.max_blocks()
            ));
            debug_info.submit_info(format!(
                "Grid '{}': density blocks  = {} of {}",
                name,
                export.num_blocks(GridTextureChannel::Density),
                export.max_blocks()
            ));
        }

        let render = self.properties.render;
        let light = if render.volume_shadow_enabled {
            lights.select_shadow_light(render.shadow_channel)
        } else {
            None
        };
        let frustum = light.and_then(|l| {
            shadow_frustum(
                &l,
                &export.space().bounds(),
                render.shadow_frustum_scale,
                render.shadow_near_distance,
            )
        });

        match frustum {
            Some(frustum) => {
                if self
                    .volume_shadow
                    .as_ref()
                    .map_or(true, |s| s.needs_recreate(&render.shadow))
                {
                    debug!("{} creating volume shadow", self.id);
                    self.volume_shadow = Some(VolumeShadow::new(render.shadow));
                }
                let queue = queues.get_mut(self.queues.render_queue);
                if let (Some(shadow), Some(queue)) = (self.volume_shadow.as_mut(), queue) {
                    if frustum.valid {
                        let params = VolumeShadowParams {
                            view: frustum.view,
                            projection: frustum.projection,
                            render_mode: render.render_mode,
                            render_channel: render.render_channel,
                            intensity_scale: render.shadow_intensity_scale,
                            min_intensity: render.shadow_min_intensity,
                            shadow_blend_comp_mask: render.shadow_blend_comp_mask,
                            shadow_blend_bias: render.shadow_blend_bias,
                        };
                        export = shadow.update(queue, &export, &params);
                    }
                    if debug_info.is_collecting() {
                        debug_info.submit_info(format!(
                            "Grid '{}': shadow blocks active = {}",
                            name,
                            shadow.stats().shadow_blocks_active
                        ));
                    }
                }
            },
            None => {
                if self.volume_shadow.take().is_some() {
                    debug!("{} released volume shadow", self.id);
                }
            },
        }

        self.export_for_render = export;
    }

    /// Records the color pass. With depth enabled only the composite runs,
    /// on top of [`Self::render_depth`].
    pub fn render(&mut self, queues: &mut QueueSet, config: &EngineConfig) -> bool {
        let Some(queue) = queues.get_mut(self.queues.render_queue) else {
            return false;
        };
        let params = VolumeRenderParams {
            pre_color_composite_only: false,
            color_composite_only: self.render_params.generate_depth,
            ..self.render_params
        };
        self.volume_render.render(queue, &self.export_for_render, &params);
        if config.debug_draw_shadow {
            if let Some(shadow) = &self.volume_shadow {
                shadow.debug_render(queue, &self.export_for_render);
            }
        }
        true
    }

    /// Records the depth pre-composite pass when the grid generates depth.
    pub fn render_depth(&mut self, queues: &mut QueueSet) -> bool {
        if !self.render_params.generate_depth {
            return false;
        }
        let Some(queue) = queues.get_mut(self.queues.render_queue) else {
            return false;
        };
        let params = VolumeRenderParams {
            pre_color_composite_only: true,
            color_composite_only: false,
            ..self.render_params
        };
        self.volume_render.render_depth(queue, &self.export_for_render, &params)
    }

    /// Queues a particle batch for the next substep.
    pub fn queue_particles(&mut self, particles: ParticleSimulationParams) {
        self.particles.push(particles);
    }

    /// Tears the scene down and reports what it held. Called on the
    /// submission thread only.
    ///
    /// Proxy transfers still in flight are abandoned, never waited on.
    pub fn release(self) -> SceneRelease {
        let Self {
            id,
            properties,
            grid,
            proxy,
            volume_render,
            volume_shadow,
            render_material_pool,
            ..
        } = self;
        let release = SceneRelease {
            version: grid.stats().version,
            outstanding_transfers: proxy.outstanding(),
            shadow_updates: volume_shadow.map(|shadow| shadow.updates()),
            render_passes: volume_render.color_passes() + volume_render.depth_passes(),
            render_materials: render_material_pool.len(),
        };
        drop(render_material_pool);
        drop(proxy);
        drop(grid);
        info!(
            "Cleaned up {} ('{}') at v{}: {} render materials, {} transfers abandoned",
            id, properties.name, release.version, release.render_materials, release.outstanding_transfers
        );
        release
    }

    /// Scene id.
    #[must_use]
    pub const fn id(&self) -> SceneId {
        self.id
    }

    /// Host key of the grid.
    #[must_use]
    pub const fn key(&self) -> GridKey {
        self.key
    }

    /// Latest snapshot.
    #[must_use]
    pub fn properties(&self) -> &Arc<Properties> {
        &self.properties
    }

    /// Highest snapshot version processed.
    #[must_use]
    pub const fn latest_version(&self) -> u64 {
        self.latest_version.latest()
    }

    /// Transport chosen at creation.
    #[must_use]
    pub const fn proxy_type(&self) -> GridProxyType {
        self.queues.proxy_type
    }

    /// Queues the scene uses.
    #[must_use]
    pub const fn queues(&self) -> &SceneQueues {
        &self.queues
    }

    /// The grid.
    #[must_use]
    pub const fn grid(&self) -> &Grid {
        &self.grid
    }

    /// The proxy.
    #[must_use]
    pub const fn proxy(&self) -> &GridProxy {
        &self.proxy
    }

    /// Grid statistics after the latest substep.
    #[must_use]
    pub const fn grid_stats(&self) -> GridStats {
        self.grid.stats()
    }

    /// Export the render passes read.
    #[must_use]
    pub fn render_export(&self) -> &Arc<GridExport> {
        &self.export_for_render
    }

    /// World-space bounds of the simulated domain.
    #[must_use]
    pub fn bounds(&self) -> Aabb {
        self.grid.space().bounds()
    }

    /// Render parameters of the latest snapshot.
    #[must_use]
    pub const fn render_params(&self) -> &VolumeRenderParams {
        &self.render_params
    }

    /// Shadow coverage, if the grid is shadowed.
    #[must_use]
    pub fn shadow_stats(&self) -> Option<ShadowStats> {
        self.volume_shadow.as_ref().map(VolumeShadow::stats)
    }

    /// Meshes whose distance fields the grid references.
    #[must_use]
    pub fn distance_field_keys(&self) -> &[MeshKey] {
        &self.sdf_meshes
    }

    /// Particle batches waiting for the next substep.
    #[must_use]
    pub fn queued_particles(&self) -> usize {
        self.particles.len()
    }

    /// Update counters.
    #[must_use]
    pub const fn stats(&self) -> SceneStats {
        self.stats
    }
}

/// Render parameters of a grid under the engine's depth level.
fn volume_render_params(render: &RenderProperties, config: &EngineConfig) -> VolumeRenderParams {
    let forced_depth = config.depth > 1;
    let (depth_alpha_threshold, depth_intensity_threshold) = if forced_depth {
        (config.depth_alpha_threshold, config.depth_intensity_threshold)
    } else {
        (render.depth_alpha_threshold, render.depth_intensity_threshold)
    };
    VolumeRenderParams {
        render_mode: render.render_mode,
        render_channel: render.render_channel,
        debug_mode: render.debug_wireframe,
        screen_percentage: render.max_screen_percentage.clamp(0.0, 1.0),
        generate_depth: config.depth > 0 && (render.generate_depth || forced_depth),
        generate_depth_debug_mode: config.depth_debug_draw,
        depth_alpha_threshold,
        depth_intensity_threshold,
        ..VolumeRenderParams::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{UVec3, Vec3};
    use plume_kernel::{FenceCompletion, ShapeDesc, SoftwareHost, SoftwareHostDesc};

    struct Fixture {
        host: SoftwareHost,
        queues: QueueSet,
        topology: DeviceTopology,
        config: EngineConfig,
        sdfs: SdfRegistry,
        debug_info: DebugInfoQueue,
    }

    impl Fixture {
        fn new(desc: SoftwareHostDesc, config: EngineConfig) -> Self {
            let host = SoftwareHost::new(desc);
            let mut queues = QueueSet::new();
            let mut topology = DeviceTopology::new(&host, &mut queues);
            topology.conditional_init(&host, &mut queues, &config);
            Self {
                host,
                queues,
                topology,
                config,
                sdfs: SdfRegistry::new(),
                debug_info: DebugInfoQueue::new(),
            }
        }

        fn scene(&self, props: &Arc<Properties>) -> Scene {
            let queues = self.topology.select(props, &self.config);
            Scene::init(SceneId::from_raw(1), GridKey(1), Arc::clone(props), queues, &self.config).expect("scene")
        }

        /// Simulation half of a frame, without the grid view.
        fn simulate(&mut self, scene: &mut Scene, props: &Arc<Properties>) -> bool {
            self.topology.interop_begin(&mut self.queues);
            let mut should_flush = false;
            let mut res = SceneResources {
                queues: &mut self.queues,
                topology: &self.topology,
                config: &self.config,
                sdfs: &mut self.sdfs,
            };
            let updated = scene.update(Arc::clone(props), &mut res, &mut should_flush);
            self.topology.interop_end(&mut self.queues, true, should_flush);
            updated
        }

        fn frame(&mut self, scene: &mut Scene, props: &Arc<Properties>, lights: &LightEnvironment) {
            self.topology.interop_begin(&mut self.queues);
            let mut should_flush = false;
            let mut res = SceneResources {
                queues: &mut self.queues,
                topology: &self.topology,
                config: &self.config,
                sdfs: &mut self.sdfs,
            };
            scene.update(Arc::clone(props), &mut res, &mut should_flush);
            self.debug_info.start_submit_info(self.config.debug_info);
            scene.update_grid_view(&mut self.queues, lights, &self.debug_info);
            self.debug_info.finish_submit_info();
            self.topology.interop_end(&mut self.queues, true, should_flush);
        }
    }

    fn emitting(version: u64) -> Properties {
        let mut props = Properties::named("torch");
        props.version = version;
        props.grid_desc.virtual_dim = UVec3::splat(64);
        props.grid_desc.resident_scale = 1.0;
        props.push_emitter(
            ShapeDesc::Sphere { radius: 0.1 },
            EmitParams::sphere(Vec3::ZERO, 0.1),
            None,
        );
        props
    }

    fn inter_queue_config() -> EngineConfig {
        EngineConfig {
            multi_gpu: 0,
            async_compute: 2,
            ..EngineConfig::default()
        }
    }

    fn async_host(completion: FenceCompletion) -> SoftwareHostDesc {
        SoftwareHostDesc {
            dedicated_queue: true,
            completion,
            ..SoftwareHostDesc::default()
        }
    }

    #[test]
    fn test_unchanged_version_is_skipped() {
        let mut fx = Fixture::new(SoftwareHostDesc::default(), EngineConfig::default());
        let props = Arc::new(emitting(1));
        let mut scene = fx.scene(&props);

        assert!(fx.simulate(&mut scene, &props));
        assert!(!fx.simulate(&mut scene, &props));
        assert_eq!(scene.stats().updates, 1);
        assert_eq!(scene.grid_stats().version, 1);
        assert_eq!(scene.latest_version(), 1);
    }

    #[test]
    fn test_zero_substep_size_only_applies_parameters() {
        let mut fx = Fixture::new(SoftwareHostDesc::default(), EngineConfig::default());
        let mut props = emitting(1);
        props.substep_size = 0.0;
        let props = Arc::new(props);
        let mut scene = fx.scene(&props);

        assert!(fx.simulate(&mut scene, &props));
        assert_eq!(scene.stats().updates, 1);
        assert_eq!(scene.stats().substeps_run, 0);
    }

    #[test]
    fn test_scheduled_substeps_run_in_order() {
        let mut fx = Fixture::new(SoftwareHostDesc::default(), EngineConfig::default());
        let mut props = emitting(1);
        props.num_scheduled_substeps = 3;
        let props = Arc::new(props);
        let mut scene = fx.scene(&props);

        fx.simulate(&mut scene, &props);
        assert_eq!(scene.stats().substeps_run, 3);
        assert_eq!(scene.grid_stats().version, 3);
        // Pass-through makes every push visible at once.
        assert_eq!(scene.proxy().get_grid_export().version(), 3);
    }

    #[test]
    fn test_push_without_flush_keeps_resolved_generation() {
        let mut fx = Fixture::new(async_host(FenceCompletion::Immediate), inter_queue_config());
        let lights = LightEnvironment::default();
        let props = Arc::new(emitting(1));
        let mut scene = fx.scene(&props);
        assert_eq!(scene.proxy_type(), GridProxyType::InterQueue);

        // The transfer of v1 starts in this frame and resolves in the next.
        fx.frame(&mut scene, &props, &lights);
        fx.frame(&mut scene, &props, &lights);
        assert_eq!(scene.render_export().version(), 1);

        fx.simulate(&mut scene, &Arc::new(emitting(2)));
        fx.simulate(&mut scene, &Arc::new(emitting(3)));
        assert_eq!(scene.grid_stats().version, 3);
        assert_eq!(scene.proxy().get_grid_export().version(), 1);
        assert_eq!(scene.render_export().version(), 1);
        assert_eq!(scene.proxy().superseded(), 1);
    }

    #[test]
    fn test_saturated_queue_skips_without_submitting() {
        let config = EngineConfig {
            max_frames_in_flight: 1,
            ..inter_queue_config()
        };
        let mut fx = Fixture::new(async_host(FenceCompletion::Manual), config);
        let props = Arc::new(emitting(1));
        let mut scene = fx.scene(&props);

        fx.simulate(&mut scene, &props);
        let submitted = fx.host.submission_count();
        assert_eq!(submitted, 1);

        fx.simulate(&mut scene, &Arc::new(emitting(2)));
        assert_eq!(scene.stats().substeps_skipped, 1);
        assert_eq!(fx.host.submission_count(), submitted);
    }

    #[test]
    fn test_location_moves_and_half_size_resets() {
        let mut fx = Fixture::new(SoftwareHostDesc::default(), EngineConfig::default());
        let props = Arc::new(emitting(1));
        let mut scene = fx.scene(&props);
        fx.simulate(&mut scene, &props);

        let mut moved = emitting(2);
        moved.location = Vec3::new(0.5, 0.0, 0.0);
        fx.simulate(&mut scene, &Arc::new(moved.clone()));
        assert_eq!(scene.grid().target_location(), Vec3::new(0.5, 0.0, 0.0));
        assert_eq!(scene.grid().desc().half_size, Vec3::ONE);

        moved.version = 3;
        moved.grid_desc.half_size = Vec3::splat(2.0);
        fx.simulate(&mut scene, &Arc::new(moved));
        assert_eq!(scene.grid().desc().half_size, Vec3::splat(2.0));
        assert_eq!(scene.grid().desc().initial_location, Vec3::new(0.5, 0.0, 0.0));
    }

    #[test]
    fn test_non_finite_half_size_keeps_placement() {
        let mut fx = Fixture::new(SoftwareHostDesc::default(), EngineConfig::default());
        let props = Arc::new(emitting(1));
        let mut scene = fx.scene(&props);
        fx.simulate(&mut scene, &props);

        let mut broken = emitting(2);
        broken.grid_desc.half_size = Vec3::new(1.0, f32::NAN, 1.0);
        assert!(fx.simulate(&mut scene, &Arc::new(broken)));
        assert_eq!(scene.grid().desc().half_size, Vec3::ONE);
        assert_eq!(scene.grid_stats().version, 2);
        assert!(scene.grid_stats().active_blocks > 0);
    }

    #[test]
    fn test_shadow_follows_light_and_opt_in() {
        let mut fx = Fixture::new(SoftwareHostDesc::default(), EngineConfig::default());
        let mut props = emitting(1);
        props.render.volume_shadow_enabled = true;
        let props = Arc::new(props);
        let mut scene = fx.scene(&props);
        let lights = LightEnvironment {
            lights: Vec::new(),
            default_directional: Some(crate::shadow::SceneLight::directional(Vec3::NEG_Y)),
        };

        fx.frame(&mut scene, &props, &LightEnvironment::default());
        assert!(scene.shadow_stats().is_none());

        fx.frame(&mut scene, &props, &lights);
        let stats = scene.shadow_stats().expect("shadowed");
        assert!(stats.shadow_blocks_active >= 1);

        let mut off = (*props).clone();
        off.version = 2;
        off.render.volume_shadow_enabled = false;
        fx.frame(&mut scene, &Arc::new(off), &lights);
        assert!(scene.shadow_stats().is_none());
    }

    #[test]
    fn test_release_reports_teardown() {
        let mut fx = Fixture::new(SoftwareHostDesc::default(), EngineConfig::default());
        let mut props = emitting(1);
        props.render.volume_shadow_enabled = true;
        let props = Arc::new(props);
        let mut scene = fx.scene(&props);
        let lights = LightEnvironment {
            lights: Vec::new(),
            default_directional: Some(crate::shadow::SceneLight::directional(Vec3::NEG_Y)),
        };
        fx.frame(&mut scene, &props, &lights);
        assert!(scene.render(&mut fx.queues, &fx.config));

        let release = scene.release();
        assert_eq!(release.version, 1);
        assert_eq!(release.outstanding_transfers, 0);
        assert_eq!(release.shadow_updates, Some(1));
        assert_eq!(release.render_passes, 1);
    }

    #[test]
    fn test_debug_lines_name_the_grid() {
        let config = EngineConfig {
            debug_info: true,
            ..EngineConfig::default()
        };
        let mut fx = Fixture::new(SoftwareHostDesc::default(), config);
        let props = Arc::new(emitting(1));
        let mut scene = fx.scene(&props);
        fx.frame(&mut scene, &props, &LightEnvironment::default());

        let lines = fx.debug_info.latest();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Grid 'torch': velocity blocks = "));
        assert!(lines[1].starts_with("Grid 'torch': density blocks  = "));
    }

    #[test]
    fn test_depth_levels() {
        let mut render = RenderProperties::default();
        let off = EngineConfig {
            depth: 0,
            ..EngineConfig::default()
        };
        let opt_in = EngineConfig::default();
        let forced = EngineConfig {
            depth: 2,
            depth_alpha_threshold: 0.5,
            ..EngineConfig::default()
        };

        assert!(!volume_render_params(&render, &opt_in).generate_depth);
        let forced_params = volume_render_params(&render, &forced);
        assert!(forced_params.generate_depth);
        assert_eq!(forced_params.depth_alpha_threshold, 0.5);

        render.generate_depth = true;
        render.depth_alpha_threshold = 0.7;
        assert!(!volume_render_params(&render, &off).generate_depth);
        let params = volume_render_params(&render, &opt_in);
        assert!(params.generate_depth);
        assert_eq!(params.depth_alpha_threshold, 0.7);
    }

    #[test]
    fn test_render_passes_follow_depth() {
        let mut fx = Fixture::new(SoftwareHostDesc::default(), EngineConfig::default());
        let mut props = emitting(1);
        props.render.generate_depth = true;
        let props = Arc::new(props);
        let mut scene = fx.scene(&props);
        fx.frame(&mut scene, &props, &LightEnvironment::default());

        assert!(scene.render_depth(&mut fx.queues));
        assert!(scene.render(&mut fx.queues, &fx.config));
        let recorded = fx
            .queues
            .get(fx.topology.render_queue())
            .map(|q| q.recorded().to_vec())
            .unwrap_or_default();
        assert!(recorded.iter().any(|c| matches!(
            c,
            plume_kernel::GpuCommand::VolumeRender {
                pass: plume_kernel::RenderPass::Color {
                    color_composite_only: true
                },
                ..
            }
        )));
    }

    #[test]
    fn test_particles_cleared_after_frame() {
        let mut fx = Fixture::new(SoftwareHostDesc::default(), EngineConfig::default());
        let props = Arc::new(emitting(1));
        let mut scene = fx.scene(&props);
        scene.queue_particles(ParticleSimulationParams::from_particles(
            vec![Vec3::splat(0.2)],
            vec![Vec3::X],
        ));
        assert_eq!(scene.queued_particles(), 1);

        fx.simulate(&mut scene, &props);
        assert_eq!(scene.queued_particles(), 0);
    }
}
