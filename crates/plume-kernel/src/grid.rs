//! Sparse simulation grid.
//!
//! The grid owns the block tables of its layers and a block-resolution
//! summary of each channel: one `Vec4` per physical block and channel. The
//! summaries are what the allocation policy looks at; full-resolution
//! advection, pressure, and voxelization run in external kernels that the
//! recorded [`GpuCommand`]s stand for.
//!
//! One update:
//!
//! 1. Move toward the target location by at most one block per axis.
//! 2. Collect allocation requests: emitter bounds, face neighbors of
//!    significant blocks, and the custom allocation callback.
//! 3. Release idle blocks, then allocate requests under the shared budget.
//! 4. Couple emitters and colliders into the front buffers.
//! 5. Run custom emission callbacks per layer and channel.
//! 6. Integrate material decay and combustion.
//! 7. Publish a new [`GridExport`] generation.

use std::fmt;
use std::sync::Arc;

use glam::{IVec3, UVec3, Vec3, Vec4};
use plume_common::{Aabb, BlockCoord, BlockDim, GridError, GridSpace};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::GpuCommand;
use crate::block_table::{AllocMask, SparseBlockTable};
use crate::device::DeviceQueue;
use crate::emit::{EmitMode, EmitParams, ShapeDesc};
use crate::emit_custom::{EmitCustomAllocParams, EmitCustomEmitParams, EmitCustomRegistry, SwapBuffer};
use crate::export::{BlockMapping, ChannelData, GridExport, GridExportLayer, GridTextureChannel};
use crate::material::{GridMaterialHandle, GridMaterialParams, GridMaterialPool};

/// Default number of idle steps before an unreferenced block is released.
pub const DEFAULT_RELEASE_HYSTERESIS: u32 = 8;

/// Identifies a grid in recorded commands and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridId(u64);

impl GridId {
    /// Creates a grid ID from a raw value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GridId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "grid#{}", self.0)
    }
}

/// Largest virtual block grid a descriptor may ask for.
pub const MAX_VIRTUAL_BLOCKS: u32 = 1 << 24;

/// Immutable-per-reset grid description.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridDesc {
    /// Initial world-space center
    pub initial_location: Vec3,
    /// World-space half extents
    pub half_size: Vec3,
    /// Virtual resolution in cells
    pub virtual_dim: UVec3,
    /// Fraction of virtual blocks given physical backing
    pub resident_scale: f32,
    /// Map new blocks in the update that requests them. Otherwise requests
    /// are mapped one update later.
    pub low_latency_mapping: bool,
}

impl Default for GridDesc {
    fn default() -> Self {
        Self {
            initial_location: Vec3::ZERO,
            half_size: Vec3::splat(1.0),
            virtual_dim: UVec3::splat(256),
            resident_scale: 0.25,
            low_latency_mapping: true,
        }
    }
}

impl GridDesc {
    /// Checks that the descriptor describes a usable grid.
    pub fn validate(&self) -> Result<(), GridError> {
        if self.virtual_dim.min_element() == 0 {
            return Err(GridError::InvalidDesc(format!("virtual dimension {} has a zero axis", self.virtual_dim)));
        }
        match BlockDim::from_virtual_dim(self.virtual_dim).checked_total() {
            Some(total) if total <= MAX_VIRTUAL_BLOCKS => {},
            _ => {
                return Err(GridError::InvalidDesc(format!(
                    "virtual dimension {} needs more than {MAX_VIRTUAL_BLOCKS} blocks",
                    self.virtual_dim
                )))
            },
        }
        check_placement(self.initial_location, self.half_size)?;
        if !(self.resident_scale > 0.0 && self.resident_scale <= 1.0) {
            return Err(GridError::InvalidDesc(format!(
                "resident scale {} must be in (0, 1]",
                self.resident_scale
            )));
        }
        Ok(())
    }

    /// World/virtual mapping at the initial location.
    #[must_use]
    pub fn space(&self) -> GridSpace {
        GridSpace::new(self.initial_location, self.half_size, self.virtual_dim)
    }

    /// Physical block budget: `resident_scale` of the virtual blocks, at least one.
    ///
    /// Only meaningful for a descriptor that passed [`Self::validate`].
    #[must_use]
    pub fn max_blocks(&self) -> u32 {
        let total = self.space().blocks().total();
        let scaled = (f64::from(self.resident_scale) * f64::from(total)).ceil() as u32;
        scaled.clamp(1, total)
    }
}

fn check_placement(location: Vec3, half_size: Vec3) -> Result<(), GridError> {
    if !location.is_finite() {
        return Err(GridError::InvalidDesc(format!("location {location} must be finite")));
    }
    if !half_size.is_finite() || half_size.min_element() <= 0.0 {
        return Err(GridError::InvalidDesc(format!("half size {half_size} must be positive and finite")));
    }
    Ok(())
}

/// Debug visualization flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DebugVisFlags(u32);

impl DebugVisFlags {
    /// No debug visualization
    pub const DISABLED: Self = Self(0);
    /// Draw active blocks
    pub const BLOCKS: Self = Self(1);
    /// Draw emitter bounds
    pub const EMIT_BOUNDS: Self = Self(2);
    /// Draw simple shapes
    pub const SHAPES_SIMPLE: Self = Self(4);

    /// Creates flags from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

/// Per-step simulation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridParams {
    /// Gravity vector
    pub gravity: Vec3,
    /// Advect in a single pass
    pub single_pass_advection: bool,
    /// Use the legacy pressure solver
    pub pressure_legacy_mode: bool,
    /// Tune for large effects
    pub big_effect_mode: bool,
    /// Prediction time for big effect allocation
    pub big_effect_predict_time: f32,
    /// Debug visualization
    pub debug_vis_flags: DebugVisFlags,
}

impl Default for GridParams {
    fn default() -> Self {
        Self {
            gravity: Vec3::new(0.0, -9.8, 0.0),
            single_pass_advection: true,
            pressure_legacy_mode: false,
            big_effect_mode: false,
            big_effect_predict_time: 0.1,
            debug_vis_flags: DebugVisFlags::DISABLED,
        }
    }
}

/// New placement for [`Grid::reset`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridResetDesc {
    /// New world-space center
    pub initial_location: Vec3,
    /// New world-space half extents
    pub half_size: Vec3,
}

/// Grid statistics after the latest update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GridStats {
    /// Export generation
    pub version: u64,
    /// Allocated blocks across layers
    pub active_blocks: u32,
    /// Physical block budget
    pub max_blocks: u32,
    /// Layers
    pub layers: u32,
    /// Blocks allocated by the latest update
    pub allocated: u32,
    /// Blocks released by the latest update
    pub released: u32,
    /// Requests dropped by the latest update
    pub dropped: u32,
    /// Requests dropped since creation
    pub dropped_total: u64,
}

#[derive(Debug)]
struct GridLayer {
    material: GridMaterialHandle,
    table: SparseBlockTable,
    /// Requests waiting one update to be mapped
    pending: AllocMask,
    velocity: SwapBuffer<ChannelData>,
    density: SwapBuffer<ChannelData>,
}

impl GridLayer {
    fn new(material: GridMaterialHandle, space: &GridSpace, capacity: u32) -> Self {
        let zeros = vec![Vec4::ZERO; capacity as usize];
        Self {
            material,
            table: SparseBlockTable::new(space.blocks(), capacity),
            pending: AllocMask::new(space.blocks()),
            velocity: SwapBuffer::new(zeros.clone(), zeros.clone()),
            density: SwapBuffer::new(zeros.clone(), zeros),
        }
    }

    fn clear_slot(&mut self, slot: u32) {
        for buffer in self.velocity.both_mut().into_iter().chain(self.density.both_mut()) {
            if let Some(value) = buffer.get_mut(slot as usize) {
                *value = Vec4::ZERO;
            }
        }
    }

    fn clear_all(&mut self) {
        self.table.clear();
        self.pending.clear();
        for buffer in self.velocity.both_mut().into_iter().chain(self.density.both_mut()) {
            buffer.fill(Vec4::ZERO);
        }
    }

    fn significance(&self, params: &GridMaterialParams) -> Vec<bool> {
        let velocity = self.velocity.read();
        let density = self.density.read();
        (0..self.table.capacity())
            .map(|slot| {
                self.table.virtual_of(slot).is_some()
                    && params.is_significant(velocity[slot as usize], density[slot as usize])
            })
            .collect()
    }

    fn export(&self) -> (GridExportLayer, GridExportLayer) {
        let mapping = Arc::new(BlockMapping::capture(&self.table));
        let velocity = GridExportLayer {
            material: self.material,
            mapping: Arc::clone(&mapping),
            data: self.velocity.read().as_slice().into(),
        };
        let density = GridExportLayer {
            material: self.material,
            mapping,
            data: self.density.read().as_slice().into(),
        };
        (velocity, density)
    }
}

fn couple(value: f32, target: f32, rate: f32, dt: f32) -> f32 {
    value + (target - value) * (rate * dt).clamp(0.0, 1.0)
}

/// A sparse simulation grid.
#[derive(Debug)]
pub struct Grid {
    id: GridId,
    desc: GridDesc,
    params: GridParams,
    space: GridSpace,
    target_location: Vec3,
    materials: GridMaterialPool,
    emit_materials: Vec<GridMaterialHandle>,
    layers: Vec<GridLayer>,
    emits: Vec<EmitParams>,
    shapes: u32,
    version: u64,
    max_blocks: u32,
    release_hysteresis: u32,
    stats: GridStats,
    export: Arc<GridExport>,
}

impl Grid {
    /// Creates a grid with only the default material layer.
    pub fn new(id: GridId, desc: GridDesc, release_hysteresis: u32) -> Result<Self, GridError> {
        desc.validate()?;
        let space = desc.space();
        let max_blocks = desc.max_blocks();
        let materials = GridMaterialPool::new();
        let layers = vec![GridLayer::new(materials.default_material(), &space, max_blocks)];
        info!(
            "Creating {} ({} virtual blocks, {} resident)",
            id,
            space.blocks().total(),
            max_blocks
        );
        let mut grid = Self {
            id,
            desc,
            params: GridParams::default(),
            space,
            target_location: desc.initial_location,
            materials,
            emit_materials: Vec::new(),
            layers,
            emits: Vec::new(),
            shapes: 0,
            version: 0,
            max_blocks,
            release_hysteresis,
            stats: GridStats::default(),
            export: Arc::new(GridExport::empty(id, space, max_blocks)),
        };
        grid.publish();
        Ok(grid)
    }

    /// Grid ID.
    #[must_use]
    pub const fn id(&self) -> GridId {
        self.id
    }

    /// Descriptor the grid was created or last reset with.
    #[must_use]
    pub const fn desc(&self) -> &GridDesc {
        &self.desc
    }

    /// Current placement.
    #[must_use]
    pub const fn space(&self) -> &GridSpace {
        &self.space
    }

    /// Location the grid is moving toward.
    #[must_use]
    pub const fn target_location(&self) -> Vec3 {
        self.target_location
    }

    /// Current simulation parameters.
    #[must_use]
    pub const fn params(&self) -> &GridParams {
        &self.params
    }

    /// Replaces the simulation parameters.
    pub fn set_params(&mut self, params: GridParams) {
        self.params = params;
    }

    /// Changes how many idle steps an unreferenced block survives.
    pub fn set_release_hysteresis(&mut self, steps: u32) {
        self.release_hysteresis = steps;
    }

    /// Material pool.
    #[must_use]
    pub const fn materials(&self) -> &GridMaterialPool {
        &self.materials
    }

    /// The default material.
    #[must_use]
    pub const fn default_material(&self) -> GridMaterialHandle {
        self.materials.default_material()
    }

    /// Creates a material.
    pub fn create_material(&mut self, params: GridMaterialParams) -> GridMaterialHandle {
        self.materials.create(params)
    }

    /// Updates a material's parameters.
    pub fn set_material_params(&mut self, handle: GridMaterialHandle, params: GridMaterialParams) -> Result<(), GridError> {
        self.materials.update(handle, params)
    }

    /// Releases a material. Its layer, if any, disappears on the next
    /// [`Self::update_emit_materials`].
    pub fn release_material(&mut self, handle: GridMaterialHandle) -> bool {
        self.materials.release(handle)
    }

    /// Sets the materials emitters refer to by index and rebuilds layers.
    ///
    /// Layers of materials still listed keep their blocks and data; layers of
    /// dropped materials are released. The default material layer always exists.
    pub fn update_emit_materials(&mut self, materials: &[GridMaterialHandle]) {
        let default = self.materials.default_material();
        let mut wanted = vec![default];
        for &m in materials {
            if self.materials.contains(m) && !wanted.contains(&m) {
                wanted.push(m);
            }
        }

        let mut old = std::mem::take(&mut self.layers);
        self.layers = wanted
            .iter()
            .map(|&m| match old.iter().position(|l| l.material == m) {
                Some(i) => old.swap_remove(i),
                None => GridLayer::new(m, &self.space, self.max_blocks),
            })
            .collect();
        if !old.is_empty() {
            debug!("{}: released {} material layers", self.id, old.len());
        }
        self.emit_materials = materials.to_vec();
    }

    /// Number of layers.
    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    fn layer_for(&self, emit_material_index: u32) -> usize {
        let material = self
            .emit_materials
            .get(emit_material_index as usize)
            .copied()
            .unwrap_or_else(|| self.materials.default_material());
        self.layers.iter().position(|l| l.material == material).unwrap_or(0)
    }

    /// Queues emitter or collider records for the next update.
    pub fn emit(&mut self, shapes: &[ShapeDesc], params: &[EmitParams]) {
        self.shapes += shapes.len() as u32;
        self.emits.extend_from_slice(params);
    }

    /// Sets the location the grid moves toward, one block per axis per update.
    pub fn set_target_location(&mut self, location: Vec3) {
        self.target_location = location;
    }

    /// Clears all state and adopts a new placement.
    ///
    /// A non-finite or non-positive placement is rejected and the grid is
    /// left untouched.
    pub fn reset(&mut self, reset: GridResetDesc) -> Result<(), GridError> {
        check_placement(reset.initial_location, reset.half_size)?;
        info!(
            "Resetting {} at {} (half size {})",
            self.id, reset.initial_location, reset.half_size
        );
        self.desc.initial_location = reset.initial_location;
        self.desc.half_size = reset.half_size;
        self.space = GridSpace::new(reset.initial_location, reset.half_size, self.desc.virtual_dim);
        self.target_location = reset.initial_location;
        for layer in &mut self.layers {
            layer.clear_all();
        }
        self.emits.clear();
        self.shapes = 0;
        self.version += 1;
        self.publish();
        Ok(())
    }

    fn active_blocks(&self) -> u32 {
        self.layers.iter().map(|l| l.table.active_count()).sum()
    }

    /// Returns the number of blocks that left the domain.
    fn step_location(&mut self) -> u32 {
        let block = self.space.block_size();
        let steps = ((self.target_location - self.space.location()) / block)
            .trunc()
            .as_ivec3()
            .clamp(IVec3::NEG_ONE, IVec3::ONE);
        if steps == IVec3::ZERO {
            return 0;
        }
        let mut released = 0;
        for layer in &mut self.layers {
            for slot in layer.table.translate(steps) {
                layer.clear_slot(slot);
                released += 1;
            }
            // Staged coordinates refer to the old placement.
            layer.pending.clear();
        }
        let location = self.space.location() + steps.as_vec3() * block;
        self.space = self.space.with_location(location);
        debug!("{} moved to {} ({} blocks left the domain)", self.id, location, released);
        released
    }

    /// Allocation bounds of an emitter, swept along its velocity over the
    /// big effect prediction time.
    fn predicted_alloc_bounds(&self, emit: &EmitParams) -> Aabb {
        let bounds = emit.alloc_bounds();
        if !self.params.big_effect_mode {
            return bounds;
        }
        let shift = emit.velocity_linear * self.params.big_effect_predict_time.max(0.0);
        Aabb::new(bounds.min.min(bounds.min + shift), bounds.max.max(bounds.max + shift))
    }

    fn couple_emitters(&mut self, dt: f32) {
        for emit in &self.emits {
            let index = self.layer_for(emit.emit_material_index);
            let Some((lo, hi)) = self.space.block_range(&emit.world_bounds()) else {
                continue;
            };
            let space = self.space;
            let layer = &mut self.layers[index];
            let disable_velocity = emit.emit_mode.contains(EmitMode::DISABLE_VELOCITY);
            let disable_density = emit.emit_mode.contains(EmitMode::DISABLE_DENSITY);
            for z in lo.z..=hi.z {
                for y in lo.y..=hi.y {
                    for x in lo.x..=hi.x {
                        let c = BlockCoord::new(x, y, z);
                        let Some(slot) = layer.table.physical_of(c) else {
                            continue;
                        };
                        let slot = slot as usize;
                        if !disable_velocity {
                            let arm = space.block_center(c) - emit.center_of_mass;
                            let target = emit.velocity_linear + emit.velocity_angular.cross(arm);
                            let v = &mut layer.velocity.front_mut()[slot];
                            let rate = (emit.velocity_couple_rate * dt).clamp(Vec3::ZERO, Vec3::ONE);
                            let current = v.truncate();
                            *v = (current + (target - current) * rate).extend(v.w);
                        }
                        if !disable_density {
                            let d = &mut layer.density.front_mut()[slot];
                            d.x = couple(d.x, emit.temperature, emit.temperature_couple_rate, dt);
                            d.y = couple(d.y, emit.fuel, emit.fuel_couple_rate, dt);
                            d.w = couple(d.w, emit.smoke, emit.smoke_couple_rate, dt);
                            if emit.fuel_release > 0.0 && d.x > emit.fuel_release_temp {
                                d.y += emit.fuel_release * dt;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Advances the grid by `dt`, recording the step on `queue`.
    ///
    /// Callbacks attached to `custom` run during the step; the caller
    /// detaches them afterward.
    pub fn update(&mut self, queue: &mut DeviceQueue, dt: f32, custom: &mut EmitCustomRegistry<'_>) {
        let dt = dt.max(0.0);
        let mut released = self.step_location();

        if !self.emits.is_empty() {
            queue.record(GpuCommand::EmitShapes {
                grid: self.id,
                records: self.emits.len() as u32,
                shapes: self.shapes,
            });
        }

        // Requests.
        let dim = self.space.blocks();
        let mut masks: Vec<AllocMask> = self.layers.iter().map(|_| AllocMask::new(dim)).collect();
        for emit in self.emits.iter().filter(|e| e.allocates()) {
            if let Some((lo, hi)) = self.space.block_range(&self.predicted_alloc_bounds(emit)) {
                masks[self.layer_for(emit.emit_material_index)].request_range(lo, hi);
            }
        }
        let significant: Vec<Vec<bool>> = self
            .layers
            .iter()
            .map(|l| l.significance(&self.materials.params(l.material)))
            .collect();
        for ((layer, mask), sig) in self.layers.iter().zip(&mut masks).zip(&significant) {
            for block in layer.table.active_blocks() {
                if sig[block.physical as usize] {
                    mask.request_neighbors(block.coord);
                }
            }
        }
        for (index, (layer, mask)) in self.layers.iter().zip(&mut masks).enumerate() {
            custom.run_alloc(&mut EmitCustomAllocParams {
                layer: index as u32,
                material: layer.material,
                space: self.space,
                mask,
            });
        }

        // Release, then allocate under the shared budget.
        for ((layer, mask), sig) in self.layers.iter_mut().zip(&masks).zip(&significant) {
            for slot in layer.table.retire_idle(mask, sig, self.release_hysteresis) {
                layer.clear_slot(slot);
                released += 1;
            }
        }
        let mut budget = self.max_blocks.saturating_sub(self.active_blocks());
        let mut allocated = 0;
        let mut dropped = 0;
        let low_latency = self.desc.low_latency_mapping;
        for (layer, mask) in self.layers.iter_mut().zip(&mut masks) {
            if !low_latency {
                std::mem::swap(&mut layer.pending, mask);
            }
            let outcome = layer.table.allocate_requested(mask, &mut budget);
            for block in &outcome.allocated {
                layer.clear_slot(block.physical);
            }
            allocated += outcome.allocated.len() as u32;
            dropped += outcome.dropped;
        }

        self.couple_emitters(dt);

        // Custom emission.
        let space = self.space;
        for (index, layer) in self.layers.iter_mut().enumerate() {
            let GridLayer {
                material,
                table,
                velocity,
                density,
                ..
            } = layer;
            for (channel, data) in [
                (GridTextureChannel::Velocity, velocity),
                (GridTextureChannel::Density, density),
            ] {
                if !custom.has_emit(channel) {
                    continue;
                }
                queue.record(GpuCommand::CustomEmit {
                    grid: self.id,
                    channel,
                    layer: index as u32,
                });
                custom.run_emit(&mut EmitCustomEmitParams {
                    channel,
                    layer: index as u32,
                    material: *material,
                    space,
                    table: &*table,
                    dt,
                    data,
                });
            }
        }

        // Decay and combustion.
        let gravity = self.params.gravity;
        for layer in &mut self.layers {
            let params = self.materials.params(layer.material);
            let slots: Vec<usize> = layer.table.active_blocks().map(|b| b.physical as usize).collect();
            let velocity = layer.velocity.front_mut();
            let density = layer.density.front_mut();
            for slot in slots {
                params.integrate(&mut velocity[slot], &mut density[slot], gravity, dt);
            }
        }

        self.emits.clear();
        self.shapes = 0;
        self.version += 1;
        self.stats.allocated = allocated;
        self.stats.released = released;
        self.stats.dropped = dropped;
        self.stats.dropped_total += u64::from(dropped);
        self.publish();

        queue.record(GpuCommand::GridUpdate {
            grid: self.id,
            version: self.version,
            dt,
            active_blocks: self.stats.active_blocks,
            params: self.params,
        });
    }

    fn publish(&mut self) {
        let (velocity, density): (Vec<_>, Vec<_>) = self.layers.iter().map(GridLayer::export).unzip();
        self.export = Arc::new(GridExport::new(
            self.id,
            self.version,
            self.space,
            self.max_blocks,
            velocity,
            density,
        ));
        self.stats.version = self.version;
        self.stats.active_blocks = self.active_blocks();
        self.stats.max_blocks = self.max_blocks;
        self.stats.layers = self.layers.len() as u32;
    }

    /// The export of the latest generation.
    #[must_use]
    pub fn grid_export(&self) -> Arc<GridExport> {
        Arc::clone(&self.export)
    }

    /// Statistics after the latest update.
    #[must_use]
    pub const fn stats(&self) -> GridStats {
        self.stats
    }
}
