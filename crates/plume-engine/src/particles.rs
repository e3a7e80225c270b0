//! Particle system coupling.
//!
//! Particle systems and grids meet on interaction channels. Each side names
//! the channel it lives on and how it responds to every other channel; a
//! grid feeds a particle system when the grid produces and the particles
//! receive, and the other way around.
//!
//! Particles that affect a grid are queued on its scene for one frame and
//! coupled in through the custom emission callbacks defined here.

use std::sync::Arc;

use ahash::AHashMap;
use glam::{Vec3, Vec4};
use plume_common::Aabb;
use plume_kernel::{EmitCustomAlloc, EmitCustomAllocParams, EmitCustomEmit, EmitCustomEmitParams, GridExport};
use serde::{Deserialize, Serialize};

use crate::properties::GridKey;

/// Channel a grid or particle system is seen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct InteractionChannel(pub u8);

/// How one side responds to another channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InteractionResponse {
    /// No exchange
    Ignore,
    /// Takes data from the other side
    Receive,
    /// Gives data to the other side
    Produce,
    /// Both directions
    #[default]
    TwoWay,
}

impl InteractionResponse {
    /// Whether this side takes data.
    #[must_use]
    pub const fn receives(self) -> bool {
        matches!(self, Self::Receive | Self::TwoWay)
    }

    /// Whether this side gives data.
    #[must_use]
    pub const fn produces(self) -> bool {
        matches!(self, Self::Produce | Self::TwoWay)
    }
}

/// Responses to every channel, with per-channel overrides.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractionResponses {
    /// Response to channels without an override
    pub default: InteractionResponse,
    /// Per-channel overrides
    pub overrides: Vec<(InteractionChannel, InteractionResponse)>,
}

impl InteractionResponses {
    /// Same response to every channel.
    #[must_use]
    pub fn all(response: InteractionResponse) -> Self {
        Self {
            default: response,
            overrides: Vec::new(),
        }
    }

    /// Response to a channel.
    #[must_use]
    pub fn get(&self, channel: InteractionChannel) -> InteractionResponse {
        self.overrides
            .iter()
            .find(|(c, _)| *c == channel)
            .map_or(self.default, |(_, r)| *r)
    }

    /// Overrides the response to one channel.
    pub fn set(&mut self, channel: InteractionChannel, response: InteractionResponse) {
        match self.overrides.iter_mut().find(|(c, _)| *c == channel) {
            Some(entry) => entry.1 = response,
            None => self.overrides.push((channel, response)),
        }
    }
}

/// Whether grid data flows into a particle system.
#[must_use]
pub const fn grid_affects_particles(particle_response: InteractionResponse, grid_response: InteractionResponse) -> bool {
    particle_response.receives() && grid_response.produces()
}

/// Whether particle data flows into a grid.
#[must_use]
pub const fn particles_affect_grid(particle_response: InteractionResponse, grid_response: InteractionResponse) -> bool {
    grid_response.receives() && particle_response.produces()
}

/// One particle system's state for a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleSimulationParams {
    /// World-space bounds of every particle
    pub bounds: Aabb,
    /// Channel the system lives on
    pub interaction_channel: InteractionChannel,
    /// Responses to grid channels
    pub responses: InteractionResponses,
    /// Particle positions
    pub positions: Vec<Vec3>,
    /// Particle velocities, parallel to `positions`
    pub velocities: Vec<Vec3>,
    /// Smoke each particle carries
    pub smoke: f32,
    /// Velocity couple rate
    pub velocity_couple_rate: f32,
    /// Smoke couple rate
    pub smoke_couple_rate: f32,
}

impl Default for ParticleSimulationParams {
    fn default() -> Self {
        Self {
            bounds: Aabb::new(Vec3::ZERO, Vec3::ZERO),
            interaction_channel: InteractionChannel::default(),
            responses: InteractionResponses::default(),
            positions: Vec::new(),
            velocities: Vec::new(),
            smoke: 1.0,
            velocity_couple_rate: 2.0,
            smoke_couple_rate: 2.0,
        }
    }
}

impl ParticleSimulationParams {
    /// Particles at `positions` moving with `velocities`; bounds are derived.
    #[must_use]
    pub fn from_particles(positions: Vec<Vec3>, velocities: Vec<Vec3>) -> Self {
        let bounds = positions.iter().fold(None::<Aabb>, |acc, &p| {
            Some(acc.map_or(Aabb::new(p, p), |b| Aabb::new(b.min.min(p), b.max.max(p))))
        });
        Self {
            bounds: bounds.unwrap_or(Aabb::new(Vec3::ZERO, Vec3::ZERO)),
            positions,
            velocities,
            ..Self::default()
        }
    }
}

/// A grid export handed to a particle system.
#[derive(Debug, Clone)]
pub struct GridExportParams {
    /// Grid the export belongs to
    pub grid: GridKey,
    /// World-space bounds of the grid
    pub bounds: Aabb,
    /// Latest export visible to the render side
    pub export: Arc<GridExport>,
}

fn couple(current: f32, target: f32, rate: f32, dt: f32) -> f32 {
    current + (target - current) * (rate * dt).clamp(0.0, 1.0)
}

/// Sums a per-particle value into the blocks of one layer.
fn gather<F>(params: &EmitCustomEmitParams<'_>, particles: &[ParticleSimulationParams], mut value: F) -> AHashMap<u32, (Vec4, f32, u32)>
where
    F: FnMut(&ParticleSimulationParams, usize) -> Vec4,
{
    let mut sums: AHashMap<u32, (Vec4, f32, u32)> = AHashMap::new();
    for system in particles {
        for (i, &p) in system.positions.iter().enumerate() {
            let Some(slot) = params.space.block_of_point(p).and_then(|c| params.table.physical_of(c)) else {
                continue;
            };
            let entry = sums.entry(slot).or_insert((Vec4::ZERO, 0.0, 0));
            entry.0 += value(system, i);
            entry.1 += match params.channel {
                plume_kernel::GridTextureChannel::Velocity => system.velocity_couple_rate,
                _ => system.smoke_couple_rate,
            };
            entry.2 += 1;
        }
    }
    sums
}

/// Requests blocks under every queued particle, in the default layer.
#[derive(Debug)]
pub struct ParticleAlloc<'a> {
    particles: &'a [ParticleSimulationParams],
}

impl<'a> ParticleAlloc<'a> {
    /// Allocation for `particles`.
    #[must_use]
    pub const fn new(particles: &'a [ParticleSimulationParams]) -> Self {
        Self { particles }
    }
}

impl EmitCustomAlloc for ParticleAlloc<'_> {
    fn alloc(&mut self, params: &mut EmitCustomAllocParams<'_>) {
        if params.layer != 0 {
            return;
        }
        for p in self.particles.iter().flat_map(|s| s.positions.iter()) {
            if let Some(c) = params.space.block_of_point(*p) {
                params.mask.request(c);
            }
        }
    }
}

/// Couples particle velocity into the velocity channel.
#[derive(Debug)]
pub struct ParticleVelocityEmit<'a> {
    particles: &'a [ParticleSimulationParams],
}

impl<'a> ParticleVelocityEmit<'a> {
    /// Velocity coupling for `particles`.
    #[must_use]
    pub const fn new(particles: &'a [ParticleSimulationParams]) -> Self {
        Self { particles }
    }
}

impl EmitCustomEmit for ParticleVelocityEmit<'_> {
    fn emit(&mut self, params: &mut EmitCustomEmitParams<'_>) {
        if params.layer != 0 {
            return;
        }
        let sums = gather(params, self.particles, |s, i| {
            s.velocities.get(i).copied().unwrap_or(Vec3::ZERO).extend(0.0)
        });
        if sums.is_empty() {
            return;
        }
        let dt = params.dt;
        let mut generation = params.data.begin();
        generation.copy_forward();
        let (read, write) = generation.views();
        for (slot, (sum, rate, count)) in sums {
            let slot = slot as usize;
            let n = count as f32;
            let (Some(prev), Some(out)) = (read.get(slot), write.get_mut(slot)) else {
                continue;
            };
            let target = sum / n;
            let rate = rate / n;
            *out = Vec4::new(
                couple(prev.x, target.x, rate, dt),
                couple(prev.y, target.y, rate, dt),
                couple(prev.z, target.z, rate, dt),
                prev.w,
            );
        }
        generation.commit();
    }
}

/// Couples particle smoke into the density channel.
#[derive(Debug)]
pub struct ParticleDensityEmit<'a> {
    particles: &'a [ParticleSimulationParams],
}

impl<'a> ParticleDensityEmit<'a> {
    /// Density coupling for `particles`.
    #[must_use]
    pub const fn new(particles: &'a [ParticleSimulationParams]) -> Self {
        Self { particles }
    }
}

impl EmitCustomEmit for ParticleDensityEmit<'_> {
    fn emit(&mut self, params: &mut EmitCustomEmitParams<'_>) {
        if params.layer != 0 {
            return;
        }
        let sums = gather(params, self.particles, |s, _| Vec4::new(0.0, 0.0, 0.0, s.smoke));
        if sums.is_empty() {
            return;
        }
        let dt = params.dt;
        let mut generation = params.data.begin();
        generation.copy_forward();
        let (read, write) = generation.views();
        for (slot, (sum, rate, count)) in sums {
            let slot = slot as usize;
            let n = count as f32;
            let (Some(prev), Some(out)) = (read.get(slot), write.get_mut(slot)) else {
                continue;
            };
            out.w = couple(prev.w, sum.w / n, rate / n, dt);
        }
        generation.commit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plume_common::{BlockDim, GridSpace};
    use plume_kernel::{AllocMask, ChannelData, GridMaterialPool, GridTextureChannel, SparseBlockTable, SwapBuffer};

    #[test]
    fn test_response_matrix() {
        use InteractionResponse::*;
        assert!(grid_affects_particles(Receive, Produce));
        assert!(grid_affects_particles(TwoWay, TwoWay));
        assert!(!grid_affects_particles(Produce, Produce));
        assert!(particles_affect_grid(Produce, Receive));
        assert!(!particles_affect_grid(Ignore, TwoWay));
    }

    #[test]
    fn test_channel_override() {
        let mut responses = InteractionResponses::all(InteractionResponse::Ignore);
        responses.set(InteractionChannel(2), InteractionResponse::Receive);
        responses.set(InteractionChannel(2), InteractionResponse::Produce);
        assert_eq!(responses.get(InteractionChannel(1)), InteractionResponse::Ignore);
        assert_eq!(responses.get(InteractionChannel(2)), InteractionResponse::Produce);
        assert_eq!(responses.overrides.len(), 1);
    }

    fn setup() -> (GridSpace, SparseBlockTable, SwapBuffer<ChannelData>) {
        let space = GridSpace::new(Vec3::ZERO, Vec3::ONE, glam::UVec3::splat(32));
        let dim = BlockDim::from_virtual_dim(glam::UVec3::splat(32));
        let mut table = SparseBlockTable::new(dim, 8);
        let mut mask = AllocMask::new(dim);
        mask.request(plume_common::BlockCoord::new(1, 1, 1));
        let mut budget = 8;
        table.allocate_requested(&mask, &mut budget);
        let data = SwapBuffer::new(vec![Vec4::ZERO; 8], vec![Vec4::ZERO; 8]);
        (space, table, data)
    }

    #[test]
    fn test_velocity_emit_commits_only_when_touched() {
        let (space, table, mut data) = setup();
        let material = GridMaterialPool::new().default_material();

        let far = vec![ParticleSimulationParams::from_particles(
            vec![Vec3::splat(-0.9)],
            vec![Vec3::X],
        )];
        let mut emit = ParticleVelocityEmit::new(&far);
        emit.emit(&mut EmitCustomEmitParams {
            channel: GridTextureChannel::Velocity,
            layer: 0,
            material,
            space,
            table: &table,
            dt: 0.5,
            data: &mut data,
        });
        assert_eq!(data.front_index(), 0);

        let near = vec![ParticleSimulationParams::from_particles(
            vec![Vec3::splat(0.5)],
            vec![Vec3::new(4.0, 0.0, 0.0)],
        )];
        let mut emit = ParticleVelocityEmit::new(&near);
        emit.emit(&mut EmitCustomEmitParams {
            channel: GridTextureChannel::Velocity,
            layer: 0,
            material,
            space,
            table: &table,
            dt: 0.5,
            data: &mut data,
        });
        assert_eq!(data.front_index(), 1);
        assert!(data.read().iter().any(|v| v.x > 0.0));
    }

    #[test]
    fn test_alloc_requests_particle_blocks() {
        let space = GridSpace::new(Vec3::ZERO, Vec3::ONE, glam::UVec3::splat(32));
        let mut mask = AllocMask::new(space.blocks());
        let particles = vec![ParticleSimulationParams::from_particles(
            vec![Vec3::splat(0.5), Vec3::splat(5.0)],
            vec![Vec3::ZERO; 2],
        )];
        let mut alloc = ParticleAlloc::new(&particles);
        alloc.alloc(&mut EmitCustomAllocParams {
            layer: 0,
            material: GridMaterialPool::new().default_material(),
            space,
            mask: &mut mask,
        });
        assert_eq!(mask.count(), 1);
    }
}
