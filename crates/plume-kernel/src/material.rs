//! Grid materials.
//!
//! A material carries per-component decay and allocation parameters plus the
//! combustion coupling constants. Materials live in a pool owned by the grid
//! and are addressed by generation-tagged handles.

use glam::{Vec3, Vec4};
use plume_common::{Arena, GridError, Handle};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Decay, advection, and allocation parameters for one simulated component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridMaterialPerComponent {
    /// Higher values reduce the component faster (exponential decay)
    pub damping: f32,
    /// Fade toward zero, in units per second (linear decay)
    pub fade: f32,
    /// MacCormack correction blend, 0 means semi-Lagrangian only
    pub mac_cormack_blend_factor: f32,
    /// Minimum absolute value before MacCormack correction applies
    pub mac_cormack_blend_threshold: f32,
    /// Relative importance of this component for allocation
    pub alloc_weight: f32,
    /// Minimum magnitude considered relevant for allocation
    pub alloc_threshold: f32,
}

impl Default for GridMaterialPerComponent {
    fn default() -> Self {
        Self {
            damping: 0.0,
            fade: 0.0,
            mac_cormack_blend_factor: 0.5,
            mac_cormack_blend_threshold: 0.001,
            alloc_weight: 0.0,
            alloc_threshold: 0.0075,
        }
    }
}

impl GridMaterialPerComponent {
    /// Returns true if `magnitude` keeps a block alive under this component's weighting.
    #[must_use]
    pub fn is_significant(&self, magnitude: f32) -> bool {
        self.alloc_weight > 0.0 && magnitude * self.alloc_weight > self.alloc_threshold
    }

    /// Applies damping then fade to a scalar over `dt`.
    #[must_use]
    pub fn decay(&self, value: f32, dt: f32) -> f32 {
        let damped = value * (1.0 - self.damping * dt).max(0.0);
        let fade = (self.fade * dt).min(damped.abs());
        damped - damped.signum() * fade
    }

    /// Applies damping then fade to a vector's magnitude over `dt`.
    #[must_use]
    pub fn decay_vec(&self, value: Vec3, dt: f32) -> Vec3 {
        let length = value.length();
        if length <= f32::EPSILON {
            return Vec3::ZERO;
        }
        value * (self.decay(length, dt) / length)
    }
}

/// Full material description.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridMaterialParams {
    /// Velocity component
    pub velocity: GridMaterialPerComponent,
    /// Smoke component
    pub smoke: GridMaterialPerComponent,
    /// Temperature component
    pub temperature: GridMaterialPerComponent,
    /// Fuel component
    pub fuel: GridMaterialPerComponent,

    /// Vorticity confinement strength
    pub vorticity_strength: f32,
    /// Vorticity mask from velocity magnitude
    pub vorticity_velocity_mask: f32,
    /// Vorticity mask from temperature
    pub vorticity_temperature_mask: f32,
    /// Vorticity mask from smoke
    pub vorticity_smoke_mask: f32,
    /// Vorticity mask from fuel
    pub vorticity_fuel_mask: f32,
    /// Constant vorticity mask term
    pub vorticity_constant_mask: f32,

    /// Temperature at which fuel starts burning
    pub ignition_temp: f32,
    /// Burn rate per unit of temperature above ignition
    pub burn_per_temp: f32,
    /// Fuel consumed per unit burned
    pub fuel_per_burn: f32,
    /// Temperature released per unit burned
    pub temp_per_burn: f32,
    /// Smoke released per unit burned
    pub smoke_per_burn: f32,
    /// Expansion per unit burned
    pub divergence_per_burn: f32,
    /// Buoyant acceleration per unit temperature, against gravity
    pub buoyancy_per_temp: f32,
    /// Exponential cooling rate
    pub cooling_rate: f32,
}

impl Default for GridMaterialParams {
    fn default() -> Self {
        Self {
            velocity: GridMaterialPerComponent {
                damping: 0.01,
                fade: 1.0,
                alloc_weight: 1.0,
                ..GridMaterialPerComponent::default()
            },
            smoke: GridMaterialPerComponent {
                damping: 0.3,
                fade: 0.65,
                ..GridMaterialPerComponent::default()
            },
            temperature: GridMaterialPerComponent {
                alloc_weight: 1.0,
                ..GridMaterialPerComponent::default()
            },
            fuel: GridMaterialPerComponent::default(),
            vorticity_strength: 9.0,
            vorticity_velocity_mask: 1.0,
            vorticity_temperature_mask: 0.0,
            vorticity_smoke_mask: 0.0,
            vorticity_fuel_mask: 0.0,
            vorticity_constant_mask: 0.0,
            ignition_temp: 0.05,
            burn_per_temp: 4.0,
            fuel_per_burn: 0.25,
            temp_per_burn: 5.0,
            smoke_per_burn: 3.0,
            divergence_per_burn: 0.0,
            buoyancy_per_temp: 2.0,
            cooling_rate: 1.5,
        }
    }
}

impl GridMaterialParams {
    /// Returns true if a block's summary values keep it allocated.
    ///
    /// Velocity summaries are `(vx, vy, vz, _)`; density summaries are
    /// `(temperature, fuel, burn, smoke)`.
    #[must_use]
    pub fn is_significant(&self, velocity: Vec4, density: Vec4) -> bool {
        self.velocity.is_significant(velocity.truncate().length())
            || self.temperature.is_significant(density.x.abs())
            || self.fuel.is_significant(density.y.abs())
            || self.smoke.is_significant(density.w.abs())
    }

    /// Advances one block's summaries by `dt`: combustion, buoyancy, cooling, decay.
    pub fn integrate(&self, velocity: &mut Vec4, density: &mut Vec4, gravity: Vec3, dt: f32) {
        let (mut temp, mut fuel, mut smoke) = (density.x, density.y, density.w);

        let mut burn = 0.0;
        if temp > self.ignition_temp && fuel > 0.0 {
            burn = (temp - self.ignition_temp) * self.burn_per_temp * dt;
            if self.fuel_per_burn > 0.0 {
                burn = burn.min(fuel / self.fuel_per_burn);
            }
            fuel -= burn * self.fuel_per_burn;
            temp += burn * self.temp_per_burn;
            smoke += burn * self.smoke_per_burn;
        }
        temp -= temp * (self.cooling_rate * dt).min(1.0);

        let buoyancy = -gravity * self.buoyancy_per_temp * temp * dt;
        let v = self.velocity.decay_vec(velocity.truncate() + buoyancy, dt);

        *velocity = v.extend(0.0);
        *density = Vec4::new(
            self.temperature.decay(temp, dt),
            self.fuel.decay(fuel, dt),
            burn,
            self.smoke.decay(smoke, dt),
        );
    }
}

/// A material stored in a pool.
#[derive(Debug, Clone, PartialEq)]
pub struct GridMaterial {
    params: GridMaterialParams,
}

impl GridMaterial {
    /// Current parameters.
    #[must_use]
    pub const fn params(&self) -> &GridMaterialParams {
        &self.params
    }
}

/// Handle to a grid material.
pub type GridMaterialHandle = Handle<GridMaterial>;

/// Pool of grid materials. The default material cannot be released.
#[derive(Debug)]
pub struct GridMaterialPool {
    arena: Arena<GridMaterial>,
    default: GridMaterialHandle,
}

impl Default for GridMaterialPool {
    fn default() -> Self {
        Self::new()
    }
}

impl GridMaterialPool {
    /// Creates a pool holding only the default material.
    #[must_use]
    pub fn new() -> Self {
        let mut arena = Arena::new();
        let default = arena.insert(GridMaterial {
            params: GridMaterialParams::default(),
        });
        Self { arena, default }
    }

    /// The always-present default material.
    #[must_use]
    pub const fn default_material(&self) -> GridMaterialHandle {
        self.default
    }

    /// Creates a material.
    pub fn create(&mut self, params: GridMaterialParams) -> GridMaterialHandle {
        let handle = self.arena.insert(GridMaterial { params });
        debug!("Created grid material {handle:?}");
        handle
    }

    /// Replaces a material's parameters.
    pub fn update(&mut self, handle: GridMaterialHandle, params: GridMaterialParams) -> Result<(), GridError> {
        let material = self.arena.get_mut(handle).ok_or(GridError::UnknownMaterial)?;
        material.params = params;
        Ok(())
    }

    /// Releases a material. Releasing the default material is ignored.
    pub fn release(&mut self, handle: GridMaterialHandle) -> bool {
        if handle == self.default {
            return false;
        }
        let released = self.arena.remove(handle).is_some();
        if released {
            debug!("Released grid material {handle:?}");
        }
        released
    }

    /// Parameters of a material, falling back to the default for stale handles.
    #[must_use]
    pub fn params(&self, handle: GridMaterialHandle) -> GridMaterialParams {
        self.arena
            .get(handle)
            .or_else(|| self.arena.get(self.default))
            .map(|m| m.params)
            .unwrap_or_default()
    }

    /// Returns true if `handle` is live.
    #[must_use]
    pub fn contains(&self, handle: GridMaterialHandle) -> bool {
        self.arena.contains(handle)
    }

    /// Number of live materials, including the default.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.arena.len()
    }

    /// Always false; the default material is permanent.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_material_is_permanent() {
        let mut pool = GridMaterialPool::new();
        let default = pool.default_material();
        assert!(!pool.release(default));
        assert!(pool.contains(default));
    }

    #[test]
    fn test_stale_handle_falls_back_to_default() {
        let mut pool = GridMaterialPool::new();
        let params = GridMaterialParams {
            cooling_rate: 9.0,
            ..GridMaterialParams::default()
        };
        let handle = pool.create(params);
        assert_eq!(pool.params(handle).cooling_rate, 9.0);
        assert!(pool.release(handle));
        assert_eq!(pool.params(handle).cooling_rate, 1.5);
        assert!(pool.update(handle, params).is_err());
    }

    #[test]
    fn test_decay_reaches_zero() {
        let c = GridMaterialPerComponent {
            damping: 0.0,
            fade: 1.0,
            ..GridMaterialPerComponent::default()
        };
        assert_eq!(c.decay(0.5, 1.0), 0.0);
        assert_eq!(c.decay(-0.5, 1.0), 0.0);
        assert!((c.decay(2.0, 0.5) - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_significance_uses_weight() {
        let params = GridMaterialParams::default();
        assert!(params.is_significant(Vec4::ZERO, Vec4::new(1.0, 0.0, 0.0, 0.0)));
        // Smoke has zero allocation weight by default.
        assert!(!params.is_significant(Vec4::ZERO, Vec4::new(0.0, 0.0, 0.0, 10.0)));
        assert!(!params.is_significant(Vec4::ZERO, Vec4::ZERO));
    }

    #[test]
    fn test_combustion_consumes_fuel() {
        let params = GridMaterialParams::default();
        let mut velocity = Vec4::ZERO;
        let mut density = Vec4::new(1.0, 1.0, 0.0, 0.0);
        params.integrate(&mut velocity, &mut density, Vec3::new(0.0, -9.8, 0.0), 1.0 / 60.0);
        assert!(density.y < 1.0);
        assert!(density.z > 0.0);
        assert!(density.w > 0.0);
        assert!(velocity.y > 0.0);
    }
}
