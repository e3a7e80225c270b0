//! Emitter and collider records.
//!
//! Shape producers hand the grid a batch of [`EmitParams`] plus the
//! [`ShapeDesc`] array the records index into. The grid only uses the bounds
//! and the couple targets; shape geometry is passed through to the GPU.

use std::ops::BitOr;

use glam::{Mat4, Vec3};
use plume_common::Aabb;
use serde::{Deserialize, Serialize};

/// Emit material index meaning "use the grid's default material".
pub const NO_MATERIAL: u32 = u32::MAX;

/// Shape kinds an emitter may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShapeType {
    /// Signed distance field
    Sdf,
    /// Sphere
    Sphere,
    /// Box
    Box,
    /// Capsule along X
    Capsule,
    /// Infinite plane
    Plane,
}

/// One shape descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ShapeDesc {
    /// Signed distance field by registry index
    Sdf {
        /// Index into the frame's distance field list
        sdf_index: u32,
    },
    /// Sphere in local space
    Sphere {
        /// Radius
        radius: f32,
    },
    /// Box in local space
    Box {
        /// Half extents
        half_size: Vec3,
    },
    /// Capsule along local X
    Capsule {
        /// Radius
        radius: f32,
        /// Length of the cylindrical section
        length: f32,
    },
    /// Plane
    Plane {
        /// Plane normal
        normal: Vec3,
        /// Signed distance from origin
        distance: f32,
    },
}

impl ShapeDesc {
    /// Kind of this shape.
    #[must_use]
    pub const fn shape_type(&self) -> ShapeType {
        match self {
            Self::Sdf { .. } => ShapeType::Sdf,
            Self::Sphere { .. } => ShapeType::Sphere,
            Self::Box { .. } => ShapeType::Box,
            Self::Capsule { .. } => ShapeType::Capsule,
            Self::Plane { .. } => ShapeType::Plane,
        }
    }
}

/// Emit mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EmitMode(u32);

impl EmitMode {
    /// Default behavior
    pub const DEFAULT: Self = Self(0);
    /// Do not couple velocity
    pub const DISABLE_VELOCITY: Self = Self(1);
    /// Do not couple density channels
    pub const DISABLE_DENSITY: Self = Self(2);
    /// Do not request block allocation
    pub const DISABLE_ALLOC: Self = Self(4);
    /// Allocate by shape rather than bounds
    pub const ALLOC_SHAPE: Self = Self(8);

    /// Raw flag bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EmitMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One emitter or collider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitParams {
    /// Maps the unit cube to the world-space region the emitter affects
    pub bounds: Mat4,
    /// Maps shape local space to world space
    pub local_to_world: Mat4,
    /// Center used for angular velocity
    pub center_of_mass: Vec3,
    /// Kind of the referenced shapes
    pub shape_type: ShapeType,
    /// First shape in the frame's shape array
    pub shape_range_offset: u32,
    /// Number of shapes
    pub shape_range_size: u32,
    /// Scale applied to shape distances
    pub shape_distance_scale: f32,
    /// Index into the frame's emit material list, or [`NO_MATERIAL`]
    pub emit_material_index: u32,
    /// Mode flags
    pub emit_mode: EmitMode,
    /// Scales the allocation region relative to the bounds
    pub allocation_scale: Vec3,
    /// Time in seconds to predict motion for allocation
    pub allocation_predict: f32,

    /// Target linear velocity
    pub velocity_linear: Vec3,
    /// Target angular velocity
    pub velocity_angular: Vec3,
    /// Velocity couple rate per axis
    pub velocity_couple_rate: Vec3,
    /// Target smoke
    pub smoke: f32,
    /// Smoke couple rate
    pub smoke_couple_rate: f32,
    /// Target temperature
    pub temperature: f32,
    /// Temperature couple rate
    pub temperature_couple_rate: f32,
    /// Target fuel
    pub fuel: f32,
    /// Fuel couple rate
    pub fuel_couple_rate: f32,
    /// Temperature above which fuel is released
    pub fuel_release_temp: f32,
    /// Fuel released above `fuel_release_temp`
    pub fuel_release: f32,
    /// Inner distance where emission is at full strength
    pub min_active_dist: f32,
    /// Outer distance where emission stops
    pub max_active_dist: f32,
    /// Substeps this record is replayed over
    pub num_substeps: u32,
}

impl Default for EmitParams {
    fn default() -> Self {
        Self {
            bounds: Mat4::IDENTITY,
            local_to_world: Mat4::IDENTITY,
            center_of_mass: Vec3::ZERO,
            shape_type: ShapeType::Sphere,
            shape_range_offset: 0,
            shape_range_size: 1,
            shape_distance_scale: 1.0,
            emit_material_index: NO_MATERIAL,
            emit_mode: EmitMode::DEFAULT,
            allocation_scale: Vec3::ONE,
            allocation_predict: 0.0,
            velocity_linear: Vec3::ZERO,
            velocity_angular: Vec3::ZERO,
            velocity_couple_rate: Vec3::splat(2.0),
            smoke: 0.0,
            smoke_couple_rate: 2.0,
            temperature: 2.0,
            temperature_couple_rate: 2.0,
            fuel: 0.0,
            fuel_couple_rate: 2.0,
            fuel_release_temp: 0.0,
            fuel_release: 0.0,
            min_active_dist: -0.25,
            max_active_dist: 0.0,
            num_substeps: 1,
        }
    }
}

impl EmitParams {
    /// An emitter of the given radius centered at `center`.
    #[must_use]
    pub fn sphere(center: Vec3, radius: f32) -> Self {
        let bounds = Mat4::from_scale_rotation_translation(Vec3::splat(radius), glam::Quat::IDENTITY, center);
        Self {
            bounds,
            local_to_world: Mat4::from_translation(center),
            center_of_mass: center,
            ..Self::default()
        }
    }

    /// World-space box the emitter couples into.
    #[must_use]
    pub fn world_bounds(&self) -> Aabb {
        Aabb::from_unit_cube_transform(self.bounds)
    }

    /// World-space box the emitter requests allocation for.
    ///
    /// Grows with `allocation_scale` and extends along the predicted motion.
    #[must_use]
    pub fn alloc_bounds(&self) -> Aabb {
        let bounds = self.world_bounds();
        let scaled = Aabb::from_center_half_size(bounds.center(), bounds.half_size() * self.allocation_scale);
        let shift = self.velocity_linear * self.allocation_predict;
        Aabb::new(scaled.min.min(scaled.min + shift), scaled.max.max(scaled.max + shift))
    }

    /// Whether this record requests block allocation.
    #[must_use]
    pub const fn allocates(&self) -> bool {
        !self.emit_mode.contains(EmitMode::DISABLE_ALLOC)
    }
}

/// Colliders use the emitter layout; they typically couple velocity only.
pub type CollideParams = EmitParams;
