//! Grid configuration snapshots.
//!
//! The authoring side describes each grid with a [`Properties`] value and
//! bumps its `version` whenever anything changes. Snapshots are immutable
//! once handed over (`Arc<Properties>`); a scene only reprocesses one whose
//! version is newer than the last it saw.

use glam::{UVec3, Vec2, Vec3, Vec4};
use plume_kernel::{
    CollideParams, EmitParams, GridDesc, GridMaterialParams, GridParams, GridTextureChannel, RenderMaterialParams,
    SdfFormat, ShapeDesc, VolumeRenderMode, VolumeShadowDesc,
};
use serde::{Deserialize, Serialize};

use crate::particles::{InteractionChannel, InteractionResponses};

macro_rules! host_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

host_key!(
    /// Host identity of one grid instance.
    GridKey
);
host_key!(
    /// Host identity of a grid material.
    MaterialKey
);
host_key!(
    /// Host identity of a render material within its grid material.
    RenderMaterialKey
);
host_key!(
    /// Host identity of a mesh carrying a distance field.
    MeshKey
);

/// Render settings of one grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderProperties {
    /// Color mode
    pub render_mode: VolumeRenderMode,
    /// Channel ray marched
    pub render_channel: GridTextureChannel,
    /// Draw block wireframes
    pub debug_wireframe: bool,
    /// Ask for depth output when the depth level allows per-grid opt-in
    pub generate_depth: bool,
    /// Minimum alpha that writes depth
    pub depth_alpha_threshold: f32,
    /// Minimum intensity that writes depth
    pub depth_intensity_threshold: f32,
    /// Ray march resolution as a fraction of the view
    pub max_screen_percentage: f32,

    /// Shadow the grid from a light
    pub volume_shadow_enabled: bool,
    /// Lights with this shadow channel are considered
    pub shadow_channel: u32,
    /// Shadow volume allocation
    pub shadow: VolumeShadowDesc,
    /// Directional shadow extent multiplier
    pub shadow_frustum_scale: f32,
    /// Near plane of spot light shadows
    pub shadow_near_distance: f32,
    /// Shadow intensity scale
    pub shadow_intensity_scale: f32,
    /// Minimum shadow intensity
    pub shadow_min_intensity: f32,
    /// Components blended with the shadow
    pub shadow_blend_comp_mask: Vec4,
    /// Blend offset
    pub shadow_blend_bias: f32,
}

impl Default for RenderProperties {
    fn default() -> Self {
        Self {
            render_mode: VolumeRenderMode::Colormap,
            render_channel: GridTextureChannel::Density,
            debug_wireframe: false,
            generate_depth: false,
            depth_alpha_threshold: 0.9,
            depth_intensity_threshold: 4.0,
            max_screen_percentage: 1.0,
            volume_shadow_enabled: false,
            shadow_channel: 0,
            shadow: VolumeShadowDesc::default(),
            shadow_frustum_scale: 1.0,
            shadow_near_distance: 0.1,
            shadow_intensity_scale: 0.5,
            shadow_min_intensity: 0.15,
            shadow_blend_comp_mask: Vec4::ZERO,
            shadow_blend_bias: 0.0,
        }
    }
}

/// One grid material and the render materials drawn with it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterialProperties {
    /// Simulation parameters
    pub grid: GridMaterialParams,
    /// Render materials keyed within this material
    pub render_materials: Vec<(RenderMaterialKey, RenderMaterialParams)>,
}

/// A distance field uploaded for a mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceFieldProperties {
    /// Mesh the field belongs to
    pub mesh: MeshKey,
    /// Samples per axis
    pub size: UVec3,
    /// Source encoding
    pub format: SdfFormat,
    /// Raw samples, x fastest
    pub data: Vec<u8>,
}

impl DistanceFieldProperties {
    /// An 8-bit field covering `distance_min_max.x..=distance_min_max.y`.
    #[must_use]
    pub fn g8(mesh: MeshKey, size: UVec3, distance_min_max: Vec2, data: Vec<u8>) -> Self {
        Self {
            mesh,
            size,
            format: SdfFormat::g8_from_range(distance_min_max.x, distance_min_max.y),
            data,
        }
    }
}

/// Versioned configuration snapshot of one grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Properties {
    /// Bumped by the authoring side on every change
    pub version: u64,
    /// Inactive grids have their scene released
    pub active: bool,
    /// Owner name used in debug output
    pub name: String,
    /// World-space origin of the grid's owner
    pub location: Vec3,

    // === Topology opt-ins ===
    /// Simulate on a dedicated device when available
    pub multi_adapter_enabled: bool,
    /// Simulate on an async compute queue when available
    pub async_compute_enabled: bool,

    // === Grid ===
    /// Grid description; `initial_location` is replaced by `location`
    pub grid_desc: GridDesc,
    /// Simulation parameters
    pub grid_params: GridParams,
    /// Render settings
    pub render: RenderProperties,
    /// Color map entries per render material
    pub color_map_resolution: usize,

    // === Materials ===
    /// Material used by emitters without one
    pub default_material_key: MaterialKey,
    /// Materials in first-use order
    pub materials: Vec<(MaterialKey, MaterialProperties)>,

    // === Per-frame shapes ===
    /// Shapes referenced by `emit_params`
    pub emit_shapes: Vec<ShapeDesc>,
    /// Emitters
    pub emit_params: Vec<EmitParams>,
    /// Material of each emitter; `None` uses the default material
    pub emit_material_keys: Vec<Option<MaterialKey>>,
    /// Shapes referenced by `collide_params`
    pub collide_shapes: Vec<ShapeDesc>,
    /// Colliders
    pub collide_params: Vec<CollideParams>,

    // === Distance fields ===
    /// Fields uploaded since the previous snapshot
    pub new_distance_fields: Vec<DistanceFieldProperties>,
    /// Meshes whose fields `ShapeDesc::Sdf` indices refer to
    pub distance_field_keys: Vec<MeshKey>,
    /// Collide against distance fields during custom emission
    pub distance_field_collision_enabled: bool,

    // === Particles ===
    /// Drive the grid from particle systems only
    pub particle_mode_enabled: bool,
    /// Exchange data with particle systems
    pub particles_interaction_enabled: bool,
    /// Channel particle systems see this grid on
    pub interaction_channel: InteractionChannel,
    /// How this grid responds to each particle channel
    pub responses: InteractionResponses,

    // === Substeps ===
    /// Fixed substep size in seconds; zero disables simulation
    pub substep_size: f32,
    /// Substeps to run for this snapshot
    pub num_scheduled_substeps: u32,
}

impl Default for Properties {
    fn default() -> Self {
        Self {
            version: 1,
            active: true,
            name: String::from("grid"),
            location: Vec3::ZERO,
            multi_adapter_enabled: false,
            async_compute_enabled: false,
            grid_desc: GridDesc::default(),
            grid_params: GridParams::default(),
            render: RenderProperties::default(),
            color_map_resolution: 64,
            default_material_key: MaterialKey(0),
            materials: Vec::new(),
            emit_shapes: Vec::new(),
            emit_params: Vec::new(),
            emit_material_keys: Vec::new(),
            collide_shapes: Vec::new(),
            collide_params: Vec::new(),
            new_distance_fields: Vec::new(),
            distance_field_keys: Vec::new(),
            distance_field_collision_enabled: false,
            particle_mode_enabled: false,
            particles_interaction_enabled: false,
            interaction_channel: InteractionChannel::default(),
            responses: InteractionResponses::default(),
            substep_size: 1.0 / 60.0,
            num_scheduled_substeps: 1,
        }
    }
}

impl Properties {
    /// A snapshot for a named grid with default settings.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds an emitter with its shape and optional material.
    pub fn push_emitter(&mut self, shape: ShapeDesc, mut params: EmitParams, material: Option<MaterialKey>) {
        params.shape_range_offset = self.emit_shapes.len() as u32;
        params.shape_range_size = 1;
        params.shape_type = shape.shape_type();
        self.emit_shapes.push(shape);
        self.emit_params.push(params);
        self.emit_material_keys.push(material);
    }

    /// Adds a collider with its shape.
    pub fn push_collider(&mut self, shape: ShapeDesc, mut params: CollideParams) {
        params.shape_range_offset = self.collide_shapes.len() as u32;
        params.shape_range_size = 1;
        params.shape_type = shape.shape_type();
        self.collide_shapes.push(shape);
        self.collide_params.push(params);
    }

    /// World-space bounds of the grid at `location`.
    #[must_use]
    pub fn bounds(&self) -> plume_common::Aabb {
        plume_common::Aabb::from_center_half_size(self.location, self.grid_desc.half_size)
    }

    /// Material properties of a key.
    #[must_use]
    pub fn material(&self, key: MaterialKey) -> Option<&MaterialProperties> {
        self.materials.iter().find(|(k, _)| *k == key).map(|(_, m)| m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plume_kernel::ShapeType;

    #[test]
    fn test_push_emitter_links_shape_range() {
        let mut props = Properties::named("torch");
        props.push_emitter(ShapeDesc::Sphere { radius: 0.5 }, EmitParams::default(), None);
        props.push_emitter(
            ShapeDesc::Box { half_size: Vec3::ONE },
            EmitParams::default(),
            Some(MaterialKey(3)),
        );

        assert_eq!(props.emit_params[1].shape_range_offset, 1);
        assert_eq!(props.emit_params[1].shape_type, ShapeType::Box);
        assert_eq!(props.emit_material_keys, vec![None, Some(MaterialKey(3))]);
    }

    #[test]
    fn test_key_display() {
        assert_eq!(GridKey(7).to_string(), "GridKey#7");
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut props = Properties::named("smoke");
        props.materials.push((MaterialKey(0), MaterialProperties::default()));
        let text = toml::to_string(&props).expect("serialize");
        let back: Properties = toml::from_str(&text).expect("parse");
        assert_eq!(back.name, "smoke");
        assert_eq!(back.materials.len(), 1);
    }
}
