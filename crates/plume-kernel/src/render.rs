//! Render-side bookkeeping: render materials, volume rendering, and volume
//! shadows.
//!
//! Ray marching itself is an external kernel. These types decide which
//! passes run against which export generation and record them as
//! [`GpuCommand::VolumeRender`] and [`GpuCommand::ShadowUpdate`] commands.

use std::collections::BTreeSet;
use std::sync::Arc;

use glam::{Mat4, Vec4};
use plume_common::{Arena, GridError, Handle, BLOCK_DIM};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{GpuCommand, RenderPass};
use crate::device::DeviceQueue;
use crate::export::{GridExport, GridTextureChannel};
use crate::material::GridMaterialHandle;

/// How sampled values are turned into color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VolumeRenderMode {
    /// Color map lookup
    #[default]
    Colormap,
    /// Sampled value is RGBA
    Raw,
    /// Single component as a rainbow
    Rainbow,
    /// XYZ components as color
    Debug,
}

/// Per-material render parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderMaterialParams {
    /// Grid material these parameters apply to, `None` for the default material
    #[serde(skip)]
    pub material: Option<GridMaterialHandle>,
    /// Alpha scale applied after saturation
    pub alpha_scale: f32,
    /// 1.0 blends fully additive
    pub additive_factor: f32,
    /// Component driving the color map X axis
    pub color_map_comp_mask: Vec4,
    /// Components modulating alpha
    pub alpha_comp_mask: Vec4,
    /// Components modulating intensity
    pub intensity_comp_mask: Vec4,
    /// Value mapped to color map u = 0
    pub color_map_min_x: f32,
    /// Value mapped to color map u = 1
    pub color_map_max_x: f32,
    /// Alpha offset before saturation
    pub alpha_bias: f32,
    /// Intensity offset
    pub intensity_bias: f32,
    /// Color map entries; resampled to the pool resolution on upload
    pub color_map: Vec<Vec4>,
}

impl Default for RenderMaterialParams {
    fn default() -> Self {
        Self {
            material: None,
            alpha_scale: 1.0,
            additive_factor: 0.0,
            color_map_comp_mask: Vec4::new(1.0, 0.0, 0.0, 0.0),
            alpha_comp_mask: Vec4::new(0.0, 0.0, 0.0, 1.0),
            intensity_comp_mask: Vec4::new(0.0, 1.0, 0.0, 0.0),
            color_map_min_x: 0.0,
            color_map_max_x: 1.0,
            alpha_bias: 0.0,
            intensity_bias: 1.0,
            color_map: Vec::new(),
        }
    }
}

/// A render material stored in a pool.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderMaterial {
    params: RenderMaterialParams,
    color_map: Vec<Vec4>,
}

impl RenderMaterial {
    /// Current parameters.
    #[must_use]
    pub const fn params(&self) -> &RenderMaterialParams {
        &self.params
    }

    /// Uploaded color map, one entry per pool resolution step.
    #[must_use]
    pub fn color_map(&self) -> &[Vec4] {
        &self.color_map
    }
}

/// Handle to a render material.
pub type RenderMaterialHandle = Handle<RenderMaterial>;

/// Pool of render materials sharing one color map resolution.
#[derive(Debug)]
pub struct RenderMaterialPool {
    arena: Arena<RenderMaterial>,
    color_map_resolution: usize,
}

impl RenderMaterialPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new(color_map_resolution: usize) -> Self {
        Self {
            arena: Arena::new(),
            color_map_resolution: color_map_resolution.max(1),
        }
    }

    /// Color map entries per material.
    #[must_use]
    pub const fn color_map_resolution(&self) -> usize {
        self.color_map_resolution
    }

    /// Creates a material with a transparent color map.
    pub fn create(&mut self, params: RenderMaterialParams) -> RenderMaterialHandle {
        let color_map = vec![Vec4::ZERO; self.color_map_resolution];
        let handle = self.arena.insert(RenderMaterial { params, color_map });
        debug!("Created render material {handle:?}");
        handle
    }

    /// Replaces a material's parameters.
    pub fn update(&mut self, handle: RenderMaterialHandle, params: RenderMaterialParams) -> Result<(), GridError> {
        let material = self.arena.get_mut(handle).ok_or(GridError::UnknownRenderMaterial)?;
        material.params = params;
        Ok(())
    }

    /// Uploads a color map. Its length must equal the pool resolution.
    pub fn set_color_map(&mut self, handle: RenderMaterialHandle, color_map: &[Vec4]) -> Result<(), GridError> {
        if color_map.len() != self.color_map_resolution {
            return Err(GridError::ColorMapSizeMismatch {
                expected: self.color_map_resolution,
                actual: color_map.len(),
            });
        }
        let material = self.arena.get_mut(handle).ok_or(GridError::UnknownRenderMaterial)?;
        material.color_map.copy_from_slice(color_map);
        Ok(())
    }

    /// Releases a material.
    pub fn release(&mut self, handle: RenderMaterialHandle) -> bool {
        self.arena.remove(handle).is_some()
    }

    /// Borrows a material.
    #[must_use]
    pub fn get(&self, handle: RenderMaterialHandle) -> Option<&RenderMaterial> {
        self.arena.get(handle)
    }

    /// Materials bound to a grid material.
    pub fn for_material(&self, material: GridMaterialHandle) -> impl Iterator<Item = RenderMaterialHandle> + '_ {
        self.arena
            .iter()
            .filter(move |(_, m)| m.params.material == Some(material))
            .map(|(h, _)| h)
    }

    /// Number of live materials.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.arena.len()
    }

    /// Returns true if the pool is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

/// Per-frame volume render parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeRenderParams {
    /// Color mode
    pub render_mode: VolumeRenderMode,
    /// Channel ray marched
    pub render_channel: GridTextureChannel,
    /// Draw block wireframes
    pub debug_mode: bool,
    /// Fraction of full ray march resolution
    pub screen_percentage: f32,
    /// Do everything except the color composite
    pub pre_color_composite_only: bool,
    /// Only apply the color composite
    pub color_composite_only: bool,
    /// Write nominal depth to the scene depth buffer
    pub generate_depth: bool,
    /// Visualize the depth estimate
    pub generate_depth_debug_mode: bool,
    /// Minimum alpha that writes depth
    pub depth_alpha_threshold: f32,
    /// Minimum intensity that writes depth
    pub depth_intensity_threshold: f32,
}

impl Default for VolumeRenderParams {
    fn default() -> Self {
        Self {
            render_mode: VolumeRenderMode::Colormap,
            render_channel: GridTextureChannel::Density,
            debug_mode: false,
            screen_percentage: 1.0,
            pre_color_composite_only: false,
            color_composite_only: false,
            generate_depth: false,
            generate_depth_debug_mode: false,
            depth_alpha_threshold: 0.9,
            depth_intensity_threshold: 4.0,
        }
    }
}

/// Records ray march passes for one grid.
#[derive(Debug, Default)]
pub struct VolumeRender {
    color_passes: u64,
    depth_passes: u64,
    last_version: Option<u64>,
}

impl VolumeRender {
    /// Creates a renderer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a color pass.
    ///
    /// With `color_composite_only` the pass only composites color produced by
    /// an earlier [`Self::render_depth`].
    pub fn render(&mut self, queue: &mut DeviceQueue, export: &GridExport, params: &VolumeRenderParams) {
        queue.record(GpuCommand::VolumeRender {
            grid: export.grid(),
            version: export.version(),
            pass: RenderPass::Color {
                color_composite_only: params.color_composite_only,
            },
        });
        self.color_passes += 1;
        self.last_version = Some(export.version());
    }

    /// Records a depth pre-composite pass. Returns false, recording nothing,
    /// when the parameters do not generate depth.
    pub fn render_depth(&mut self, queue: &mut DeviceQueue, export: &GridExport, params: &VolumeRenderParams) -> bool {
        if !params.generate_depth {
            return false;
        }
        queue.record(GpuCommand::VolumeRender {
            grid: export.grid(),
            version: export.version(),
            pass: RenderPass::Depth,
        });
        self.depth_passes += 1;
        true
    }

    /// Color passes recorded.
    #[must_use]
    pub const fn color_passes(&self) -> u64 {
        self.color_passes
    }

    /// Depth passes recorded.
    #[must_use]
    pub const fn depth_passes(&self) -> u64 {
        self.depth_passes
    }

    /// Export version of the latest color pass.
    #[must_use]
    pub const fn last_version(&self) -> Option<u64> {
        self.last_version
    }
}

/// Volume shadow allocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeShadowDesc {
    /// Shadow map resolution along each axis
    pub resolution: u32,
    /// Minimum resident fraction
    pub min_resident_scale: f32,
    /// Maximum resident fraction
    pub max_resident_scale: f32,
}

impl Default for VolumeShadowDesc {
    fn default() -> Self {
        Self {
            resolution: 256,
            min_resident_scale: 0.25 * 0.125,
            max_resident_scale: 0.25,
        }
    }
}

/// Per-frame shadow parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeShadowParams {
    /// Light view matrix
    pub view: Mat4,
    /// Light projection matrix
    pub projection: Mat4,
    /// Color mode used to evaluate opacity
    pub render_mode: VolumeRenderMode,
    /// Channel shadowed
    pub render_channel: GridTextureChannel,
    /// Shadow intensity scale
    pub intensity_scale: f32,
    /// Minimum shadow intensity
    pub min_intensity: f32,
    /// Components blended with the shadow
    pub shadow_blend_comp_mask: Vec4,
    /// Blend offset
    pub shadow_blend_bias: f32,
}

impl Default for VolumeShadowParams {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            render_mode: VolumeRenderMode::Colormap,
            render_channel: GridTextureChannel::Density,
            intensity_scale: 0.5,
            min_intensity: 0.15,
            shadow_blend_comp_mask: Vec4::ZERO,
            shadow_blend_bias: 0.0,
        }
    }
}

/// Shadow coverage after the latest update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShadowStats {
    /// Light-space columns touched
    pub shadow_columns: u32,
    /// Grid blocks inside the shadow frustum
    pub shadow_blocks_active: u32,
    /// Cells of those blocks
    pub shadow_cells_active: u64,
}

/// Volume shadow for one grid.
#[derive(Debug)]
pub struct VolumeShadow {
    desc: VolumeShadowDesc,
    stats: ShadowStats,
    updates: u64,
}

impl VolumeShadow {
    /// Allocates a shadow volume.
    #[must_use]
    pub fn new(desc: VolumeShadowDesc) -> Self {
        debug!("Creating volume shadow ({}^3)", desc.resolution);
        Self {
            desc,
            stats: ShadowStats::default(),
            updates: 0,
        }
    }

    /// Allocation parameters.
    #[must_use]
    pub const fn desc(&self) -> &VolumeShadowDesc {
        &self.desc
    }

    /// Whether a shadow built for `desc` must be recreated.
    #[must_use]
    pub fn needs_recreate(&self, desc: &VolumeShadowDesc) -> bool {
        self.desc != *desc
    }

    /// Shadows `export` from the light described by `params`.
    ///
    /// Returns the export to render with. Lighting is applied in place by the
    /// external kernel, so the generation is unchanged.
    pub fn update(
        &mut self,
        queue: &mut DeviceQueue,
        export: &Arc<GridExport>,
        params: &VolumeShadowParams,
    ) -> Arc<GridExport> {
        let clip = params.projection * params.view;
        let space = export.space();
        let resolution = self.desc.resolution.max(1) as f32;
        let mut columns = BTreeSet::new();
        let mut blocks = 0u32;
        for layer in export.layers(params.render_channel) {
            for block in layer.mapping.block_list.iter() {
                let p = clip.project_point3(space.block_center(block.coord));
                let inside = p.x.abs() <= 1.0 && p.y.abs() <= 1.0 && (0.0..=1.0).contains(&p.z);
                if !inside {
                    continue;
                }
                blocks += 1;
                let column = ((p.truncate() * 0.5 + 0.5) * resolution / BLOCK_DIM.x as f32).as_uvec2();
                columns.insert((column.x, column.y));
            }
        }
        self.stats = ShadowStats {
            shadow_columns: columns.len() as u32,
            shadow_blocks_active: blocks,
            shadow_cells_active: u64::from(blocks) * u64::from(BLOCK_DIM.x * BLOCK_DIM.y * BLOCK_DIM.z),
        };
        queue.record(GpuCommand::ShadowUpdate {
            grid: export.grid(),
            version: export.version(),
            blocks,
        });
        self.updates += 1;
        Arc::clone(export)
    }

    /// Records a debug overlay of the shadow volume.
    pub fn debug_render(&self, queue: &mut DeviceQueue, export: &GridExport) {
        queue.record(GpuCommand::VolumeRender {
            grid: export.grid(),
            version: export.version(),
            pass: RenderPass::ShadowDebug,
        });
    }

    /// Coverage after the latest update.
    #[must_use]
    pub const fn stats(&self) -> ShadowStats {
        self.stats
    }

    /// Updates recorded.
    #[must_use]
    pub const fn updates(&self) -> u64 {
        self.updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HostBackend, QueueKind};
    use crate::block_table::{AllocMask, SparseBlockTable};
    use crate::export::{BlockMapping, GridExportLayer};
    use crate::grid::GridId;
    use crate::material::GridMaterialPool;
    use crate::software::{SoftwareHost, SoftwareHostDesc};
    use glam::{UVec3, Vec3};
    use plume_common::{BlockCoord, GridSpace};

    fn queue() -> DeviceQueue {
        let host = SoftwareHost::new(SoftwareHostDesc::default());
        DeviceQueue::new("render", QueueKind::Graphics, false, host.render_queue())
    }

    fn export_with_blocks(coords: &[BlockCoord]) -> Arc<GridExport> {
        let space = GridSpace::new(Vec3::ZERO, Vec3::ONE, UVec3::splat(64));
        let mut table = SparseBlockTable::new(space.blocks(), 16);
        let mut mask = AllocMask::new(space.blocks());
        for &c in coords {
            mask.request(c);
        }
        let mut budget = 16;
        table.allocate_requested(&mask, &mut budget);
        let layer = GridExportLayer {
            material: GridMaterialPool::new().default_material(),
            mapping: Arc::new(BlockMapping::capture(&table)),
            data: vec![Vec4::ONE; 16].into(),
        };
        Arc::new(GridExport::new(GridId::from_raw(3), 9, space, 16, vec![layer.clone()], vec![layer]))
    }

    #[test]
    fn test_color_map_size_checked() {
        let mut pool = RenderMaterialPool::new(4);
        let handle = pool.create(RenderMaterialParams::default());
        assert!(pool.set_color_map(handle, &[Vec4::ONE; 3]).is_err());
        pool.set_color_map(handle, &[Vec4::ONE; 4]).expect("resolution matches");
        assert_eq!(pool.get(handle).expect("live").color_map()[3], Vec4::ONE);

        assert!(pool.release(handle));
        assert!(pool.update(handle, RenderMaterialParams::default()).is_err());
    }

    #[test]
    fn test_materials_by_grid_material() {
        let grid_materials = GridMaterialPool::new();
        let mut pool = RenderMaterialPool::new(8);
        let bound = pool.create(RenderMaterialParams {
            material: Some(grid_materials.default_material()),
            ..RenderMaterialParams::default()
        });
        pool.create(RenderMaterialParams::default());
        let found: Vec<_> = pool.for_material(grid_materials.default_material()).collect();
        assert_eq!(found, vec![bound]);
    }

    #[test]
    fn test_depth_pass_only_when_generating_depth() {
        let mut queue = queue();
        let export = export_with_blocks(&[BlockCoord::new(1, 1, 1)]);
        let mut render = VolumeRender::new();
        assert!(!render.render_depth(&mut queue, &export, &VolumeRenderParams::default()));

        let params = VolumeRenderParams {
            generate_depth: true,
            color_composite_only: true,
            ..VolumeRenderParams::default()
        };
        assert!(render.render_depth(&mut queue, &export, &params));
        render.render(&mut queue, &export, &params);
        assert_eq!(
            queue.recorded()[1],
            GpuCommand::VolumeRender {
                grid: GridId::from_raw(3),
                version: 9,
                pass: RenderPass::Color {
                    color_composite_only: true
                },
            }
        );
        assert_eq!(render.last_version(), Some(9));
    }

    #[test]
    fn test_shadow_stats_count_blocks_in_frustum() {
        let mut queue = queue();
        let export = export_with_blocks(&[BlockCoord::new(0, 0, 0), BlockCoord::new(3, 3, 3)]);
        let mut shadow = VolumeShadow::new(VolumeShadowDesc::default());
        let params = VolumeShadowParams {
            projection: Mat4::orthographic_rh(-2.0, 2.0, -2.0, 2.0, -2.0, 2.0),
            ..VolumeShadowParams::default()
        };
        let lit = shadow.update(&mut queue, &export, &params);
        assert_eq!(lit.version(), export.version());
        assert_eq!(shadow.stats().shadow_blocks_active, 2);
        assert_eq!(shadow.stats().shadow_columns, 2);
        assert_eq!(shadow.stats().shadow_cells_active, 2 * 4096);
        assert!(!shadow.needs_recreate(&VolumeShadowDesc::default()));
        assert!(shadow.needs_recreate(&VolumeShadowDesc {
            resolution: 128,
            ..VolumeShadowDesc::default()
        }));
    }
}
