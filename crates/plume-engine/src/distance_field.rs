//! Mesh distance fields shared by every scene of a context.
//!
//! Fields are uploaded once per mesh and looked up by [`MeshKey`]. A scene
//! resolves the keys its snapshot references into a per-frame list that
//! `ShapeDesc::Sdf { sdf_index }` indexes. Fields no scene references are
//! dropped at the end of the frame.

use ahash::{AHashMap, AHashSet};
use glam::{Vec3, Vec4};
use plume_common::{Arena, GridError, Handle};
use plume_kernel::{CollideParams, EmitCustomEmit, EmitCustomEmitParams, ShapeDesc, ShapeSdf};
use tracing::debug;

use crate::properties::{DistanceFieldProperties, MeshKey};

/// Handle to a decoded field.
pub type SdfHandle = Handle<ShapeSdf>;

/// Decoded fields by mesh.
#[derive(Debug, Default)]
pub struct SdfRegistry {
    fields: Arena<ShapeSdf>,
    by_mesh: AHashMap<MeshKey, SdfHandle>,
}

impl SdfRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes and stores a field, replacing any earlier one for the mesh.
    pub fn insert(&mut self, field: &DistanceFieldProperties) -> Result<SdfHandle, GridError> {
        let sdf = ShapeSdf::decode(field.size, field.format, &field.data)?;
        if let Some(old) = self.by_mesh.remove(&field.mesh) {
            self.fields.remove(old);
        }
        let handle = self.fields.insert(sdf);
        debug!("Uploaded distance field for {} ({})", field.mesh, field.size);
        self.by_mesh.insert(field.mesh, handle);
        Ok(handle)
    }

    /// Field of a mesh.
    #[must_use]
    pub fn handle(&self, mesh: MeshKey) -> Option<SdfHandle> {
        self.by_mesh.get(&mesh).copied()
    }

    /// Borrows a field.
    #[must_use]
    pub fn get(&self, handle: SdfHandle) -> Option<&ShapeSdf> {
        self.fields.get(handle)
    }

    /// Drops every field whose mesh is not in `referenced`.
    pub fn retain_referenced(&mut self, referenced: &AHashSet<MeshKey>) {
        let before = self.by_mesh.len();
        let fields = &mut self.fields;
        self.by_mesh.retain(|mesh, handle| {
            let keep = referenced.contains(mesh);
            if !keep {
                fields.remove(*handle);
            }
            keep
        });
        let dropped = before - self.by_mesh.len();
        if dropped > 0 {
            debug!("Released {dropped} distance fields");
        }
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_mesh.len()
    }

    /// Returns true if no fields are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_mesh.is_empty()
    }
}

/// Stops velocity in blocks whose centers lie inside a distance-field collider.
#[derive(Debug)]
pub struct DistanceFieldCollider<'a> {
    colliders: Vec<(CollideParams, &'a ShapeSdf)>,
}

impl<'a> DistanceFieldCollider<'a> {
    /// Collects the `Sdf` colliders whose field is available.
    ///
    /// `fields` is indexed by `sdf_index`.
    #[must_use]
    pub fn new(shapes: &[ShapeDesc], params: &[CollideParams], fields: &[Option<&'a ShapeSdf>]) -> Self {
        let colliders = params
            .iter()
            .filter_map(|p| {
                let shape = shapes.get(p.shape_range_offset as usize)?;
                let ShapeDesc::Sdf { sdf_index } = shape else {
                    return None;
                };
                let sdf = fields.get(*sdf_index as usize).copied().flatten()?;
                Some((*p, sdf))
            })
            .collect();
        Self { colliders }
    }

    /// Returns true if no collider has a field.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.colliders.is_empty()
    }

    fn inside(&self, p: Vec3) -> bool {
        self.colliders.iter().any(|(params, sdf)| {
            let local = params.bounds.inverse().transform_point3(p);
            if local.abs().max_element() > 1.0 {
                return false;
            }
            sdf.sample(local * 0.5 + 0.5) * params.shape_distance_scale < 0.0
        })
    }
}

impl EmitCustomEmit for DistanceFieldCollider<'_> {
    fn emit(&mut self, params: &mut EmitCustomEmitParams<'_>) {
        if self.colliders.is_empty() {
            return;
        }
        let space = params.space;
        let solid: Vec<usize> = params
            .table
            .active_blocks()
            .filter(|b| self.inside(space.block_center(b.coord)))
            .map(|b| b.physical as usize)
            .collect();
        if solid.is_empty() {
            return;
        }
        let mut generation = params.data.begin();
        generation.copy_forward();
        let write = generation.write();
        for slot in solid {
            if let Some(v) = write.get_mut(slot) {
                *v = Vec4::new(0.0, 0.0, 0.0, v.w);
            }
        }
        generation.commit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Mat4, UVec3, Vec2};
    use plume_common::{BlockCoord, BlockDim, GridSpace};
    use plume_kernel::{AllocMask, GridMaterialPool, GridTextureChannel, SparseBlockTable, SwapBuffer};

    fn solid_field(mesh: u64) -> DistanceFieldProperties {
        DistanceFieldProperties::g8(MeshKey(mesh), UVec3::splat(2), Vec2::new(-1.0, 1.0), vec![0; 8])
    }

    #[test]
    fn test_insert_replaces_and_retains() {
        let mut registry = SdfRegistry::new();
        let first = registry.insert(&solid_field(1)).expect("decode");
        let second = registry.insert(&solid_field(1)).expect("decode");
        registry.insert(&solid_field(2)).expect("decode");

        assert!(registry.get(first).is_none());
        assert!(registry.get(second).is_some());
        assert_eq!(registry.len(), 2);

        let referenced: AHashSet<MeshKey> = [MeshKey(2)].into_iter().collect();
        registry.retain_referenced(&referenced);
        assert_eq!(registry.len(), 1);
        assert!(registry.handle(MeshKey(1)).is_none());
        assert!(registry.get(second).is_none());
    }

    #[test]
    fn test_bad_field_is_rejected() {
        let mut registry = SdfRegistry::new();
        let field = DistanceFieldProperties::g8(MeshKey(1), UVec3::splat(2), Vec2::new(0.0, 1.0), vec![0; 3]);
        assert!(registry.insert(&field).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_collider_zeroes_velocity_inside() {
        let mut registry = SdfRegistry::new();
        let handle = registry.insert(&solid_field(1)).expect("decode");
        let fields = [registry.get(handle)];

        let shapes = [ShapeDesc::Sdf { sdf_index: 0 }];
        let mut collide = CollideParams::sphere(Vec3::splat(0.5), 0.5);
        collide.bounds = Mat4::from_scale_rotation_translation(Vec3::splat(0.5), glam::Quat::IDENTITY, Vec3::splat(0.5));
        let mut collider = DistanceFieldCollider::new(&shapes, &[collide], &fields);
        assert!(!collider.is_empty());

        let space = GridSpace::new(Vec3::ZERO, Vec3::ONE, UVec3::splat(32));
        let dim = BlockDim::from_virtual_dim(UVec3::splat(32));
        let mut table = SparseBlockTable::new(dim, 8);
        let mut mask = AllocMask::new(dim);
        mask.request(BlockCoord::new(1, 1, 1));
        mask.request(BlockCoord::new(0, 0, 0));
        let mut budget = 8;
        table.allocate_requested(&mask, &mut budget);
        let inside_slot = table.physical_of(BlockCoord::new(1, 1, 1)).expect("allocated") as usize;
        let outside_slot = table.physical_of(BlockCoord::new(0, 0, 0)).expect("allocated") as usize;

        let mut data = SwapBuffer::new(vec![Vec4::new(1.0, 1.0, 1.0, 0.5); 8], vec![Vec4::ZERO; 8]);
        collider.emit(&mut EmitCustomEmitParams {
            channel: GridTextureChannel::Velocity,
            layer: 0,
            material: GridMaterialPool::new().default_material(),
            space,
            table: &table,
            dt: 1.0 / 60.0,
            data: &mut data,
        });

        assert_eq!(data.front_index(), 1);
        assert_eq!(data.read()[inside_slot], Vec4::new(0.0, 0.0, 0.0, 0.5));
        assert_eq!(data.read()[outside_slot], Vec4::new(1.0, 1.0, 1.0, 0.5));
    }
}
