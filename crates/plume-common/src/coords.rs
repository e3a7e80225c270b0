//! Coordinate types for the sparse virtual grid.
//!
//! The virtual grid is a dense box of cells, partitioned into fixed-size
//! blocks. Blocks are the unit of physical allocation, so most of the
//! scheduling layer works in block coordinates rather than cells.

use bytemuck::{Pod, Zeroable};
use glam::{IVec3, Mat4, UVec3, Vec3};
use serde::{Deserialize, Serialize};

/// Edge length of one virtual block, in cells.
pub const BLOCK_DIM: UVec3 = UVec3::new(16, 16, 16);

/// Coordinate of a block in the virtual block grid.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize, Pod, Zeroable,
)]
#[repr(C)]
pub struct BlockCoord {
    /// X block index
    pub x: u32,
    /// Y block index
    pub y: u32,
    /// Z block index
    pub z: u32,
}

impl BlockCoord {
    /// Creates a new block coordinate.
    #[must_use]
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Returns the coordinate as a signed vector, for neighbor arithmetic.
    #[must_use]
    pub const fn as_ivec3(self) -> IVec3 {
        IVec3::new(self.x as i32, self.y as i32, self.z as i32)
    }
}

/// Dimensions of the virtual block grid, in blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockDim {
    /// Blocks along X
    pub x: u32,
    /// Blocks along Y
    pub y: u32,
    /// Blocks along Z
    pub z: u32,
}

impl BlockDim {
    /// Creates block dimensions directly.
    #[must_use]
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Derives the block grid covering a virtual cell resolution.
    ///
    /// Partial blocks round up; every axis has at least one block.
    #[must_use]
    pub fn from_virtual_dim(virtual_dim: UVec3) -> Self {
        let blocks = UVec3::new(
            virtual_dim.x.div_ceil(BLOCK_DIM.x),
            virtual_dim.y.div_ceil(BLOCK_DIM.y),
            virtual_dim.z.div_ceil(BLOCK_DIM.z),
        )
        .max(UVec3::ONE);
        Self::new(blocks.x, blocks.y, blocks.z)
    }

    /// Total number of virtual blocks, or `None` if it does not fit in a `u32`.
    #[must_use]
    pub const fn checked_total(self) -> Option<u32> {
        match self.x.checked_mul(self.y) {
            Some(xy) => xy.checked_mul(self.z),
            None => None,
        }
    }

    /// Total number of virtual blocks, saturating at `u32::MAX`.
    #[must_use]
    pub const fn total(self) -> u32 {
        match self.checked_total() {
            Some(total) => total,
            None => u32::MAX,
        }
    }

    /// Returns the dimensions as a vector.
    #[must_use]
    pub const fn as_uvec3(self) -> UVec3 {
        UVec3::new(self.x, self.y, self.z)
    }

    /// Returns the block at a signed coordinate, if it lies inside the grid.
    #[must_use]
    pub fn checked_coord(self, c: IVec3) -> Option<BlockCoord> {
        let inside = c.x >= 0
            && c.y >= 0
            && c.z >= 0
            && (c.x as u32) < self.x
            && (c.y as u32) < self.y
            && (c.z as u32) < self.z;
        inside.then(|| BlockCoord::new(c.x as u32, c.y as u32, c.z as u32))
    }

    /// Linear index of a block (x fastest).
    #[must_use]
    pub const fn linear_index(self, c: BlockCoord) -> u32 {
        c.x + self.x * (c.y + self.y * c.z)
    }

    /// Inverse of [`Self::linear_index`].
    #[must_use]
    pub const fn coord_of(self, index: u32) -> BlockCoord {
        let x = index % self.x;
        let y = (index / self.x) % self.y;
        let z = index / (self.x * self.y);
        BlockCoord::new(x, y, z)
    }
}

/// Axis-aligned bounding box in world space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    /// Minimum corner
    pub min: Vec3,
    /// Maximum corner
    pub max: Vec3,
}

impl Aabb {
    /// Creates a box from its corners.
    #[must_use]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Creates a box from a center and half extents.
    #[must_use]
    pub fn from_center_half_size(center: Vec3, half_size: Vec3) -> Self {
        Self::new(center - half_size, center + half_size)
    }

    /// Bounds of the unit cube `[-1, 1]^3` after an affine transform.
    ///
    /// Emitter and collider bounds are authored this way.
    #[must_use]
    pub fn from_unit_cube_transform(transform: Mat4) -> Self {
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        for i in 0..8 {
            let corner = Vec3::new(
                if i & 1 == 0 { -1.0 } else { 1.0 },
                if i & 2 == 0 { -1.0 } else { 1.0 },
                if i & 4 == 0 { -1.0 } else { 1.0 },
            );
            let p = transform.transform_point3(corner);
            min = min.min(p);
            max = max.max(p);
        }
        Self::new(min, max)
    }

    /// Center point.
    #[must_use]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Half extents.
    #[must_use]
    pub fn half_size(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    /// Scales the box about its center.
    #[must_use]
    pub fn scaled(&self, scale: f32) -> Self {
        Self::from_center_half_size(self.center(), self.half_size() * scale)
    }

    /// Returns true if the boxes overlap (touching counts).
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.min.cmple(other.max).all() && other.min.cmple(self.max).all()
    }

    /// Returns true if the point lies inside or on the box.
    #[must_use]
    pub fn contains_point(&self, p: Vec3) -> bool {
        self.min.cmple(p).all() && p.cmple(self.max).all()
    }
}

/// Mapping between world space and the virtual block grid of one grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpace {
    location: Vec3,
    half_size: Vec3,
    blocks: BlockDim,
}

impl GridSpace {
    /// Creates a grid space from the grid's world box and virtual cell resolution.
    #[must_use]
    pub fn new(location: Vec3, half_size: Vec3, virtual_dim: UVec3) -> Self {
        Self {
            location,
            half_size,
            blocks: BlockDim::from_virtual_dim(virtual_dim),
        }
    }

    /// World-space center of the grid.
    #[must_use]
    pub const fn location(&self) -> Vec3 {
        self.location
    }

    /// World-space half extents of the grid.
    #[must_use]
    pub const fn half_size(&self) -> Vec3 {
        self.half_size
    }

    /// Block grid dimensions.
    #[must_use]
    pub const fn blocks(&self) -> BlockDim {
        self.blocks
    }

    /// Returns a copy centered somewhere else.
    #[must_use]
    pub fn with_location(mut self, location: Vec3) -> Self {
        self.location = location;
        self
    }

    /// World-space bounds of the whole grid.
    #[must_use]
    pub fn bounds(&self) -> Aabb {
        Aabb::from_center_half_size(self.location, self.half_size)
    }

    /// World-space size of one block.
    #[must_use]
    pub fn block_size(&self) -> Vec3 {
        self.half_size * 2.0 / self.blocks.as_uvec3().as_vec3()
    }

    /// Block containing a world-space point.
    #[must_use]
    pub fn block_of_point(&self, p: Vec3) -> Option<BlockCoord> {
        let rel = (p - self.bounds().min) / self.block_size();
        self.blocks.checked_coord(rel.floor().as_ivec3())
    }

    /// Inclusive block range overlapped by a world-space box, clipped to the grid.
    ///
    /// Returns `None` when the box misses the grid entirely.
    #[must_use]
    pub fn block_range(&self, aabb: &Aabb) -> Option<(BlockCoord, BlockCoord)> {
        if !self.bounds().intersects(aabb) {
            return None;
        }
        let origin = self.bounds().min;
        let size = self.block_size();
        let last = self.blocks.as_uvec3().as_ivec3() - IVec3::ONE;
        let lo = ((aabb.min - origin) / size).floor().as_ivec3().clamp(IVec3::ZERO, last);
        let hi = ((aabb.max - origin) / size).floor().as_ivec3().clamp(IVec3::ZERO, last);
        let lo = self.blocks.checked_coord(lo)?;
        let hi = self.blocks.checked_coord(hi)?;
        Some((lo, hi))
    }

    /// World-space center of a block.
    #[must_use]
    pub fn block_center(&self, c: BlockCoord) -> Vec3 {
        self.bounds().min + (c.as_ivec3().as_vec3() + Vec3::splat(0.5)) * self.block_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_block_dim_rounds_up() {
        assert_eq!(BlockDim::from_virtual_dim(UVec3::new(64, 40, 1)), BlockDim::new(4, 3, 1));
        assert_eq!(BlockDim::from_virtual_dim(UVec3::ZERO), BlockDim::new(1, 1, 1));
        assert_eq!(BlockDim::from_virtual_dim(UVec3::splat(512)).total(), 32 * 32 * 32);
        assert_eq!(BlockDim::from_virtual_dim(UVec3::splat(u32::MAX)).x, u32::MAX / 16 + 1);
    }

    #[test]
    fn test_block_total_overflow() {
        let huge = BlockDim::from_virtual_dim(UVec3::splat(1 << 16));
        assert_eq!(huge.checked_total(), None);
        assert_eq!(huge.total(), u32::MAX);
        assert_eq!(BlockDim::new(4, 3, 2).checked_total(), Some(24));
    }

    #[test]
    fn test_unit_cube_transform() {
        let m = Mat4::from_scale_rotation_translation(
            Vec3::splat(2.0),
            glam::Quat::IDENTITY,
            Vec3::new(1.0, 0.0, 0.0),
        );
        let aabb = Aabb::from_unit_cube_transform(m);
        assert_eq!(aabb.min, Vec3::new(-1.0, -2.0, -2.0));
        assert_eq!(aabb.max, Vec3::new(3.0, 2.0, 2.0));
    }

    #[test]
    fn test_block_range_clips_to_grid() {
        let space = GridSpace::new(Vec3::ZERO, Vec3::splat(2.0), UVec3::splat(64));
        let inside = Aabb::from_center_half_size(Vec3::ZERO, Vec3::splat(0.1));
        assert_eq!(
            space.block_range(&inside),
            Some((BlockCoord::new(1, 1, 1), BlockCoord::new(2, 2, 2)))
        );

        let huge = Aabb::from_center_half_size(Vec3::ZERO, Vec3::splat(100.0));
        assert_eq!(
            space.block_range(&huge),
            Some((BlockCoord::new(0, 0, 0), BlockCoord::new(3, 3, 3)))
        );

        let outside = Aabb::from_center_half_size(Vec3::splat(10.0), Vec3::splat(0.5));
        assert_eq!(space.block_range(&outside), None);
    }

    proptest! {
        #[test]
        fn prop_linear_index_roundtrip(x in 1u32..20, y in 1u32..20, z in 1u32..20, seed in 0u32..8000) {
            let dim = BlockDim::new(x, y, z);
            let index = seed % dim.total();
            prop_assert_eq!(dim.linear_index(dim.coord_of(index)), index);
        }

        #[test]
        fn prop_block_of_point_stays_in_range(px in -1.0f32..1.0, py in -1.0f32..1.0, pz in -1.0f32..1.0) {
            let space = GridSpace::new(Vec3::ZERO, Vec3::ONE, UVec3::splat(128));
            let c = space.block_of_point(Vec3::new(px, py, pz));
            prop_assert!(c.is_some());
            let c = c.unwrap_or_default();
            prop_assert!(c.x < 8 && c.y < 8 && c.z < 8);
        }
    }
}
