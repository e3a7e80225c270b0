//! Grid exports.
//!
//! A [`GridExport`] is an immutable snapshot of one simulation generation:
//! per channel and per layer it exposes the block mapping and the channel
//! data. Exports are shared through `Arc`, so consumers on other queues or
//! devices hold a generation alive for as long as they read it.

use std::sync::Arc;

use glam::Vec4;
use plume_common::GridSpace;

use crate::block_table::{ActiveBlock, SparseBlockTable};
use crate::grid::GridId;
use crate::material::GridMaterialHandle;

/// Per-physical-block channel data of one layer.
pub type ChannelData = Vec<Vec4>;

/// Texture channels a grid exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum GridTextureChannel {
    /// Velocity, `(vx, vy, vz, _)`
    Velocity,
    /// Density, `(temperature, fuel, burn, smoke)`
    Density,
    /// Reduced-resolution density; shares the density mapping
    DensityCoarse,
}

/// Block mapping of one layer, shared by all channels of that layer.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockMapping {
    /// Virtual linear index to physical slot or [`crate::block_table::UNALLOCATED`]
    pub block_table: Arc<[u32]>,
    /// Active blocks in ascending physical slot order
    pub block_list: Arc<[ActiveBlock]>,
}

impl BlockMapping {
    /// Snapshots a table.
    #[must_use]
    pub fn capture(table: &SparseBlockTable) -> Self {
        Self {
            block_table: table.table().into(),
            block_list: table.active_blocks().collect(),
        }
    }

    /// Number of active blocks.
    #[must_use]
    pub fn num_blocks(&self) -> u32 {
        self.block_list.len() as u32
    }
}

/// One layer of one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct GridExportLayer {
    /// Material simulated in this layer
    pub material: GridMaterialHandle,
    /// Block mapping
    pub mapping: Arc<BlockMapping>,
    /// Channel data, indexed by physical slot
    pub data: Arc<[Vec4]>,
}

impl GridExportLayer {
    /// Data of the block at a virtual linear index, if allocated.
    #[must_use]
    pub fn sample(&self, virtual_index: u32) -> Option<Vec4> {
        let slot = *self.mapping.block_table.get(virtual_index as usize)?;
        self.data.get(slot as usize).copied()
    }
}

/// Read-only snapshot of one grid generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GridExport {
    grid: GridId,
    version: u64,
    space: GridSpace,
    max_blocks: u32,
    velocity: Vec<GridExportLayer>,
    density: Vec<GridExportLayer>,
}

impl GridExport {
    /// Assembles an export from per-layer parts.
    #[must_use]
    pub fn new(
        grid: GridId,
        version: u64,
        space: GridSpace,
        max_blocks: u32,
        velocity: Vec<GridExportLayer>,
        density: Vec<GridExportLayer>,
    ) -> Self {
        Self {
            grid,
            version,
            space,
            max_blocks,
            velocity,
            density,
        }
    }

    /// An export with no layers.
    #[must_use]
    pub fn empty(grid: GridId, space: GridSpace, max_blocks: u32) -> Self {
        Self::new(grid, 0, space, max_blocks, Vec::new(), Vec::new())
    }

    /// Grid that produced this export.
    #[must_use]
    pub const fn grid(&self) -> GridId {
        self.grid
    }

    /// Generation counter.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Grid placement at this generation.
    #[must_use]
    pub const fn space(&self) -> &GridSpace {
        &self.space
    }

    /// Physical block budget shared by all layers.
    #[must_use]
    pub const fn max_blocks(&self) -> u32 {
        self.max_blocks
    }

    /// Layers of a channel.
    #[must_use]
    pub fn layers(&self, channel: GridTextureChannel) -> &[GridExportLayer] {
        match channel {
            GridTextureChannel::Velocity => &self.velocity,
            GridTextureChannel::Density | GridTextureChannel::DensityCoarse => &self.density,
        }
    }

    /// Number of layers.
    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.velocity.len()
    }

    /// Active blocks of a channel summed over layers.
    #[must_use]
    pub fn num_blocks(&self, channel: GridTextureChannel) -> u32 {
        self.layers(channel).iter().map(|l| l.mapping.num_blocks()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_table::AllocMask;
    use glam::{UVec3, Vec3};
    use crate::material::GridMaterialPool;
    use plume_common::BlockCoord;

    #[test]
    fn test_layer_sampling() {
        let space = GridSpace::new(Vec3::ZERO, Vec3::ONE, UVec3::splat(32));
        let mut table = SparseBlockTable::new(space.blocks(), 4);
        let mut mask = AllocMask::new(space.blocks());
        mask.request(BlockCoord::new(1, 1, 1));
        let mut budget = 4;
        table.allocate_requested(&mask, &mut budget);

        let mapping = Arc::new(BlockMapping::capture(&table));
        let mut data = vec![Vec4::ZERO; 4];
        data[0] = Vec4::ONE;
        let layer = GridExportLayer {
            material: GridMaterialPool::new().default_material(),
            mapping,
            data: data.into(),
        };
        let export = GridExport::new(GridId::from_raw(1), 3, space, 4, vec![layer.clone()], vec![layer]);

        let index = space.blocks().linear_index(BlockCoord::new(1, 1, 1));
        assert_eq!(export.layers(GridTextureChannel::Velocity)[0].sample(index), Some(Vec4::ONE));
        assert_eq!(export.layers(GridTextureChannel::Density)[0].sample(0), None);
        assert_eq!(export.num_blocks(GridTextureChannel::DensityCoarse), 1);
        assert_eq!(export.version(), 3);
    }
}
