//! Sparse virtual-to-physical block table.
//!
//! The table maps every virtual block either to [`UNALLOCATED`] or to a
//! physical slot, and the reverse list maps every physical slot back to its
//! virtual coordinate. Allocation requests are collected in an
//! [`AllocMask`] and applied once per step:
//!
//! 1. Active blocks that were neither requested nor significant age by one
//!    step; blocks idle for longer than the hysteresis window are released.
//! 2. Requested blocks are allocated in ascending virtual index, each taking
//!    the lowest free physical slot, until the shared budget runs out.
//!    Requests beyond the budget are dropped; live blocks are never evicted.
//!
//! Both passes are pure functions of the mask, the significance flags, and
//! the prior table, so identical inputs give bitwise-identical block lists.

use std::collections::BTreeSet;

use glam::IVec3;
use plume_common::{BlockCoord, BlockDim};
use tracing::{debug, trace};

/// Table entry for a virtual block without physical backing.
pub const UNALLOCATED: u32 = u32::MAX;

/// Face neighbors used when growing around significant blocks.
const FACE_NEIGHBORS: [IVec3; 6] = [
    IVec3::new(-1, 0, 0),
    IVec3::new(1, 0, 0),
    IVec3::new(0, -1, 0),
    IVec3::new(0, 1, 0),
    IVec3::new(0, 0, -1),
    IVec3::new(0, 0, 1),
];

/// Per-step allocation requests over the virtual block grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocMask {
    dim: BlockDim,
    requested: Vec<bool>,
}

impl AllocMask {
    /// Creates an empty mask.
    #[must_use]
    pub fn new(dim: BlockDim) -> Self {
        Self {
            dim,
            requested: vec![false; dim.total() as usize],
        }
    }

    /// Block grid dimensions.
    #[must_use]
    pub const fn dim(&self) -> BlockDim {
        self.dim
    }

    /// Requests one block.
    pub fn request(&mut self, c: BlockCoord) {
        let index = self.dim.linear_index(c) as usize;
        self.requested[index] = true;
    }

    /// Requests every block in an inclusive range.
    pub fn request_range(&mut self, lo: BlockCoord, hi: BlockCoord) {
        for z in lo.z..=hi.z {
            for y in lo.y..=hi.y {
                for x in lo.x..=hi.x {
                    self.request(BlockCoord::new(x, y, z));
                }
            }
        }
    }

    /// Requests the face neighbors of a block that lie inside the grid.
    pub fn request_neighbors(&mut self, c: BlockCoord) {
        for offset in FACE_NEIGHBORS {
            if let Some(n) = self.dim.checked_coord(c.as_ivec3() + offset) {
                self.request(n);
            }
        }
    }

    /// Returns true if the block is requested.
    #[must_use]
    pub fn is_requested(&self, c: BlockCoord) -> bool {
        self.requested[self.dim.linear_index(c) as usize]
    }

    /// Number of requested blocks.
    #[must_use]
    pub fn count(&self) -> usize {
        self.requested.iter().filter(|r| **r).count()
    }

    /// Requested blocks in ascending virtual index.
    pub fn iter(&self) -> impl Iterator<Item = BlockCoord> + '_ {
        self.requested
            .iter()
            .enumerate()
            .filter(|(_, r)| **r)
            .map(|(i, _)| self.dim.coord_of(i as u32))
    }

    /// Clears every request.
    pub fn clear(&mut self) {
        self.requested.fill(false);
    }
}

/// One allocated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActiveBlock {
    /// Physical slot
    pub physical: u32,
    /// Virtual coordinate
    pub coord: BlockCoord,
}

/// Result of applying one step of requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationOutcome {
    /// Newly allocated blocks, in allocation order
    pub allocated: Vec<ActiveBlock>,
    /// Requests dropped because the budget was exhausted
    pub dropped: u32,
}

/// Virtual-to-physical mapping for one layer.
#[derive(Debug, Clone)]
pub struct SparseBlockTable {
    dim: BlockDim,
    table: Vec<u32>,
    list: Vec<Option<BlockCoord>>,
    idle_steps: Vec<u32>,
    free: BTreeSet<u32>,
}

impl SparseBlockTable {
    /// Creates an empty table with `capacity` physical slots.
    #[must_use]
    pub fn new(dim: BlockDim, capacity: u32) -> Self {
        Self {
            dim,
            table: vec![UNALLOCATED; dim.total() as usize],
            list: vec![None; capacity as usize],
            idle_steps: vec![0; capacity as usize],
            free: (0..capacity).collect(),
        }
    }

    /// Block grid dimensions.
    #[must_use]
    pub const fn dim(&self) -> BlockDim {
        self.dim
    }

    /// Number of physical slots.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.list.len() as u32
    }

    /// Number of allocated blocks.
    #[must_use]
    pub fn active_count(&self) -> u32 {
        self.capacity() - self.free.len() as u32
    }

    /// Physical slot of a virtual block.
    #[must_use]
    pub fn physical_of(&self, c: BlockCoord) -> Option<u32> {
        let slot = self.table[self.dim.linear_index(c) as usize];
        (slot != UNALLOCATED).then_some(slot)
    }

    /// Virtual coordinate of a physical slot.
    #[must_use]
    pub fn virtual_of(&self, physical: u32) -> Option<BlockCoord> {
        self.list.get(physical as usize).copied().flatten()
    }

    /// Raw table, indexed by virtual linear index.
    #[must_use]
    pub fn table(&self) -> &[u32] {
        &self.table
    }

    /// Allocated blocks in ascending physical slot order.
    pub fn active_blocks(&self) -> impl Iterator<Item = ActiveBlock> + '_ {
        self.list
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.map(|coord| ActiveBlock { physical: i as u32, coord }))
    }

    /// Steps a block has gone without being requested or significant.
    #[must_use]
    pub fn idle_steps(&self, physical: u32) -> u32 {
        self.idle_steps.get(physical as usize).copied().unwrap_or(0)
    }

    fn allocate(&mut self, c: BlockCoord) -> Option<u32> {
        let physical = self.free.pop_first()?;
        self.table[self.dim.linear_index(c) as usize] = physical;
        self.list[physical as usize] = Some(c);
        self.idle_steps[physical as usize] = 0;
        Some(physical)
    }

    fn release(&mut self, physical: u32) {
        if let Some(c) = self.list[physical as usize].take() {
            self.table[self.dim.linear_index(c) as usize] = UNALLOCATED;
            self.idle_steps[physical as usize] = 0;
            self.free.insert(physical);
        }
    }

    /// Ages unreferenced blocks and releases those idle past `hysteresis` steps.
    ///
    /// `significant` is indexed by physical slot. Returns the released slots.
    pub fn retire_idle(&mut self, requests: &AllocMask, significant: &[bool], hysteresis: u32) -> Vec<u32> {
        let mut released = Vec::new();
        for physical in 0..self.capacity() {
            let Some(c) = self.virtual_of(physical) else {
                continue;
            };
            let referenced = requests.is_requested(c) || significant.get(physical as usize).copied().unwrap_or(false);
            let idle = &mut self.idle_steps[physical as usize];
            if referenced {
                *idle = 0;
                continue;
            }
            *idle += 1;
            if *idle > hysteresis {
                trace!("Releasing block {c:?} (slot {physical})");
                released.push(physical);
            }
        }
        for &physical in &released {
            self.release(physical);
        }
        released
    }

    /// Allocates requested blocks while `budget` lasts.
    ///
    /// Already-allocated requests cost nothing. Each new block decrements
    /// `budget`; once it reaches zero further requests are dropped.
    pub fn allocate_requested(&mut self, requests: &AllocMask, budget: &mut u32) -> AllocationOutcome {
        let mut outcome = AllocationOutcome::default();
        for c in requests.iter() {
            if self.physical_of(c).is_some() {
                continue;
            }
            if *budget == 0 {
                outcome.dropped += 1;
                continue;
            }
            match self.allocate(c) {
                Some(physical) => {
                    *budget -= 1;
                    outcome.allocated.push(ActiveBlock { physical, coord: c });
                }
                None => outcome.dropped += 1,
            }
        }
        if outcome.dropped > 0 {
            debug!("Block budget exhausted, dropped {} requests", outcome.dropped);
        }
        outcome
    }

    /// Shifts every block by `-offset` blocks, releasing those that leave the grid.
    ///
    /// Physical slots, and therefore block data, stay put. Returns the released slots.
    pub fn translate(&mut self, offset: IVec3) -> Vec<u32> {
        if offset == IVec3::ZERO {
            return Vec::new();
        }
        self.table.fill(UNALLOCATED);
        let mut released = Vec::new();
        for physical in 0..self.capacity() {
            let Some(c) = self.list[physical as usize] else {
                continue;
            };
            match self.dim.checked_coord(c.as_ivec3() - offset) {
                Some(moved) => {
                    self.list[physical as usize] = Some(moved);
                    self.table[self.dim.linear_index(moved) as usize] = physical;
                }
                None => {
                    self.list[physical as usize] = None;
                    self.idle_steps[physical as usize] = 0;
                    self.free.insert(physical);
                    released.push(physical);
                }
            }
        }
        released
    }

    /// Releases every block.
    pub fn clear(&mut self) {
        self.table.fill(UNALLOCATED);
        self.list.fill(None);
        self.idle_steps.fill(0);
        self.free = (0..self.capacity()).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dim() -> BlockDim {
        BlockDim::new(4, 4, 4)
    }

    #[test]
    fn test_allocation_takes_lowest_slots_in_virtual_order() {
        let mut table = SparseBlockTable::new(dim(), 8);
        let mut mask = AllocMask::new(dim());
        mask.request(BlockCoord::new(3, 0, 0));
        mask.request(BlockCoord::new(1, 0, 0));
        let mut budget = 8;
        let outcome = table.allocate_requested(&mask, &mut budget);

        assert_eq!(outcome.allocated[0].coord, BlockCoord::new(1, 0, 0));
        assert_eq!(outcome.allocated[0].physical, 0);
        assert_eq!(outcome.allocated[1].coord, BlockCoord::new(3, 0, 0));
        assert_eq!(outcome.allocated[1].physical, 1);
        assert_eq!(budget, 6);
        assert_eq!(table.virtual_of(1), Some(BlockCoord::new(3, 0, 0)));
        assert_eq!(table.physical_of(BlockCoord::new(2, 0, 0)), None);
    }

    #[test]
    fn test_exhaustion_drops_without_eviction() {
        let mut table = SparseBlockTable::new(dim(), 2);
        let mut mask = AllocMask::new(dim());
        mask.request_range(BlockCoord::new(0, 0, 0), BlockCoord::new(1, 0, 0));
        let mut budget = 2;
        table.allocate_requested(&mask, &mut budget);

        let mut other = AllocMask::new(dim());
        other.request(BlockCoord::new(3, 3, 3));
        let outcome = table.allocate_requested(&other, &mut budget);
        assert!(outcome.allocated.is_empty());
        assert_eq!(outcome.dropped, 1);
        assert!(table.physical_of(BlockCoord::new(0, 0, 0)).is_some());
        assert!(table.physical_of(BlockCoord::new(1, 0, 0)).is_some());
    }

    #[test]
    fn test_hysteresis_window() {
        let mut table = SparseBlockTable::new(dim(), 4);
        let mut mask = AllocMask::new(dim());
        mask.request(BlockCoord::new(2, 2, 2));
        let mut budget = 4;
        table.allocate_requested(&mask, &mut budget);

        let empty = AllocMask::new(dim());
        let significant = vec![false; 4];
        for _ in 0..3 {
            assert!(table.retire_idle(&empty, &significant, 3).is_empty());
        }
        assert_eq!(table.retire_idle(&empty, &significant, 3), vec![0]);
        assert_eq!(table.active_count(), 0);
        assert_eq!(table.table().iter().filter(|s| **s != UNALLOCATED).count(), 0);
    }

    #[test]
    fn test_significance_keeps_block_alive() {
        let mut table = SparseBlockTable::new(dim(), 4);
        let mut mask = AllocMask::new(dim());
        mask.request(BlockCoord::new(0, 0, 0));
        let mut budget = 4;
        table.allocate_requested(&mask, &mut budget);

        let empty = AllocMask::new(dim());
        for _ in 0..10 {
            assert!(table.retire_idle(&empty, &[true, false, false, false], 1).is_empty());
        }
        assert_eq!(table.idle_steps(0), 0);
    }

    #[test]
    fn test_translate_moves_and_releases() {
        let mut table = SparseBlockTable::new(dim(), 4);
        let mut mask = AllocMask::new(dim());
        mask.request(BlockCoord::new(0, 1, 1));
        mask.request(BlockCoord::new(2, 1, 1));
        let mut budget = 4;
        table.allocate_requested(&mask, &mut budget);

        let released = table.translate(IVec3::new(1, 0, 0));
        assert_eq!(released, vec![0]);
        assert_eq!(table.physical_of(BlockCoord::new(1, 1, 1)), Some(1));
        assert_eq!(table.active_count(), 1);
    }

    #[test]
    fn test_neighbors_clip_to_grid() {
        let mut mask = AllocMask::new(dim());
        mask.request_neighbors(BlockCoord::new(0, 0, 0));
        assert_eq!(mask.count(), 3);
    }

    proptest! {
        #[test]
        fn prop_allocation_is_deterministic(
            first in proptest::collection::vec(0u32..64, 0..40),
            second in proptest::collection::vec(0u32..64, 0..40),
            capacity in 1u32..24,
        ) {
            let run = || {
                let mut table = SparseBlockTable::new(dim(), capacity);
                let mut budget = capacity;
                let mut outcomes = Vec::new();
                for batch in [&first, &second] {
                    let mut mask = AllocMask::new(dim());
                    for &i in batch {
                        mask.request(dim().coord_of(i));
                    }
                    let significant = vec![false; capacity as usize];
                    budget += table.retire_idle(&mask, &significant, 0).len() as u32;
                    outcomes.push(table.allocate_requested(&mask, &mut budget));
                }
                (outcomes, table.active_blocks().collect::<Vec<_>>())
            };
            prop_assert_eq!(run(), run());
        }

        #[test]
        fn prop_table_and_list_agree(requests in proptest::collection::vec(0u32..64, 0..64), capacity in 1u32..32) {
            let mut table = SparseBlockTable::new(dim(), capacity);
            let mut mask = AllocMask::new(dim());
            for &i in &requests {
                mask.request(dim().coord_of(i));
            }
            let mut budget = capacity;
            let outcome = table.allocate_requested(&mask, &mut budget);

            prop_assert!(table.active_count() <= capacity);
            prop_assert_eq!(outcome.allocated.len() as u32 + outcome.dropped, mask.count() as u32);
            for block in table.active_blocks() {
                prop_assert_eq!(table.physical_of(block.coord), Some(block.physical));
            }
        }
    }
}
