//! Double-buffered custom emission.
//!
//! External producers (distance-field collision, particle coupling) inject
//! data into a grid step through two callbacks registered on an
//! [`EmitCustomRegistry`] for the duration of one update:
//!
//! - an [`EmitCustomAlloc`] callback, called once per layer, that marks
//!   additional blocks for allocation;
//! - an [`EmitCustomEmit`] callback per channel, called once per layer,
//!   that reads the previous generation and writes a new one.
//!
//! Channel data is held in a [`SwapBuffer`]. A callback opens a
//! [`SwapWrite`] to get a read view of the front buffer and a write view of
//! the back buffer at the same time; the borrow checker makes aliasing the
//! two impossible. Committing the write flips the front index. A callback
//! that does no work simply never commits, and the engine keeps reading
//! the untouched front buffer.
//!
//! Several producers compose by chaining writes: each opens its own
//! [`SwapWrite`], usually copies the prior state forward with
//! [`SwapWrite::copy_forward`], couples its data in, and commits.
//!
//! The registry borrows producers for its lifetime, so callbacks cannot
//! outlive the step they were registered for.

use glam::Vec4;
use plume_common::GridSpace;

use crate::block_table::{AllocMask, SparseBlockTable};
use crate::export::{ChannelData, GridTextureChannel};
use crate::material::GridMaterialHandle;

/// Two buffers, one of which is the engine-visible front.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapBuffer<T> {
    buffers: [T; 2],
    front: usize,
}

impl<T> SwapBuffer<T> {
    /// Creates a pair with `front` visible.
    pub fn new(front: T, back: T) -> Self {
        Self {
            buffers: [front, back],
            front: 0,
        }
    }

    /// Index of the front buffer, 0 or 1.
    #[must_use]
    pub const fn front_index(&self) -> usize {
        self.front
    }

    /// The front buffer.
    #[must_use]
    pub fn read(&self) -> &T {
        &self.buffers[self.front]
    }

    /// Mutable access to the front buffer for in-place engine passes.
    pub fn front_mut(&mut self) -> &mut T {
        &mut self.buffers[self.front]
    }

    /// Mutable access to both buffers, front first.
    pub fn both_mut(&mut self) -> [&mut T; 2] {
        let [a, b] = &mut self.buffers;
        if self.front == 0 {
            [a, b]
        } else {
            [b, a]
        }
    }

    /// Opens a new generation: read the front, write the back.
    pub fn begin(&mut self) -> SwapWrite<'_, T> {
        let read_index = self.front;
        let Self { buffers, front } = self;
        let [a, b] = buffers;
        let (read, write) = if read_index == 0 { (&*a, b) } else { (&*b, a) };
        SwapWrite {
            read,
            write,
            front,
            read_index,
        }
    }
}

/// One in-progress generation of a [`SwapBuffer`].
///
/// Holds a shared view of the front buffer and an exclusive view of the back
/// buffer. Dropping it without [`Self::commit`] leaves the front unchanged.
#[derive(Debug)]
pub struct SwapWrite<'a, T> {
    read: &'a T,
    write: &'a mut T,
    front: &'a mut usize,
    read_index: usize,
}

impl<'a, T> SwapWrite<'a, T> {
    /// Previous state.
    #[must_use]
    pub fn read(&self) -> &T {
        self.read
    }

    /// New state being written.
    pub fn write(&mut self) -> &mut T {
        self.write
    }

    /// Both views at once.
    pub fn views(&mut self) -> (&T, &mut T) {
        (self.read, self.write)
    }

    /// Index of the buffer being read.
    #[must_use]
    pub const fn read_index(&self) -> usize {
        self.read_index
    }

    /// Index of the buffer being written; always the other one.
    #[must_use]
    pub const fn write_index(&self) -> usize {
        self.read_index ^ 1
    }

    /// Copies the previous state into the write buffer.
    pub fn copy_forward(&mut self)
    where
        T: Clone,
    {
        self.write.clone_from(self.read);
    }

    /// Publishes the written buffer as the new front.
    pub fn commit(self) {
        *self.front = self.read_index ^ 1;
    }
}

/// Inputs to an allocation callback for one layer.
#[derive(Debug)]
pub struct EmitCustomAllocParams<'a> {
    /// Layer index
    pub layer: u32,
    /// Material simulated in the layer
    pub material: GridMaterialHandle,
    /// Grid placement
    pub space: GridSpace,
    /// Requests to add to; write `true` where allocation is desired
    pub mask: &'a mut AllocMask,
}

/// Inputs to an emission callback for one layer of one channel.
#[derive(Debug)]
pub struct EmitCustomEmitParams<'a> {
    /// Channel being emitted
    pub channel: GridTextureChannel,
    /// Layer index
    pub layer: u32,
    /// Material simulated in the layer
    pub material: GridMaterialHandle,
    /// Grid placement
    pub space: GridSpace,
    /// Block mapping of the layer
    pub table: &'a SparseBlockTable,
    /// Step size in seconds
    pub dt: f32,
    /// Channel data; commit a [`SwapWrite`] to publish a new generation
    pub data: &'a mut SwapBuffer<ChannelData>,
}

impl EmitCustomEmitParams<'_> {
    /// Data of the block containing a world-space point in the front buffer.
    #[must_use]
    pub fn front_value(&self, point: glam::Vec3) -> Option<Vec4> {
        let c = self.space.block_of_point(point)?;
        let slot = self.table.physical_of(c)?;
        self.data.read().get(slot as usize).copied()
    }
}

/// Marks extra blocks for allocation.
pub trait EmitCustomAlloc {
    /// Called once per layer before allocation is applied.
    fn alloc(&mut self, params: &mut EmitCustomAllocParams<'_>);
}

/// Writes a new generation of channel data.
///
/// Implementations must read only through [`SwapWrite::read`] and write only
/// through [`SwapWrite::write`], and must commit exactly when they wrote.
pub trait EmitCustomEmit {
    /// Called once per layer after built-in emitters have coupled.
    fn emit(&mut self, params: &mut EmitCustomEmitParams<'_>);
}

impl<F> EmitCustomAlloc for F
where
    F: FnMut(&mut EmitCustomAllocParams<'_>),
{
    fn alloc(&mut self, params: &mut EmitCustomAllocParams<'_>) {
        self(params);
    }
}

impl<F> EmitCustomEmit for F
where
    F: FnMut(&mut EmitCustomEmitParams<'_>),
{
    fn emit(&mut self, params: &mut EmitCustomEmitParams<'_>) {
        self(params);
    }
}

/// Callbacks attached to one grid update.
#[derive(Default)]
pub struct EmitCustomRegistry<'a> {
    alloc: Option<&'a mut dyn EmitCustomAlloc>,
    velocity: Option<&'a mut dyn EmitCustomEmit>,
    density: Option<&'a mut dyn EmitCustomEmit>,
}

impl std::fmt::Debug for EmitCustomRegistry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmitCustomRegistry")
            .field("alloc", &self.alloc.is_some())
            .field("velocity", &self.velocity.is_some())
            .field("density", &self.density.is_some())
            .finish()
    }
}

impl<'a> EmitCustomRegistry<'a> {
    /// Creates a registry with nothing attached.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches or detaches (`None`) the allocation callback.
    pub fn register_alloc_func(&mut self, func: Option<&'a mut dyn EmitCustomAlloc>) {
        self.alloc = func;
    }

    /// Attaches or detaches (`None`) the emission callback for a channel.
    ///
    /// Coarse density shares the density callback.
    pub fn register_emit_func(&mut self, channel: GridTextureChannel, func: Option<&'a mut dyn EmitCustomEmit>) {
        match channel {
            GridTextureChannel::Velocity => self.velocity = func,
            GridTextureChannel::Density | GridTextureChannel::DensityCoarse => self.density = func,
        }
    }

    /// Detaches every callback.
    pub fn unregister_all(&mut self) {
        self.alloc = None;
        self.velocity = None;
        self.density = None;
    }

    /// Returns true if nothing is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.alloc.is_none() && self.velocity.is_none() && self.density.is_none()
    }

    pub(crate) fn run_alloc(&mut self, params: &mut EmitCustomAllocParams<'_>) {
        if let Some(func) = self.alloc.as_mut() {
            func.alloc(params);
        }
    }

    pub(crate) fn has_emit(&self, channel: GridTextureChannel) -> bool {
        match channel {
            GridTextureChannel::Velocity => self.velocity.is_some(),
            GridTextureChannel::Density | GridTextureChannel::DensityCoarse => self.density.is_some(),
        }
    }

    pub(crate) fn run_emit(&mut self, params: &mut EmitCustomEmitParams<'_>) {
        let func = match params.channel {
            GridTextureChannel::Velocity => self.velocity.as_mut(),
            GridTextureChannel::Density | GridTextureChannel::DensityCoarse => self.density.as_mut(),
        };
        if let Some(func) = func {
            func.emit(params);
        }
    }
}
