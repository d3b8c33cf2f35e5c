//! GPU buffers: vertex, index, uniform and staging data, backed by a [`crate::mem::MemoryPool`].

use std::{
    mem::ManuallyDrop,
    ops::Range,
    sync::{Arc, RwLock},
};

use hal::{buffer::Usage, command::BufferCopy, device::Device as _, memory::SparseFlags};

use crate::{
    error::{LockPoisoned, Result, UsageError},
    mem::{Block, MappableBlock, MemoryPool},
    state::ResourceState,
    types::*,
};

/// How a [`Buffer::map`] call should treat the previous contents of the mapped range.
///
/// This is intentionally three-valued, matching three genuinely distinct usage patterns rather
/// than collapsing "discard" and "overwrite" into one: a caller that wants to read back data it
/// previously wrote needs `Default`, one replacing the whole buffer's contents every frame wants
/// `Discard` (so the implementation is free to hand back fresh backing memory instead of
/// synchronising with the GPU's last use of the old one), and one patching part of a buffer that
/// is still otherwise valid wants `Overwrite` (same memory, no read-back, no discard).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapType {
    /// The caller may read the existing contents, and any write must be visible to later reads.
    Default,
    /// The caller does not care about the existing contents and will overwrite the whole mapped
    /// range; the implementation may substitute new backing memory to avoid waiting on the GPU.
    Discard,
    /// The caller will overwrite the mapped range without reading it, but (unlike `Discard`) later
    /// reads of the rest of the buffer must still see prior writes, so backing memory may not be
    /// swapped.
    Overwrite,
}

/// Which direction a [`crate::context::DeviceContext::map_buffer`] call needs access for. Distinct
/// from [`MapType`]: this says whether the caller intends to read, write, or both, while `MapType`
/// says how the previous contents of the range should be treated. The combination the context
/// actually allows is `Read` only with `MapType::Overwrite` (read back a buffer the caller knows
/// it previously wrote), and `Write` with either `Overwrite` or `Discard` — see `DESIGN.md`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapAccess {
    Read,
    Write,
}

/// A GPU buffer (vertex, index, uniform, or staging), with its backing memory allocated from a
/// [`MemoryPool`] implementation `P`.
pub struct Buffer<P: MemoryPool> {
    raw: ManuallyDrop<BufferT>,
    memory: ManuallyDrop<P::Block>,
    size: u64,
    state: ResourceState,
    mapped_range: Option<Range<u64>>,
    /// The pool this buffer's memory came from, kept alongside it so [`Self::deactivate`] doesn't
    /// need the caller to remember (and pass back) the right pool.
    pool: Arc<RwLock<P>>,
}

impl<P: MemoryPool> Buffer<P> {
    /// Create a new, empty buffer of `size` bytes with the given usage flags. `usage` should not
    /// include `TRANSFER_DST`/`TRANSFER_SRC` unless the caller genuinely needs the buffer to also
    /// be a transfer target/source independent of mapping.
    pub fn new(device: &DeviceT, pool: Arc<RwLock<P>>, size: u64, usage: Usage) -> Result<Self> {
        let mut raw = unsafe { device.create_buffer(size, usage, SparseFlags::empty())? };
        let requirements = unsafe { device.get_buffer_requirements(&raw) };

        let (memory, _) = {
            let mut guard = pool.write().map_err(|_| LockPoisoned::MemoryPool)?;
            guard.alloc(device, requirements.size, requirements.alignment)?
        };

        unsafe { device.bind_buffer_memory(memory.memory(), 0, &mut raw)? };

        Ok(Buffer {
            raw: ManuallyDrop::new(raw),
            memory: ManuallyDrop::new(memory),
            size,
            state: ResourceState::UNDEFINED,
            mapped_range: None,
            pool,
        })
    }

    pub fn raw(&self) -> &BufferT {
        &self.raw
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ResourceState) {
        self.state = state;
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped_range.is_some()
    }

    /// Record the commands required to copy `range` from `src` into this buffer at the same
    /// offsets. Both buffers must already be in `TRANSFER_DESTINATION`/`TRANSFER_SOURCE` state
    /// respectively; this call only records the copy itself.
    pub fn record_copy_from(&self, src: &BufferT, range: Range<u64>, cmd: &mut CommandBufferT) {
        unsafe {
            cmd.copy_buffer(
                src,
                &self.raw,
                std::iter::once(BufferCopy {
                    src: range.start,
                    dst: range.start,
                    size: range.end - range.start,
                }),
            );
        }
    }
}

impl<P: MemoryPool> Buffer<P>
where
    P::Block: MappableBlock,
{
    /// Map `range` of this buffer for CPU access. Fails with [`UsageError::BufferAlreadyMapped`]
    /// if it is already mapped.
    ///
    /// `map_type` only affects whether a future implementation chooses to substitute backing
    /// memory for `Discard`; the current `rendy`-backed pools always map the existing allocation
    /// in place, so all three `MapType`s currently behave identically at the memory level and
    /// differ only in the synchronisation the caller is allowed to skip.
    pub fn map(&mut self, device: &mut DeviceT, range: Range<u64>, map_type: MapType) -> Result<*mut u8> {
        if self.mapped_range.is_some() {
            return Err(UsageError::BufferAlreadyMapped.into());
        }
        let _ = map_type;

        let ptr = self.memory.map(device, range.clone())?;
        self.mapped_range = Some(range);
        Ok(ptr)
    }

    /// Unmap a previously-mapped range. Fails with [`UsageError::BufferNotMapped`] if the buffer
    /// isn't currently mapped.
    pub fn unmap(&mut self, device: &mut DeviceT) -> Result<()> {
        if self.mapped_range.is_none() {
            return Err(UsageError::BufferNotMapped.into());
        }

        self.memory.unmap(device)?;
        self.mapped_range = None;
        Ok(())
    }
}

impl<P: MemoryPool> Buffer<P> {
    pub fn deactivate(mut self, device: &DeviceT) -> Result<()> {
        let mut guard = self.pool.write().map_err(|_| LockPoisoned::MemoryPool)?;
        unsafe {
            guard.free(device, ManuallyDrop::take(&mut self.memory));
            device.destroy_buffer(ManuallyDrop::take(&mut self.raw));
        }
        Ok(())
    }
}

/// Every buffer [`crate::device::GraphicsDevice::create_buffer`] can hand back, erased over which
/// concrete memory pool backs it. `DeviceContext` and the resource heap only ever see this type,
/// not `Buffer<P>` directly, so they don't need to be generic over memory pool choice.
#[cfg(feature = "rendy-pools")]
pub enum BufferHandle {
    /// General-purpose host-visible data: vertex, index, and uniform buffers.
    Data(Buffer<crate::mem::DataPool>),
    /// A staging buffer used as the intermediate for `MapBuffer`'s `Discard` policy and explicit
    /// upload paths.
    Staging(Buffer<crate::mem::StagingPool>),
}

#[cfg(feature = "rendy-pools")]
impl BufferHandle {
    pub fn raw(&self) -> &BufferT {
        match self {
            BufferHandle::Data(b) => b.raw(),
            BufferHandle::Staging(b) => b.raw(),
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            BufferHandle::Data(b) => b.size(),
            BufferHandle::Staging(b) => b.size(),
        }
    }

    pub fn state(&self) -> ResourceState {
        match self {
            BufferHandle::Data(b) => b.state(),
            BufferHandle::Staging(b) => b.state(),
        }
    }

    pub(crate) fn set_state(&mut self, state: ResourceState) {
        match self {
            BufferHandle::Data(b) => b.set_state(state),
            BufferHandle::Staging(b) => b.set_state(state),
        }
    }

    pub fn is_mapped(&self) -> bool {
        match self {
            BufferHandle::Data(b) => b.is_mapped(),
            BufferHandle::Staging(b) => b.is_mapped(),
        }
    }

    pub fn map(&mut self, device: &mut DeviceT, range: Range<u64>, map_type: MapType) -> Result<*mut u8> {
        match self {
            BufferHandle::Data(b) => b.map(device, range, map_type),
            BufferHandle::Staging(b) => b.map(device, range, map_type),
        }
    }

    pub fn unmap(&mut self, device: &mut DeviceT) -> Result<()> {
        match self {
            BufferHandle::Data(b) => b.unmap(device),
            BufferHandle::Staging(b) => b.unmap(device),
        }
    }

    pub fn record_copy_from(&self, src: &BufferT, range: Range<u64>, cmd: &mut CommandBufferT) {
        match self {
            BufferHandle::Data(b) => b.record_copy_from(src, range, cmd),
            BufferHandle::Staging(b) => b.record_copy_from(src, range, cmd),
        }
    }

    pub fn deactivate(self, device: &DeviceT) -> Result<()> {
        match self {
            BufferHandle::Data(b) => b.deactivate(device),
            BufferHandle::Staging(b) => b.deactivate(device),
        }
    }
}
