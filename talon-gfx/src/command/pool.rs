use std::mem::ManuallyDrop;

use hal::{
    command::CommandBuffer as _,
    device::Device as _,
    pool::{CommandPool as _, CommandPoolCreateFlags},
    queue::QueueFamilyId,
};

use crate::{
    command::CommandBuffer,
    error::Result,
    fence::SharedTimelineFence,
    types::*,
};

/// A command buffer that has been returned to the pool, plus the fence value its last submission
/// must reach before it is safe to reset and reuse. `None` for a buffer that was allocated but
/// never submitted (so it's available immediately).
struct ParkedBuffer {
    buffer: CommandBuffer,
    last_use: Option<(SharedTimelineFence, u64)>,
}

impl ParkedBuffer {
    fn is_available(&self, device: &DeviceT) -> bool {
        match &self.last_use {
            None => true,
            Some((fence, expected)) => match fence.read() {
                Ok(fence) => fence.poll(device).map(|v| v >= *expected).unwrap_or(false),
                Err(_) => false,
            },
        }
    }
}

/// A `hal` command pool for a single queue family, recycling [`CommandBuffer`]s individually
/// (`RESET_INDIVIDUAL`) by parking each one returned to the pool until its last submission's fence
/// is satisfied, rather than resetting the whole pool at once.
pub struct CommandPool {
    raw: ManuallyDrop<CommandPoolT>,
    family: QueueFamilyId,
    parked: Vec<ParkedBuffer>,
}

impl CommandPool {
    pub fn new(device: &DeviceT, family: QueueFamilyId) -> Result<Self> {
        let raw = unsafe { device.create_command_pool(family, CommandPoolCreateFlags::RESET_INDIVIDUAL)? };

        Ok(CommandPool {
            raw: ManuallyDrop::new(raw),
            family,
            parked: Vec::new(),
        })
    }

    pub fn family(&self) -> QueueFamilyId {
        self.family
    }

    /// Number of command buffers parked (in-flight or idle) in this pool.
    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    /// Scan the parked list for a buffer whose last use has completed and hand it back reset
    /// (dropping its previous reference set); otherwise allocate a fresh one from the native pool.
    pub fn acquire(&mut self, device: &DeviceT) -> CommandBuffer {
        if let Some(idx) = self.parked.iter().position(|p| p.is_available(device)) {
            let parked = self.parked.remove(idx);
            let mut buffer = parked.buffer;
            unsafe { buffer.raw_mut().reset(false) };
            return buffer;
        }

        let raw = unsafe { self.raw.allocate_one(hal::command::Level::Primary) };
        CommandBuffer::from_raw(raw)
    }

    /// Return a command buffer to the pool, to be reused once `completion_fence` reaches
    /// `expected_value`. Pass `None` for a buffer that was never submitted.
    pub fn give_back(
        &mut self,
        buffer: CommandBuffer,
        last_use: Option<(SharedTimelineFence, u64)>,
    ) {
        self.parked.push(ParkedBuffer { buffer, last_use });
    }

    pub fn deactivate(mut self, device: &DeviceT) {
        unsafe {
            let raws = self.parked.drain(..).map(|p| p.buffer.into_raw());
            self.raw.free(raws);
            device.destroy_command_pool(ManuallyDrop::into_inner(self.raw));
        }
    }
}
