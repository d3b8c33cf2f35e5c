//! Command pools and buffers: allocating, recording, and recycling the `hal` command buffers that
//! every [`crate::context::DeviceContext`] records into.

mod buffer;
mod pool;

pub use buffer::{CommandBuffer, RenderAttachment};
pub use pool::CommandPool;
