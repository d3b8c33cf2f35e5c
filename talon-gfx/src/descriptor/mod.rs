//! Descriptor (resource) heaps: the per-draw mechanism for binding buffers, samplers, and texture
//! views to shader stages.
//!
//! [`layout`] describes the binding slots a heap exposes (mirrors the native descriptor-set-layout
//! concept). [`pool`] recycles native descriptor sets across frames, grouped with the fence value
//! that marks them free for reuse again — the bookkeeping `rendy_descriptor::DescriptorAllocator`
//! itself doesn't provide. [`heap`] is the user-facing binding map that lazily writes itself into
//! a pooled descriptor set.

pub mod heap;
pub mod layout;
pub mod pool;

pub use heap::{BufferBinding, ResourceHeap, SamplerBinding, TransitionPolicy};
pub use layout::{ResourceBindingLayout, ResourceHeapLayout};
pub use pool::{DescriptorPool, DescriptorSetGroup};
