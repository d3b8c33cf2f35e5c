//! Backend type aliases.
//!
//! The rest of the crate is written against `hal`'s generic `Backend` trait, but almost every
//! call site needs a concrete associated type (`DeviceT`, `BufferT`, ...). Rather than thread a
//! `B: hal::Backend` generic parameter through every struct in the crate, we fix the backend here
//! to whichever one the `vulkan` feature selects and alias its associated types. This is the same
//! shortcut taken by most `gfx-hal` consumers: a second backend would mean changing this file and
//! little else.

#[cfg(feature = "vulkan")]
pub use back::Backend;

pub type ShaderModuleT = <Backend as hal::Backend>::ShaderModule;
pub type RenderPassT = <Backend as hal::Backend>::RenderPass;
pub type PipelineLayoutT = <Backend as hal::Backend>::PipelineLayout;
pub type GraphicsPipelineT = <Backend as hal::Backend>::GraphicsPipeline;
pub type FramebufferT = <Backend as hal::Backend>::Framebuffer;

pub type BufferT = <Backend as hal::Backend>::Buffer;
pub type MemoryT = <Backend as hal::Backend>::Memory;

pub type CommandPoolT = <Backend as hal::Backend>::CommandPool;
pub type CommandBufferT = <Backend as hal::Backend>::CommandBuffer;

pub type ImageT = <Backend as hal::Backend>::Image;
pub type ImageViewT = <Backend as hal::Backend>::ImageView;
pub type SamplerT = <Backend as hal::Backend>::Sampler;

pub type DescriptorPoolT = <Backend as hal::Backend>::DescriptorPool;
pub type DescriptorSetT = <Backend as hal::Backend>::DescriptorSet;
pub type DescriptorSetLayoutT = <Backend as hal::Backend>::DescriptorSetLayout;

pub type FenceT = <Backend as hal::Backend>::Fence;
pub type SemaphoreT = <Backend as hal::Backend>::Semaphore;

pub type SurfaceT = <Backend as hal::Backend>::Surface;
pub type SwapchainImageT = <Backend as hal::Backend>::SwapchainImage;
pub type DeviceT = <Backend as hal::Backend>::Device;
pub type InstanceT = <Backend as hal::Backend>::Instance;

pub type QueueT = <Backend as hal::Backend>::Queue;
pub type QueueFamilyT = <Backend as hal::Backend>::QueueFamily;

pub type Adapter = hal::adapter::Adapter<Backend>;
pub type QueueGroup = hal::queue::QueueGroup<Backend>;
pub type MemoryTypeId = rendy_memory::MemoryTypeId;

/// A descriptor set allocated out of a [`rendy_descriptor`] pool, rather than a raw `hal`
/// descriptor pool directly.
pub type RDescriptorSet = rendy_descriptor::DescriptorSet<Backend>;
pub type DescriptorAllocator = rendy_descriptor::DescriptorAllocator<Backend>;
