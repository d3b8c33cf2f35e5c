//! GPU-resident resources: buffers, textures, samplers, shader modules and the graphics pipelines
//! built from them.

pub mod buffer;
pub mod pipeline;
pub mod sampler;
pub mod shader;
pub mod texture;

pub use buffer::{Buffer, MapAccess, MapType};
pub use pipeline::GraphicsPipeline;
pub use sampler::Sampler;
pub use shader::{ShaderCompiler, ShaderSource, ShaderStage};
pub use texture::{Texture, TextureView};

#[cfg(feature = "rendy-pools")]
pub use buffer::BufferHandle;
#[cfg(feature = "rendy-pools")]
pub use texture::TextureHandle;
