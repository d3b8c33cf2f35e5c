//! `talon-gfx` — an explicit, modern-GPU-style rendering abstraction with a Vulkan reference
//! backend (via `gfx-hal` + `gfx-backend-vulkan`).
//!
//! The crate exposes device creation, swap chains, textures, buffers, render passes,
//! framebuffers, pipelines, descriptor (resource) heaps, command submission, and GPU/CPU
//! synchronization, while hiding driver bookkeeping: memory allocation, command-pool recycling,
//! descriptor-pool growth, render-pass/framebuffer caching, layout transitions, and frame pacing.
//!
//! The entry point is [`device::GraphicsDevice`]: it is the factory for every other resource in
//! this crate (contexts, buffers, textures, pipelines, swap chains, ...). A typical application:
//!
//! 1. Creates a [`device::GraphicsDevice`] against a window handle.
//! 2. Creates a [`target::SwapChain`] and one or more [`context::DeviceContext`]s.
//! 3. Per frame: [`target::SwapChain::start_frame`], records draws through the context (which
//!    lazily commits the render pass, pipeline, vertex/index buffers and resource-heap bindings,
//!    and inserts resource-state barriers as needed), [`context::DeviceContext::flush`], then
//!    presents.
//!
//! Windowing, shader source compilation front-ends, sprite batching, image decoding and input are
//! explicitly out of scope; this crate only consumes their output (a raw window handle, compiled
//! SPIR-V, pixel data) — see `SPEC_FULL.md` §1 and §6.

#[cfg(feature = "vulkan")]
extern crate gfx_backend_vulkan as back;
extern crate gfx_hal as hal;

#[macro_use]
extern crate derive_builder;

pub mod builders;
pub mod command;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod fence;
pub mod framebuffer;
pub mod mem;
pub mod queue;
pub mod render_pass;
pub mod resource;
pub mod state;
pub mod target;
pub mod types;
pub mod utils;
pub mod window;

pub use context::DeviceContext;
pub use device::GraphicsDevice;
pub use error::{Error, Result};
pub use fence::TimelineFence;
pub use target::SwapChain;
