//! Textures: a GPU image plus the bound memory backing it, and the views into it that render
//! passes/descriptor sets actually reference.

use std::{
    mem::ManuallyDrop,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use hal::{
    device::Device as _,
    format::{Aspects, Format, Swizzle},
    image::{Kind, SubresourceRange, Tiling, Usage, ViewCapabilities, ViewKind},
    memory::SparseFlags,
};

use crate::{
    error::{LockPoisoned, Result},
    mem::{Block, MemoryPool},
    state::ResourceState,
    types::*,
};

static NEXT_VIEW_ID: AtomicU64 = AtomicU64::new(1);

/// Information needed to create a [`Texture`].
#[derive(Debug, Clone)]
pub struct TextureSpec {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u8,
    pub format: Format,
    pub usage: Usage,
}

/// A GPU image with memory bound to it. Does not itself carry a view; call
/// [`Texture::create_view`] for one, since a texture may be viewed more than one way (e.g. a full
/// mip chain view for sampling, and a single-mip view as a render target while generating mips).
pub struct Texture<P: MemoryPool> {
    raw: ManuallyDrop<ImageT>,
    memory: ManuallyDrop<P::Block>,
    spec: TextureSpec,
    state: ResourceState,
    pool: Arc<RwLock<P>>,
}

impl<P: MemoryPool> Texture<P> {
    pub fn new(device: &DeviceT, pool: Arc<RwLock<P>>, spec: TextureSpec) -> Result<Self> {
        let mut raw = unsafe {
            device.create_image(
                Kind::D2(spec.width, spec.height, 1, 1),
                spec.mip_levels,
                spec.format,
                Tiling::Optimal,
                spec.usage,
                SparseFlags::empty(),
                ViewCapabilities::empty(),
            )?
        };

        let requirements = unsafe { device.get_image_requirements(&raw) };
        let (memory, _) = {
            let mut guard = pool.write().map_err(|_| LockPoisoned::MemoryPool)?;
            guard.alloc(device, requirements.size, requirements.alignment)?
        };

        unsafe { device.bind_image_memory(memory.memory(), memory.range().start, &mut raw)? };

        Ok(Texture {
            raw: ManuallyDrop::new(raw),
            memory: ManuallyDrop::new(memory),
            spec,
            state: ResourceState::UNDEFINED,
            pool,
        })
    }

    pub fn raw(&self) -> &ImageT {
        &self.raw
    }

    pub fn spec(&self) -> &TextureSpec {
        &self.spec
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ResourceState) {
        self.state = state;
    }

    /// Whether this texture has more than one mip level and therefore needs
    /// [`crate::context::DeviceContext::generate_mips`] run at least once before it is sampled
    /// with trilinear/anisotropic filtering relying on the lower mips being populated.
    pub fn has_mips(&self) -> bool {
        self.spec.mip_levels > 1
    }

    pub fn create_view(
        &self,
        device: &DeviceT,
        view_kind: ViewKind,
        resources: SubresourceRange,
    ) -> Result<TextureView> {
        let raw = unsafe {
            device.create_image_view(
                &self.raw,
                view_kind,
                self.spec.format,
                Swizzle::NO,
                self.spec.usage,
                resources,
            )?
        };

        Ok(TextureView {
            raw: ManuallyDrop::new(raw),
            id: NEXT_VIEW_ID.fetch_add(1, Ordering::Relaxed),
            format: self.spec.format,
        })
    }

    pub fn deactivate(mut self, device: &DeviceT) -> Result<()> {
        let mut guard = self.pool.write().map_err(|_| LockPoisoned::MemoryPool)?;
        unsafe {
            guard.free(device, ManuallyDrop::take(&mut self.memory));
            device.destroy_image(ManuallyDrop::take(&mut self.raw));
        }
        Ok(())
    }
}

/// Every texture [`crate::device::GraphicsDevice::create_texture`] can hand back, erased over
/// which concrete memory pool backs it.
#[cfg(feature = "rendy-pools")]
pub enum TextureHandle {
    /// Device-local, optimal-tiling image for sampled/render-target use.
    Color(Texture<crate::mem::TexturesPool>),
    /// Device-local image backing a depth/stencil attachment.
    Depth(Texture<crate::mem::DepthBufferPool>),
}

#[cfg(feature = "rendy-pools")]
impl TextureHandle {
    pub fn raw(&self) -> &ImageT {
        match self {
            TextureHandle::Color(t) => t.raw(),
            TextureHandle::Depth(t) => t.raw(),
        }
    }

    pub fn spec(&self) -> &TextureSpec {
        match self {
            TextureHandle::Color(t) => t.spec(),
            TextureHandle::Depth(t) => t.spec(),
        }
    }

    pub fn state(&self) -> ResourceState {
        match self {
            TextureHandle::Color(t) => t.state(),
            TextureHandle::Depth(t) => t.state(),
        }
    }

    pub(crate) fn set_state(&mut self, state: ResourceState) {
        match self {
            TextureHandle::Color(t) => t.set_state(state),
            TextureHandle::Depth(t) => t.set_state(state),
        }
    }

    pub fn has_mips(&self) -> bool {
        match self {
            TextureHandle::Color(t) => t.has_mips(),
            TextureHandle::Depth(t) => t.has_mips(),
        }
    }

    pub fn create_view(
        &self,
        device: &DeviceT,
        view_kind: ViewKind,
        resources: SubresourceRange,
    ) -> Result<TextureView> {
        match self {
            TextureHandle::Color(t) => t.create_view(device, view_kind, resources),
            TextureHandle::Depth(t) => t.create_view(device, view_kind, resources),
        }
    }

    pub fn deactivate(self, device: &DeviceT) -> Result<()> {
        match self {
            TextureHandle::Color(t) => t.deactivate(device),
            TextureHandle::Depth(t) => t.deactivate(device),
        }
    }
}

/// A view into a [`Texture`]. Carries a process-unique id, used by
/// [`crate::framebuffer::FramebufferCacheKey`] to identify attachments without requiring
/// `hal::ImageView` to implement `Hash`/`Eq`. Does not represent a swap-chain image: those are only
/// ever borrowed fresh from [`crate::target::SwapChain`] each frame, never owned by this crate, so
/// they're addressed directly as `&ImageViewT` instead (see `DESIGN.md`).
pub struct TextureView {
    raw: ManuallyDrop<ImageViewT>,
    id: u64,
    format: Format,
}

impl TextureView {
    pub fn raw(&self) -> &ImageViewT {
        &self.raw
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn deactivate(mut self, device: &DeviceT) {
        unsafe { device.destroy_image_view(ManuallyDrop::take(&mut self.raw)) };
    }
}

pub const COLOR_RESOURCES: SubresourceRange = SubresourceRange {
    aspects: Aspects::COLOR,
    level_start: 0,
    level_count: None,
    layer_start: 0,
    layer_count: Some(1),
};

pub const DEPTH_RESOURCES: SubresourceRange = SubresourceRange {
    aspects: Aspects::DEPTH,
    level_start: 0,
    level_count: Some(1),
    layer_start: 0,
    layer_count: Some(1),
};
