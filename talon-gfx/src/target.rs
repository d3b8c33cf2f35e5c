//! The swap chain: the chain of presentable images a [`crate::device::GraphicsDevice`]'s surface
//! cycles through, plus the shared depth buffer and per-frame-in-flight pacing fences that go with
//! it.

use std::{
    borrow::Borrow,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use hal::{
    format::{ChannelType, Format, ImageFeature},
    image::{Extent, FramebufferAttachment, Usage as ImgUsage, ViewCapabilities, ViewKind},
    pso::Viewport,
    window::{
        CompositeAlphaMode, Extent2D, PresentMode, PresentationSurface as _, Surface as _,
        SwapchainConfig,
    },
};
use log::debug;

use crate::{
    device::{GraphicsDevice, TextureClass},
    error::{EnvironmentError, Result},
    fence::SharedTimelineFence,
    queue::SharedQueue,
    resource::texture::{TextureHandle, TextureSpec, TextureView, DEPTH_RESOURCES},
    types::*,
    window::{ResizeSubscription, SurfaceResizeObserver, WindowResizeSource},
};

/// Fixed at 2 rather than made configurable: matches the fence/command-pool pairing this crate
/// allocates per swap chain, and there's no evidence more than double-buffering is worth the extra
/// memory for the workloads this crate targets. See `DESIGN.md`.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

static NEXT_ATTACHMENT_ID: AtomicU64 = AtomicU64::new(1);

/// What to build a [`SwapChain`] with.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwapChainDesc {
    /// Whether to allocate a shared depth buffer alongside the color images. Most render graphs
    /// want one; a pure 2D/UI-only application can skip it.
    pub want_depth: bool,
}

/// Everything about a surface that [`SwapChain::new`]/[`SwapChain::recreate`] had to discover by
/// querying the adapter: the formats, present mode and compositing mode it settled on.
#[derive(Debug, Clone)]
pub struct SwapChainProperties {
    pub format: Format,
    pub depth_format: Option<Format>,
    pub present_mode: PresentMode,
    pub composite_alpha_mode: CompositeAlphaMode,
    pub viewport: Viewport,
    pub extent: Extent,
    pub image_count: u32,
}

impl SwapChainProperties {
    /// Pick the best format/present-mode/compositing combination a given adapter+surface pair
    /// supports. Prefers an sRGB color format, the least-latency present mode available
    /// (mailbox, then FIFO, then relaxed FIFO, then immediate), and `Opaque` compositing.
    pub fn find_best(adapter: &Adapter, surface: &SurfaceT, want_depth: bool) -> Result<Self> {
        let caps = surface.capabilities(&adapter.physical_device);
        let formats = surface.supported_formats(&adapter.physical_device);

        let format = match formats {
            Some(formats) => formats
                .iter()
                .find(|format| format.base_format().1 == ChannelType::Srgb)
                .copied()
                .ok_or(EnvironmentError::ColorFormat),
            None => Ok(Format::Rgba8Srgb),
        }?;

        let depth_format = if want_depth {
            Some(
                *[
                    Format::D32SfloatS8Uint,
                    Format::D24UnormS8Uint,
                    Format::D32Sfloat,
                ]
                .iter()
                .find(|format| {
                    format.is_depth()
                        && adapter
                            .physical_device
                            .format_properties(Some(**format))
                            .optimal_tiling
                            .contains(ImageFeature::DEPTH_STENCIL_ATTACHMENT)
                })
                .ok_or(EnvironmentError::DepthFormat)?,
            )
        } else {
            None
        };

        let present_mode = [
            PresentMode::MAILBOX,
            PresentMode::FIFO,
            PresentMode::RELAXED,
            PresentMode::IMMEDIATE,
        ]
        .iter()
        .cloned()
        .find(|pm| caps.present_modes.contains(*pm))
        .ok_or(EnvironmentError::PresentMode)?;

        let composite_alpha_mode = [
            CompositeAlphaMode::OPAQUE,
            CompositeAlphaMode::INHERIT,
            CompositeAlphaMode::PREMULTIPLIED,
            CompositeAlphaMode::POSTMULTIPLIED,
        ]
        .iter()
        .cloned()
        .find(|ca| caps.composite_alpha_modes.contains(*ca))
        .ok_or(EnvironmentError::CompositeAlphaMode)?;

        let extent = caps.extents.end().to_extent();
        let viewport = Viewport {
            rect: extent.rect(),
            depth: 0.0..1.0,
        };

        let image_count = if present_mode == PresentMode::MAILBOX {
            ((*caps.image_count.end()) - 1).min((*caps.image_count.start()).max(3))
        } else {
            ((*caps.image_count.end()) - 1).min((*caps.image_count.start()).max(2))
        };

        Ok(SwapChainProperties {
            format,
            depth_format,
            present_mode,
            composite_alpha_mode,
            extent,
            viewport,
            image_count,
        })
    }

    pub fn framebuffer_attachment(&self) -> FramebufferAttachment {
        FramebufferAttachment {
            usage: ImgUsage::COLOR_ATTACHMENT,
            format: self.format,
            view_caps: ViewCapabilities::empty(),
        }
    }
}

/// One color (and, if the swap chain was built with a depth buffer, depth) attachment for a
/// single frame. Borrowed from whatever backs it for the lifetime of that frame only: a swap
/// chain image view is never owned by this crate (see [`SwapChainAttachment`]), and the depth
/// view is owned by the [`SwapChain`] itself, recreated on resize.
pub struct FrameTargets {
    pub color: SwapChainAttachment,
    pub depth: Option<SwapChainAttachment>,
    pub extent: Extent,
}

/// A view this crate doesn't own the lifetime of: either a swap chain's current backbuffer (valid
/// for one frame only, for as long as the acquired image it came from hasn't been presented) or
/// this swap chain's shared depth buffer (valid until the next `recreate`). Carries a process-
/// unique id for framebuffer cache keys, same convention as [`crate::resource::texture::TextureView`].
#[derive(Clone, Copy)]
pub struct SwapChainAttachment {
    view: *const ImageViewT,
    id: u64,
    format: Format,
}

// SAFETY: the raw pointer here is never dereferenced by this type itself, only handed back out
// through `view()` for the caller to use immediately within the frame it was obtained; it carries
// no thread-affinity of its own distinct from the `ImageViewT`/`SwapchainImageT` it borrows from.
unsafe impl Send for SwapChainAttachment {}
unsafe impl Sync for SwapChainAttachment {}

impl SwapChainAttachment {
    fn new(view: &ImageViewT, id: u64, format: Format) -> Self {
        SwapChainAttachment {
            view: view as *const ImageViewT,
            id,
            format,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// # Safety
    /// Valid only for the duration of the frame this attachment was obtained in (before the next
    /// `SwapChain::start_frame`/`recreate`, or for the depth attachment, the next `recreate`).
    pub unsafe fn view(&self) -> &ImageViewT {
        &*self.view
    }
}

/// Raised by [`SwapChain`]'s [`SurfaceResizeObserver`] registration; checked at the start of every
/// [`SwapChain::start_frame`] rather than acted on immediately, since a resize notification can
/// arrive on whatever thread owns the window's event loop while a frame is mid-flight on the
/// render thread.
struct ResizeFlag(AtomicBool);

impl SurfaceResizeObserver for ResizeFlag {
    fn on_resize(&self, _new_size: (u32, u32)) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// The chain of presentable images a surface cycles through. Paces the CPU against
/// [`MAX_FRAMES_IN_FLIGHT`] frames via one [`crate::fence::TimelineFence`] per in-flight slot; the
/// fence (and the value it should be signalled to) handed out by [`SwapChain::start_frame`] is
/// meant to be submitted against as the *completion* fence of that frame's command buffer (see
/// [`crate::context::DeviceContext::flush`]) — unifying "this frame's work is done" with "this
/// slot is free to reuse" into one fence rather than two.
pub struct SwapChain {
    properties: SwapChainProperties,
    depth: Option<(TextureHandle, TextureView)>,
    color_attachment_id: u64,
    depth_attachment_id: u64,

    frame_fences: Vec<SharedTimelineFence>,
    frame_values: Vec<u64>,
    cursor: usize,

    current_image: Option<SwapchainImageT>,

    resize_flag: Arc<ResizeFlag>,
    _resize_subscription: Option<ResizeSubscription>,
}

impl SwapChain {
    pub fn new(
        device: &mut GraphicsDevice,
        desc: SwapChainDesc,
        resize_source: Option<&Arc<WindowResizeSource>>,
    ) -> Result<Self> {
        let properties = SwapChainProperties::find_best(device.adapter(), device.surface(), desc.want_depth)?;

        let depth = if let Some(depth_format) = properties.depth_format {
            Some(Self::create_depth(device, &properties, depth_format)?)
        } else {
            None
        };

        let mut frame_fences = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        let mut frame_values = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            frame_fences.push(Arc::new(std::sync::RwLock::new(device.create_fence(0)?)));
            frame_values.push(0);
        }

        let resize_flag = Arc::new(ResizeFlag(AtomicBool::new(false)));
        let resize_subscription = resize_source.map(|source| {
            source.subscribe(resize_flag.clone() as Arc<dyn SurfaceResizeObserver>)
        });

        let mut swap_chain = SwapChain {
            properties,
            depth,
            color_attachment_id: NEXT_ATTACHMENT_ID.fetch_add(1, Ordering::Relaxed),
            depth_attachment_id: NEXT_ATTACHMENT_ID.fetch_add(1, Ordering::Relaxed),
            frame_fences,
            frame_values,
            cursor: 0,
            current_image: None,
            resize_flag,
            _resize_subscription: resize_subscription,
        };

        swap_chain.configure(device)?;
        Ok(swap_chain)
    }

    fn create_depth(
        device: &mut GraphicsDevice,
        properties: &SwapChainProperties,
        depth_format: Format,
    ) -> Result<(TextureHandle, TextureView)> {
        let texture = device.create_texture(
            TextureClass::Depth,
            TextureSpec {
                width: properties.extent.width,
                height: properties.extent.height,
                mip_levels: 1,
                format: depth_format,
                usage: hal::image::Usage::DEPTH_STENCIL_ATTACHMENT,
            },
        )?;
        let view = device.create_texture_view(&texture, ViewKind::D2, DEPTH_RESOURCES)?;
        Ok((texture, view))
    }

    fn configure(&mut self, device: &mut GraphicsDevice) -> Result<()> {
        let swap_config = SwapchainConfig {
            present_mode: self.properties.present_mode,
            composite_alpha_mode: self.properties.composite_alpha_mode,
            format: self.properties.format,
            extent: Extent2D {
                width: self.properties.extent.width,
                height: self.properties.extent.height,
            },
            image_count: self.properties.image_count,
            image_layers: 1,
            image_usage: ImgUsage::COLOR_ATTACHMENT,
        };

        let device_arc = device.clone_device_lock();
        let guard = device_arc.read().map_err(|_| crate::error::LockPoisoned::Device)?;
        unsafe {
            device
                .surface_mut()
                .configure_swapchain(&guard, swap_config)
                .map_err(|e| crate::error::Error::external(anyhow::anyhow!("configuring swapchain: {:?}", e)))?;
        }
        Ok(())
    }

    pub fn properties(&self) -> &SwapChainProperties {
        &self.properties
    }

    /// `StartFrame`: acquire the next presentable image, recreating the swap chain first if a
    /// resize was flagged since the last call. Returns the attachments this frame should render
    /// into, plus the fence (and value to wait for it to reach) the caller must submit as this
    /// frame's command buffer completion fence.
    pub fn start_frame(&mut self, device: &mut GraphicsDevice) -> Result<(FrameTargets, SharedTimelineFence, u64)> {
        if self.resize_flag.0.swap(false, Ordering::Relaxed) {
            self.recreate(device)?;
        }

        let fence = self.frame_fences[self.cursor].clone();
        let target_value = self.frame_values[self.cursor];
        if target_value > 0 {
            let device_arc = device.clone_device_lock();
            let guard = device_arc.read().map_err(|_| crate::error::LockPoisoned::Device)?;
            let locked = fence.read().map_err(|_| crate::error::LockPoisoned::Fence)?;
            locked.wait_for_value(&guard, target_value, u64::MAX)?;
        }

        let image = match self.try_acquire(device) {
            Ok(image) => image,
            Err(_) => {
                // The surface may have become out of date between resize notifications; retry
                // once after an unconditional recreate.
                self.recreate(device)?;
                self.try_acquire(device)?
            }
        };

        // Store the acquired image before borrowing its view: `SwapchainImageT::borrow` hands
        // back a reference into the image's own storage, which would dangle if taken before the
        // final move into `self.current_image`.
        self.current_image = Some(image);
        let color_view: &ImageViewT = self.current_image.as_ref().unwrap().borrow();
        let color = SwapChainAttachment::new(color_view, self.color_attachment_id, self.properties.format);
        let depth = self.depth.as_ref().map(|(_, view)| {
            SwapChainAttachment::new(view.raw(), self.depth_attachment_id, view.format())
        });

        let next_value = target_value + 1;
        self.frame_values[self.cursor] = next_value;

        Ok((
            FrameTargets {
                color,
                depth,
                extent: self.properties.extent,
            },
            fence,
            next_value,
        ))
    }

    fn try_acquire(&mut self, device: &mut GraphicsDevice) -> Result<SwapchainImageT> {
        let (image, suboptimal) = unsafe {
            device
                .surface_mut()
                .acquire_image(u64::MAX)
                .map_err(|e| crate::error::Error::external(anyhow::anyhow!("acquiring swapchain image: {:?}", e)))?
        };
        if suboptimal.is_some() {
            debug!("swapchain reported suboptimal on acquire");
            self.resize_flag.0.store(true, Ordering::Relaxed);
        }
        Ok(image)
    }

    /// `EndFrame`: present the image acquired by the most recent [`Self::start_frame`]. The
    /// caller must have already submitted this frame's command buffer (signalling the fence
    /// `start_frame` handed back) before calling this.
    pub fn end_frame(&mut self, device: &mut GraphicsDevice, queue: &SharedQueue) -> Result<()> {
        let image = self
            .current_image
            .take()
            .ok_or_else(|| crate::error::Error::invalid_operation("end_frame called without a matching start_frame"))?;

        let suboptimal = {
            let mut queue = queue.write().map_err(|_| crate::error::LockPoisoned::Queue)?;
            queue.present(device.surface_mut(), image)?
        };
        if suboptimal {
            self.resize_flag.0.store(true, Ordering::Relaxed);
        }

        self.cursor = (self.cursor + 1) % MAX_FRAMES_IN_FLIGHT;
        Ok(())
    }

    /// Rebuild the swap chain and (if present) the shared depth buffer against the surface's
    /// current extent. Called automatically by `start_frame` when a resize was flagged.
    fn recreate(&mut self, device: &mut GraphicsDevice) -> Result<()> {
        debug!("recreating swapchain");

        {
            let device_arc = device.clone_device_lock();
            let guard = device_arc.read().map_err(|_| crate::error::LockPoisoned::Device)?;
            unsafe { device.surface_mut().unconfigure_swapchain(&guard) };
        }

        if let Some((texture, view)) = self.depth.take() {
            let device_arc = device.clone_device_lock();
            let guard = device_arc.read().map_err(|_| crate::error::LockPoisoned::Device)?;
            view.deactivate(&guard);
            texture.deactivate(&guard)?;
        }

        self.properties = SwapChainProperties::find_best(
            device.adapter(),
            device.surface(),
            self.properties.depth_format.is_some(),
        )?;

        self.depth = if let Some(depth_format) = self.properties.depth_format {
            Some(Self::create_depth(device, &self.properties, depth_format)?)
        } else {
            None
        };
        self.color_attachment_id = NEXT_ATTACHMENT_ID.fetch_add(1, Ordering::Relaxed);
        self.depth_attachment_id = NEXT_ATTACHMENT_ID.fetch_add(1, Ordering::Relaxed);

        self.configure(device)
    }

    pub fn deactivate(mut self, device: &mut GraphicsDevice) -> Result<()> {
        self.current_image.take();

        {
            let device_arc = device.clone_device_lock();
            let guard = device_arc.read().map_err(|_| crate::error::LockPoisoned::Device)?;
            unsafe { device.surface_mut().unconfigure_swapchain(&guard) };
        }

        if let Some((texture, view)) = self.depth.take() {
            let device_arc = device.clone_device_lock();
            let guard = device_arc.read().map_err(|_| crate::error::LockPoisoned::Device)?;
            view.deactivate(&guard);
            texture.deactivate(&guard)?;
        }

        for fence in self.frame_fences.drain(..) {
            if let Ok(fence) = Arc::try_unwrap(fence) {
                let fence = fence.into_inner().map_err(|_| crate::error::LockPoisoned::Fence)?;
                let device_arc = device.clone_device_lock();
                let guard = device_arc.read().map_err(|_| crate::error::LockPoisoned::Device)?;
                fence.deactivate(&guard);
            } else {
                log::warn!("swap chain frame fence still has outstanding references at shutdown; leaking it");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MAX_FRAMES_IN_FLIGHT;

    #[test]
    fn max_frames_in_flight_is_double_buffered() {
        assert_eq!(MAX_FRAMES_IN_FLIGHT, 2);
    }
}
