//! The graphics device: owns the `hal` instance, adapter and logical device, and is the factory
//! for everything else in this crate (contexts, resources, the swap chain).

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    mem::ManuallyDrop,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, RwLock,
    },
};

use anyhow::Context as _;
use hal::{
    format::Format,
    image::{SubresourceRange, ViewKind},
    queue::QueueFamilyId,
    Device as _, Instance as _, PhysicalDevice as _, PhysicalDeviceProperties,
};
use log::debug;
use raw_window_handle::HasRawWindowHandle;

use crate::{
    descriptor::{layout::ResourceHeapLayout, ResourceBindingLayout, ResourceHeap},
    error::{EnvironmentError, LockPoisoned, Result},
    fence::TimelineFence,
    mem::{DataPool, DepthBufferPool, MemoryPool, StagingPool, TexturesPool},
    queue::{DrawQueueSelector, QueueFamilySelector, QueueNegotiator, SharedQueue},
    resource::{
        buffer::{Buffer, BufferHandle},
        pipeline::{GraphicsPipeline, PipelineSpec},
        sampler::Sampler,
        shader::{ShaderCompiler, ShaderModule, ShaderSource},
        texture::{Texture, TextureHandle, TextureSpec, TextureView},
    },
    types::*,
};

/// Trait implemented by whatever else needs to claim auxiliary queue families (e.g. a texture
/// loader that wants a dedicated transfer queue) before the logical device is opened. This is the
/// Rust expression of `IDrawPass::find_aux_queues` generalised to any collaborator, not just a
/// single draw pass: [`GraphicsDevice::new`] calls every registered negotiator function once,
/// before queue families are finalised and the device is opened.
pub trait AuxQueueRequest {
    fn find_aux_queues(&self, adapter: &Adapter, negotiator: &mut QueueNegotiator) -> Result<()>;
}

/// Owns the Vulkan instance, the selected physical device (`Adapter`), and the opened logical
/// device. Everything else in this crate (contexts, resources, the swap chain) is created through
/// a `GraphicsDevice`.
pub struct GraphicsDevice {
    instance: back::Instance,
    adapter: Adapter,
    device: Arc<RwLock<DeviceT>>,
    physical_device_properties: PhysicalDeviceProperties,
    queue_negotiator: QueueNegotiator,
    draw_queue: SharedQueue,

    /// The surface `self` was created against, kept alive so [`Self::create_swap_chain`] can
    /// build a swap chain from it after construction. `DrawQueueSelector` only ever borrows it.
    surface: ManuallyDrop<SurfaceT>,

    /// Lazily-initialised memory pools, keyed by the concrete [`MemoryPool`] type. Built on first
    /// use rather than eagerly, since not every application needs every pool (e.g. one with no
    /// depth-tested geometry never touches `DepthBufferPool`).
    pools: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,

    /// `DepthBufferPool` additionally needs a concrete format at construction time, which isn't
    /// derivable from the device alone, so it's tracked separately from [`Self::pools`]. Only one
    /// format is supported per device at a time; requesting a second logs a warning and reuses the
    /// existing pool rather than erroring — see `DESIGN.md`.
    depth_pool: RwLock<Option<(Format, Arc<RwLock<DepthBufferPool>>)>>,

    /// Call site of this device's creation, captured only when `track-device-contexts` is
    /// enabled. Surfaced through [`Self::creation_backtrace`] to help diagnose "device dropped
    /// while a context referencing it is still alive" during development.
    #[cfg(feature = "track-device-contexts")]
    creation_backtrace: backtrace::Backtrace,

    /// Number of live [`crate::context::DeviceContext`]s created from this device. Debug-only: a
    /// non-zero count when the device is dropped indicates a logic error in the application, not
    /// something this crate can recover from, so it is surfaced as a debug assertion rather than
    /// runtime-checked in release builds.
    live_context_count: Arc<AtomicUsize>,
}

impl GraphicsDevice {
    /// Create a device suitable for drawing to `window`'s surface, and to any auxiliary queues
    /// requested by `aux`.
    ///
    /// Adapter selection picks the first adapter exposing a graphics- and surface-capable queue
    /// family; this repository does not attempt to score adapters by type (discrete vs
    /// integrated) or VRAM. See `DESIGN.md` for why this is an accepted simplification rather than
    /// an oversight.
    pub fn new<W: HasRawWindowHandle>(window: &W, aux: &[&dyn AuxQueueRequest]) -> Result<Self> {
        let (instance, surface, mut adapters) = unsafe {
            let instance =
                back::Instance::create("talon-gfx", 1).context("creating gfx-hal instance")?;
            let surface = instance
                .create_surface(window)
                .map_err(|e| anyhow::anyhow!("creating surface: {:?}", e))?;
            let adapters = instance.enumerate_adapters();
            (instance, surface, adapters)
        };

        let surface_supports_graphics = |adapter: &Adapter| {
            adapter
                .queue_families
                .iter()
                .any(|f| surface.supports_queue_family(f) && f.queue_type().supports_graphics())
        };

        let adapter_index = adapters
            .iter()
            .position(surface_supports_graphics)
            .ok_or(EnvironmentError::NoSuitableFamilies)?;
        let adapter = adapters.remove(adapter_index);

        let mut queue_negotiator = QueueNegotiator::new();
        let draw_selector = DrawQueueSelector::new(&surface, &adapter);
        queue_negotiator
            .find(&adapter, &draw_selector)
            .context("finding a draw queue family")?;

        for req in aux {
            req.find_aux_queues(&adapter, &mut queue_negotiator)
                .context("auxiliary collaborator failed to negotiate a queue family")?;
        }

        let draw_family = queue_negotiator
            .family::<DrawQueueSelector>()
            .ok_or(EnvironmentError::NoSuitableFamilies)?;
        queue_negotiator.set_draw_family(draw_family);

        // Build the open-spec: one (family, priorities) pair per distinct family id that was
        // negotiated above, deduplicated since `hal` rejects opening the same family twice.
        let mut seen = std::collections::HashSet::new();
        let mut families_to_open = Vec::new();
        for family in &adapter.queue_families {
            if queue_negotiator
                .family::<DrawQueueSelector>()
                .map(|id| id == family.id())
                .unwrap_or(false)
                && seen.insert(family.id())
            {
                families_to_open.push((family, vec![1.0f32]));
            }
        }

        let gpu = unsafe {
            adapter
                .physical_device
                .open(
                    &families_to_open
                        .iter()
                        .map(|(f, p)| (*f, p.as_slice()))
                        .collect::<Vec<_>>(),
                    hal::Features::empty(),
                )
                .context("opening logical device")?
        };

        let device = Arc::new(RwLock::new(gpu.device));
        queue_negotiator.set_queue_groups(gpu.queue_groups);

        let draw_queue = queue_negotiator
            .get_queue::<DrawQueueSelector>()
            .context("claiming the draw queue")?;

        let physical_device_properties = adapter.physical_device.properties();

        debug!(
            "opened device on adapter {:?}, draw family {:?}",
            adapter.info.name, draw_family
        );

        Ok(GraphicsDevice {
            instance,
            adapter,
            device,
            physical_device_properties,
            queue_negotiator,
            draw_queue,
            surface: ManuallyDrop::new(surface),
            pools: RwLock::new(HashMap::new()),
            depth_pool: RwLock::new(None),
            #[cfg(feature = "track-device-contexts")]
            creation_backtrace: backtrace::Backtrace::new_unresolved(),
            live_context_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn clone_device_lock(&self) -> Arc<RwLock<DeviceT>> {
        self.device.clone()
    }

    pub fn lock_device(&self) -> Result<std::sync::RwLockWriteGuard<'_, DeviceT>> {
        self.device.write().map_err(|_| LockPoisoned::Device.into())
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    pub fn instance(&self) -> &back::Instance {
        &self.instance
    }

    pub fn physical_device_properties(&self) -> &PhysicalDeviceProperties {
        &self.physical_device_properties
    }

    pub fn draw_queue_family(&self) -> QueueFamilyId {
        self.queue_negotiator
            .family::<DrawQueueSelector>()
            .expect("draw family was set during GraphicsDevice::new")
    }

    pub fn draw_queue(&self) -> SharedQueue {
        self.draw_queue.clone()
    }

    pub fn queue_negotiator(&self) -> &QueueNegotiator {
        &self.queue_negotiator
    }

    pub fn queue_negotiator_mut(&mut self) -> &mut QueueNegotiator {
        &mut self.queue_negotiator
    }

    pub fn get_queue<T: QueueFamilySelector>(&mut self) -> Result<SharedQueue> {
        self.queue_negotiator.get_queue::<T>()
    }

    /// Number of [`crate::context::DeviceContext`]s currently alive against this device. Only
    /// meaningful as a debug aid; not used to gate any operation.
    pub fn live_context_count(&self) -> usize {
        self.live_context_count.load(Ordering::Relaxed)
    }

    pub(crate) fn live_context_counter(&self) -> Arc<AtomicUsize> {
        self.live_context_count.clone()
    }

    #[cfg(feature = "track-device-contexts")]
    pub fn creation_backtrace(&self) -> &backtrace::Backtrace {
        &self.creation_backtrace
    }

    /// The surface this device was opened against, for capability queries that don't need
    /// exclusive access (format/present-mode enumeration).
    pub fn surface(&self) -> &SurfaceT {
        &self.surface
    }

    /// The surface this device was opened against. `&mut` because swap chain (re)creation needs
    /// exclusive access to query/configure it.
    pub fn surface_mut(&mut self) -> &mut SurfaceT {
        &mut self.surface
    }

    /// Fetch (lazily creating) the shared pool instance for memory-pool type `P`.
    fn pool<P: MemoryPool>(&self) -> Result<Arc<RwLock<P>>> {
        let tid = TypeId::of::<P>();
        {
            let pools = self.pools.read().map_err(|_| LockPoisoned::MemoryPool)?;
            if let Some(existing) = pools.get(&tid) {
                return Ok(existing
                    .clone()
                    .downcast::<RwLock<P>>()
                    .expect("pool registry key/type mismatch"));
            }
        }

        let created = P::from_device(self)?;
        let mut pools = self.pools.write().map_err(|_| LockPoisoned::MemoryPool)?;
        let entry = pools
            .entry(tid)
            .or_insert_with(|| created.clone() as Arc<dyn Any + Send + Sync>);
        Ok(entry
            .clone()
            .downcast::<RwLock<P>>()
            .expect("pool registry key/type mismatch"))
    }

    /// Fetch (lazily creating) the depth-buffer pool for `format`. Only one format is supported
    /// per device; a later request for a different format reuses the existing pool and logs a
    /// warning rather than erroring, since mixing depth formats within one device is unusual and
    /// not something the spec requires supporting cleanly.
    fn depth_pool(&self, format: Format) -> Result<Arc<RwLock<DepthBufferPool>>> {
        {
            let existing = self.depth_pool.read().map_err(|_| LockPoisoned::MemoryPool)?;
            if let Some((existing_format, pool)) = existing.as_ref() {
                if *existing_format == format {
                    return Ok(pool.clone());
                }
                log::warn!(
                    "depth pool already created for {:?}, ignoring request for {:?}",
                    existing_format,
                    format
                );
                return Ok(pool.clone());
            }
        }

        let pool = DepthBufferPool::with_depth_format(self, format)?;
        let mut slot = self.depth_pool.write().map_err(|_| LockPoisoned::MemoryPool)?;
        *slot = Some((format, pool.clone()));
        Ok(pool)
    }

    /// `CreateBuffer`: allocate a new buffer of the given class, size and usage flags.
    pub fn create_buffer(
        &self,
        class: BufferClass,
        size: u64,
        usage: hal::buffer::Usage,
    ) -> Result<BufferHandle> {
        let device = self.lock_device()?;
        match class {
            BufferClass::Data => {
                let pool = self.pool::<DataPool>()?;
                Ok(BufferHandle::Data(Buffer::new(&device, pool, size, usage)?))
            }
            BufferClass::Staging => {
                let pool = self.pool::<StagingPool>()?;
                Ok(BufferHandle::Staging(Buffer::new(&device, pool, size, usage)?))
            }
        }
    }

    /// `CreateTexture`: allocate a new image of the given class (color or depth/stencil) from
    /// `spec`.
    pub fn create_texture(&self, class: TextureClass, spec: TextureSpec) -> Result<TextureHandle> {
        let device = self.lock_device()?;
        match class {
            TextureClass::Color => {
                let pool = self.pool::<TexturesPool>()?;
                Ok(TextureHandle::Color(Texture::new(&device, pool, spec)?))
            }
            TextureClass::Depth => {
                let pool = self.depth_pool(spec.format)?;
                Ok(TextureHandle::Depth(Texture::new(&device, pool, spec)?))
            }
        }
    }

    /// `CreateTextureView`.
    pub fn create_texture_view(
        &self,
        texture: &TextureHandle,
        view_kind: ViewKind,
        resources: SubresourceRange,
    ) -> Result<TextureView> {
        let device = self.lock_device()?;
        texture.create_view(&device, view_kind, resources)
    }

    /// `CreateSampler`.
    pub fn create_sampler(&self, desc: &hal::image::SamplerDesc) -> Result<Sampler> {
        let device = self.lock_device()?;
        Sampler::new(&device, desc)
    }

    /// `CreateRenderPass`: a one-off render pass, not registered in any
    /// [`crate::render_pass::RenderPassCache`] (those are populated lazily by
    /// [`crate::context::DeviceContext::set_render_target`]). Used to build the render pass a
    /// pipeline is compiled against ahead of any context needing the same attachment layout.
    pub fn create_render_pass(&self, spec: crate::builders::renderpass::RenderpassSpec) -> Result<RenderPassT> {
        let mut device = self.lock_device()?;
        spec.build_renderpass(&mut device)
    }

    /// `CreateFramebuffer`: a one-off framebuffer, bypassing
    /// [`crate::framebuffer::FramebufferCache`] for the same reason as [`Self::create_render_pass`].
    pub fn create_framebuffer(
        &self,
        render_pass: &RenderPassT,
        attachments: impl Iterator<Item = hal::image::FramebufferAttachment>,
        extent: hal::image::Extent,
    ) -> Result<FramebufferT> {
        let device = self.lock_device()?;
        Ok(unsafe { device.create_framebuffer(render_pass, attachments, extent)? })
    }

    /// `CreateGraphicsPipeline`.
    pub fn create_graphics_pipeline<'b, T: Iterator<Item = &'b DescriptorSetLayoutT>>(
        &self,
        spec: PipelineSpec,
        compiler: &mut dyn ShaderCompiler,
        render_pass: Arc<RenderPassT>,
        extent: hal::image::Extent,
        set_layouts: T,
    ) -> Result<GraphicsPipeline> {
        let mut device = self.lock_device()?;
        spec.build(&mut device, compiler, render_pass, extent, set_layouts)
    }

    /// `CreateResourceHeapLayout`.
    pub fn create_resource_heap_layout(
        &self,
        bindings: Vec<ResourceBindingLayout>,
    ) -> Result<ResourceHeapLayout> {
        let device = self.lock_device()?;
        ResourceHeapLayout::new(&device, bindings)
    }

    /// `CreateResourceHeap`. Construction cannot fail; the underlying descriptor pool is built
    /// lazily on first use.
    pub fn create_resource_heap(&self, layout: Arc<ResourceHeapLayout>) -> ResourceHeap {
        ResourceHeap::new(layout)
    }

    /// `CreateFence`.
    pub fn create_fence(&self, initial_value: u64) -> Result<TimelineFence> {
        let device = self.lock_device()?;
        TimelineFence::new(&device, initial_value)
    }

    /// `CompileShaderModule`.
    pub fn compile_shader_module(
        &self,
        compiler: &mut dyn ShaderCompiler,
        source: &ShaderSource,
    ) -> Result<ShaderModule> {
        let device = self.lock_device()?;
        ShaderModule::new(&device, compiler, source)
    }

    /// The staging pool backing transient upload/discard-map buffers, for callers (notably
    /// [`crate::context::DeviceContext`]'s `Discard` map policy) that need to create a staging
    /// buffer themselves rather than going through [`Self::create_buffer`].
    pub fn staging_pool(&self) -> Result<Arc<RwLock<StagingPool>>> {
        self.pool::<StagingPool>()
    }

    /// `WaitIdle`: block until every queue on this device has drained.
    pub fn wait_idle(&self) -> Result<()> {
        let device = self.lock_device()?;
        unsafe { device.wait_idle() }.map_err(crate::error::Error::from)
    }
}

/// Which [`crate::mem::MemoryPool`] a [`GraphicsDevice::create_buffer`] call should draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferClass {
    /// General-purpose host-visible data: vertex, index, uniform buffers.
    Data,
    /// Transient staging buffer for upload/discard-map round-trips.
    Staging,
}

/// Which [`crate::mem::MemoryPool`] a [`GraphicsDevice::create_texture`] call should draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureClass {
    /// Device-local, optimal-tiling image for sampled/render-target use.
    Color,
    /// Device-local image backing a depth/stencil attachment.
    Depth,
}

impl Drop for GraphicsDevice {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.live_context_count.load(Ordering::Relaxed),
            0,
            "GraphicsDevice dropped while {} DeviceContext(s) are still alive",
            self.live_context_count.load(Ordering::Relaxed)
        );
        unsafe {
            let surface = ManuallyDrop::take(&mut self.surface);
            self.instance.destroy_surface(surface);
        }
    }
}
