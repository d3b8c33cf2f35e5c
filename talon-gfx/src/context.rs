//! The device context: the single per-thread recording/state-machine object everything else in
//! this crate is recorded through. A [`DeviceContext`] owns one [`crate::command::CommandPool`]
//! and always has exactly one [`crate::command::CommandBuffer`] open for recording (`current`);
//! every `Bind*`/`Set*` call only mutates binding state and clears a "not up to date" flag, and the
//! matching `Commit*` routine lazily materialises that state into the command buffer the next time
//! a draw needs it. This mirrors the retained-immediate-mode split the source material uses
//! (cheap repeated binds, one real state change right before the GPU work that needs it) without
//! the source's virtual dispatch: there's one concrete struct, no per-command-kind subclass.

use std::{
    any::Any,
    collections::HashMap,
    ops::Range,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, RwLock,
    },
};

use arrayvec::ArrayVec;
use hal::{
    buffer::IndexType,
    command::{
        AttachmentClear, BufferImageCopy, ClearValue, CommandBuffer as _, ImageBlit,
        SubpassContents,
    },
    device::Device as _,
    format::{Aspects, Format},
    image::{
        Access as ImageAccess, Extent, Filter, FramebufferAttachment, Layout, Offset,
        SubresourceLayers, SubresourceRange, Usage as ImageUsage, ViewCapabilities,
    },
    memory::Barrier,
    pass::{Attachment, AttachmentLayout, AttachmentOps},
    pso::{ClearRect, PipelineStage, Rect, ShaderStageFlags, Viewport},
};
use log::warn;

use crate::{
    builders::renderpass::{AttachmentSpec, RenderpassSpec},
    command::{CommandBuffer, CommandPool, RenderAttachment},
    descriptor::{ResourceHeap, TransitionPolicy},
    device::{BufferClass, GraphicsDevice},
    error::{LockPoisoned, Result, UsageError},
    fence::SharedTimelineFence,
    framebuffer::{FramebufferCache, FramebufferCacheKey},
    queue::SharedQueue,
    render_pass::{RenderPassCache, RenderPassCacheKey},
    resource::{
        buffer::{BufferHandle, MapAccess, MapType},
        pipeline::GraphicsPipeline,
        texture::{TextureHandle, TextureView},
    },
    state::{self, is_read_only_buffer_state, ResourceState},
    target::SwapChainAttachment,
    types::*,
};

/// Where a render-target attachment's image view comes from: a texture this crate owns the
/// lifetime of, or a view only borrowed for the current frame (a swap chain backbuffer, or its
/// shared depth buffer). The two need different treatment: an owned texture's [`ResourceState`]
/// lives on its handle and can be transitioned by [`DeviceContext::set_render_target`]; a borrowed
/// attachment's state isn't tracked by this crate at all (the swap chain itself manages the
/// presentable image's layout across acquire/present).
#[derive(Clone)]
pub enum AttachmentSource {
    Texture {
        handle: Arc<RwLock<TextureHandle>>,
        view: Arc<TextureView>,
    },
    SwapChain(SwapChainAttachment),
}

impl AttachmentSource {
    fn id(&self) -> u64 {
        match self {
            AttachmentSource::Texture { view, .. } => view.id(),
            AttachmentSource::SwapChain(a) => a.id(),
        }
    }

    fn format(&self) -> Format {
        match self {
            AttachmentSource::Texture { view, .. } => view.format(),
            AttachmentSource::SwapChain(a) => a.format(),
        }
    }

    /// # Safety
    /// Only valid for the duration of the frame this attachment source was built in; see
    /// [`SwapChainAttachment::view`].
    unsafe fn raw_view(&self) -> &ImageViewT {
        match self {
            AttachmentSource::Texture { view, .. } => view.raw(),
            AttachmentSource::SwapChain(a) => a.view(),
        }
    }

    fn framebuffer_attachment(&self) -> Result<FramebufferAttachment> {
        let usage = match self {
            AttachmentSource::Texture { handle, .. } => {
                handle.read().map_err(|_| LockPoisoned::MemoryPool)?.spec().usage
            }
            AttachmentSource::SwapChain(a) => {
                if a.format().is_depth() {
                    ImageUsage::DEPTH_STENCIL_ATTACHMENT
                } else {
                    ImageUsage::COLOR_ATTACHMENT
                }
            }
        };
        Ok(FramebufferAttachment {
            usage,
            format: self.format(),
            view_caps: ViewCapabilities::empty(),
        })
    }

    /// Transition the backing texture's recorded state, if this source owns one. A no-op for a
    /// borrowed swap chain attachment.
    fn transition(&self, cmd: &mut CommandBuffer, to: ResourceState, range: SubresourceRange) -> Result<()> {
        if let AttachmentSource::Texture { handle, .. } = self {
            let mut guard = handle.write().map_err(|_| LockPoisoned::MemoryPool)?;
            let from = guard.state();
            if from != to {
                state::record_image_barrier(cmd.raw_mut(), guard.raw(), from, to, range);
                guard.set_state(to);
            }
        }
        Ok(())
    }
}

/// A render target about to be (or already) bound: the resolved cache pair plus enough to clear
/// or barrier individual attachments later.
struct PendingRenderTarget {
    key: FramebufferCacheKey,
    render_pass: Arc<RenderPassT>,
    framebuffer: Arc<FramebufferT>,
    render_area: Rect,
    colors: Vec<AttachmentSource>,
    depth: Option<AttachmentSource>,
}

struct VertexBinding {
    buffer: Arc<RwLock<BufferHandle>>,
    offset: u64,
}

struct IndexBinding {
    buffer: Arc<RwLock<BufferHandle>>,
    offset: u64,
    index_type: IndexType,
}

struct ResourceHeapBinding {
    heap: Arc<RwLock<ResourceHeap>>,
    transition_policy: TransitionPolicy,
}

/// A buffer currently mapped through [`DeviceContext::map_buffer`], plus whatever the eventual
/// [`DeviceContext::unmap_buffer`] needs to finish the policy it was mapped under.
struct ActiveMap {
    access: MapAccess,
    map_type: MapType,
    range: Range<u64>,
    /// Set only for `Write + Discard`: the transient staging buffer actually mapped, and the real
    /// destination it must be copied into on unmap.
    staging: Option<Arc<RwLock<BufferHandle>>>,
}

/// A staging buffer handed off by a completed `Write + Discard` unmap, kept alive until the
/// command buffer that copies out of it has finished, then deactivated. Parked the same way
/// [`crate::command::pool::CommandPool`] parks retired command buffers and
/// [`crate::descriptor::pool::DescriptorPool`] parks retired descriptor-set groups.
struct PendingStagingCleanup {
    buffer: Arc<RwLock<BufferHandle>>,
    fence: SharedTimelineFence,
    expected_value: u64,
}

/// The state machine every draw call is recorded through. Owns one command pool and one
/// currently-recording command buffer, plus the render-pass/framebuffer caches and the lazily
/// materialised binding state (render target, pipeline, vertex/index buffers, resource heaps) that
/// `Commit*` routines flush into that buffer right before a draw.
///
/// A context never owns a [`GraphicsDevice`]; it only clones the handles it needs (the device
/// lock, the draw queue, the queue family) at construction, the same way [`crate::target::SwapChain`]
/// takes `&mut GraphicsDevice` per call instead of storing one. Any call that needs a
/// `GraphicsDevice`-level service it doesn't already hold (currently only [`Self::map_buffer`],
/// for a fresh staging buffer) takes one as an explicit parameter.
pub struct DeviceContext {
    device: Arc<RwLock<DeviceT>>,
    queue: SharedQueue,
    queue_family: hal::queue::QueueFamilyId,

    pool: CommandPool,
    current: CommandBuffer,

    /// The fence/value pair this recording cycle's [`Self::flush`] must submit against, supplied
    /// by whatever acquired this frame (see [`crate::target::SwapChain::start_frame`]) through
    /// [`Self::begin_frame`]. `None` until `begin_frame` is called, and again after every `flush`
    /// until the next `begin_frame` — a context may not record past a flush without being told
    /// which fence its next submission completes.
    pending_fence: Option<(SharedTimelineFence, u64)>,

    render_pass_cache: RenderPassCache,
    framebuffer_cache: FramebufferCache,

    /// A 1-byte immutable buffer bound in place of any vertex-buffer slot the caller left unset,
    /// so `hal` never sees a missing binding. See `DESIGN.md`.
    null_vertex_buffer: Arc<RwLock<BufferHandle>>,

    pending_render_target: Option<PendingRenderTarget>,
    render_pass_up_to_date: bool,

    pipeline: Option<Arc<GraphicsPipeline>>,
    pipeline_up_to_date: bool,

    vertex_buffers: Vec<Option<VertexBinding>>,
    vertex_buffers_up_to_date: bool,

    index_buffer: Option<IndexBinding>,
    index_buffer_up_to_date: bool,

    resource_heaps: Vec<Option<ResourceHeapBinding>>,
    resource_heaps_up_to_date: bool,

    active_maps: HashMap<usize, ActiveMap>,
    pending_staging_cleanup: Vec<PendingStagingCleanup>,

    live_context_counter: Arc<AtomicUsize>,
}

impl DeviceContext {
    pub fn new(device: &GraphicsDevice) -> Result<Self> {
        let device_lock = device.clone_device_lock();
        let queue_family = device.draw_queue_family();
        let pool = {
            let guard = device_lock.read().map_err(|_| LockPoisoned::Device)?;
            CommandPool::new(&guard, queue_family)?
        };

        let null_vertex_buffer = Arc::new(RwLock::new(device.create_buffer(
            BufferClass::Data,
            1,
            hal::buffer::Usage::VERTEX | hal::buffer::Usage::INDEX | hal::buffer::Usage::UNIFORM,
        )?));

        let mut pool = pool;
        let mut current = {
            let guard = device_lock.read().map_err(|_| LockPoisoned::Device)?;
            pool.acquire(&guard)
        };
        current.begin();

        device.live_context_counter().fetch_add(1, Ordering::Relaxed);

        Ok(DeviceContext {
            device: device_lock,
            queue: device.draw_queue(),
            queue_family,
            pool,
            current,
            pending_fence: None,
            render_pass_cache: RenderPassCache::new(),
            framebuffer_cache: FramebufferCache::new(),
            null_vertex_buffer,
            pending_render_target: None,
            render_pass_up_to_date: true,
            pipeline: None,
            pipeline_up_to_date: true,
            vertex_buffers: Vec::new(),
            vertex_buffers_up_to_date: true,
            index_buffer: None,
            index_buffer_up_to_date: true,
            resource_heaps: Vec::new(),
            resource_heaps_up_to_date: true,
            active_maps: HashMap::new(),
            pending_staging_cleanup: Vec::new(),
            live_context_counter: device.live_context_counter(),
        })
    }

    /// Supply the fence/value pair this recording cycle's [`Self::flush`] must submit against.
    /// Must be called once per frame before any `Draw`/`Flush`, typically right after
    /// [`crate::target::SwapChain::start_frame`] with the pair it returned.
    pub fn begin_frame(&mut self, fence: SharedTimelineFence, expected_value: u64) {
        self.pending_fence = Some((fence, expected_value));
    }

    pub fn queue_family(&self) -> hal::queue::QueueFamilyId {
        self.queue_family
    }

    /// Drop any cached framebuffer referencing `view_id` from this context's
    /// [`FramebufferCache`]. A [`TextureView`] carries no back-reference to the contexts it was
    /// ever bound against, so the caller destroying the view (normally right before
    /// [`TextureView::deactivate`]) is responsible for calling this on every context it was used
    /// with — see §4.6's "entries whose weak-ref views have expired" cleanup, here expressed as an
    /// explicit notification instead of a weak-pointer scan, since `hal`'s image views carry no
    /// natural weak handle to scan for.
    pub fn evict_view(&mut self, device: &GraphicsDevice, view_id: u64) -> Result<()> {
        let device_guard = device.clone_device_lock();
        let guard = device_guard.read().map_err(|_| LockPoisoned::Device)?;
        self.framebuffer_cache.evict_views(&guard, view_id);
        Ok(())
    }

    // ---- 4.4.1 CommitRenderPass -------------------------------------------------------------

    fn commit_render_pass(&mut self) -> Result<()> {
        if self.render_pass_up_to_date {
            return Ok(());
        }

        let pending = self
            .pending_render_target
            .as_ref()
            .ok_or(UsageError::NoRenderPassCommitted)?;

        self.current.retain(pending.render_pass.clone());
        self.current.retain(pending.framebuffer.clone());

        if self.current.has_active_render_pass() {
            self.current.end_render_pass();
        }

        let clear = ClearValue::default();
        let attachments: ArrayVec<RenderAttachment<'_>, 9> = pending
            .colors
            .iter()
            .chain(pending.depth.iter())
            // SAFETY: every source here was resolved for the frame currently being recorded by
            // `set_render_target`, and no two frames overlap on one context.
            .map(|a| RenderAttachment {
                view: unsafe { a.raw_view() },
                clear_value: clear,
            })
            .collect();

        self.current.begin_render_pass(
            pending.render_pass.clone(),
            pending.framebuffer.clone(),
            pending.render_area,
            &attachments,
        );

        // Re-applied unconditionally so viewport/scissor state is always well-defined right after
        // a resize, regardless of whether the bound pipeline declared dynamic viewport/scissor
        // state; see `DESIGN.md`.
        let viewport = Viewport {
            rect: pending.render_area,
            depth: 0.0..1.0,
        };
        unsafe {
            self.current.raw_mut().set_viewports(0, std::iter::once(viewport));
            self.current.raw_mut().set_scissors(0, std::iter::once(pending.render_area));
        }

        self.render_pass_up_to_date = true;
        Ok(())
    }

    // ---- 4.4.2 CommitPipeline ----------------------------------------------------------------

    fn commit_pipeline(&mut self) -> Result<()> {
        if self.pipeline_up_to_date {
            return Ok(());
        }
        let pipeline = self.pipeline.as_ref().ok_or(UsageError::NoPipelineCommitted)?;
        self.current.retain(pipeline.clone());
        unsafe {
            self.current.raw_mut().bind_graphics_pipeline(&pipeline.pipeline);
        }
        self.pipeline_up_to_date = true;
        Ok(())
    }

    // ---- 4.4.3 CommitVertexBuffers -----------------------------------------------------------

    fn commit_vertex_buffers(&mut self) -> Result<()> {
        if self.vertex_buffers_up_to_date {
            return Ok(());
        }

        if self.vertex_buffers.is_empty() {
            self.vertex_buffers_up_to_date = true;
            return Ok(());
        }

        let mut bound: ArrayVec<(&BufferT, hal::buffer::SubRange), 16> = ArrayVec::new();
        let mut guards = Vec::with_capacity(self.vertex_buffers.len());

        for slot in &self.vertex_buffers {
            match slot {
                Some(binding) => {
                    self.current.retain(binding.buffer.clone());
                    let guard = binding.buffer.read().map_err(|_| LockPoisoned::MemoryPool)?;
                    guards.push((guard, binding.offset));
                }
                None => {
                    self.current.retain(self.null_vertex_buffer.clone());
                    let guard = self.null_vertex_buffer.read().map_err(|_| LockPoisoned::MemoryPool)?;
                    guards.push((guard, 0));
                }
            }
        }

        for (guard, offset) in &guards {
            bound.push((
                guard.raw(),
                hal::buffer::SubRange {
                    offset: *offset,
                    size: None,
                },
            ));
        }

        unsafe {
            self.current.raw_mut().bind_vertex_buffers(0, bound);
        }

        self.vertex_buffers_up_to_date = true;
        Ok(())
    }

    // ---- 4.4.4 CommitIndexBuffer -------------------------------------------------------------

    fn commit_index_buffer(&mut self) -> Result<()> {
        if self.index_buffer_up_to_date {
            return Ok(());
        }
        let binding = self
            .index_buffer
            .as_ref()
            .ok_or_else(|| crate::error::Error::invalid_operation("draw_indexed with no index buffer bound"))?;

        self.current.retain(binding.buffer.clone());
        let guard = binding.buffer.read().map_err(|_| LockPoisoned::MemoryPool)?;
        unsafe {
            self.current.raw_mut().bind_index_buffer(
                guard.raw(),
                hal::buffer::SubRange {
                    offset: binding.offset,
                    size: None,
                },
                binding.index_type,
            );
        }
        drop(guard);

        self.index_buffer_up_to_date = true;
        Ok(())
    }

    // ---- 4.4.5 CommitResourceHeap -------------------------------------------------------------

    fn commit_resource_heaps(&mut self) -> Result<()> {
        if self.resource_heaps_up_to_date {
            return Ok(());
        }

        let (fence, expected_value) = self
            .pending_fence
            .clone()
            .ok_or_else(|| crate::error::Error::invalid_operation("draw with no frame begun (call begin_frame first)"))?;

        let pipeline = self.pipeline.as_ref().ok_or(UsageError::NoPipelineCommitted)?.clone();

        let mut device = self.device.write().map_err(|_| LockPoisoned::Device)?;

        for (set_index, slot) in self.resource_heaps.iter().enumerate() {
            let binding = match slot {
                Some(b) => b,
                None => continue,
            };
            self.current.retain(binding.heap.clone());
            let mut heap = binding.heap.write().map_err(|_| LockPoisoned::DescriptorPool)?;
            let set = heap.prepare_binding(
                &mut device,
                &mut self.current,
                fence.clone(),
                expected_value,
                binding.transition_policy,
            )?;
            unsafe {
                self.current.raw_mut().bind_graphics_descriptor_sets(
                    &pipeline.pipeline_layout,
                    set_index,
                    std::iter::once(set),
                    std::iter::empty(),
                );
            }
        }

        self.resource_heaps_up_to_date = true;
        Ok(())
    }

    // ---- 4.4.6 PreDraw / PreDrawIndexed --------------------------------------------------------

    fn pre_draw(&mut self) -> Result<()> {
        self.commit_pipeline()?;
        self.commit_vertex_buffers()?;
        self.commit_resource_heaps()?;
        // Committed last: a barrier inserted while committing the resource heap may have had to
        // end an active render pass, and re-opening it needs to happen after that, not before.
        self.commit_render_pass()?;
        Ok(())
    }

    fn pre_draw_indexed(&mut self) -> Result<()> {
        self.pre_draw()?;
        self.commit_index_buffer()?;
        Ok(())
    }

    pub fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) -> Result<()> {
        self.pre_draw()?;
        unsafe {
            self.current.raw_mut().draw(vertices, instances);
        }
        Ok(())
    }

    pub fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) -> Result<()> {
        self.pre_draw_indexed()?;
        unsafe {
            self.current.raw_mut().draw_indexed(indices, base_vertex, instances);
        }
        Ok(())
    }

    // ---- Binding calls ------------------------------------------------------------------------

    pub fn bind_pipeline(&mut self, pipeline: Arc<GraphicsPipeline>) {
        self.pipeline = Some(pipeline);
        self.pipeline_up_to_date = false;
    }

    /// For pipelines built with `dynamic_viewport`/`dynamic_scissor`; has no effect on the
    /// viewport/scissor [`Self::commit_render_pass`] reapplies on every render-pass commit.
    pub fn set_viewport(&mut self, viewport: Viewport) {
        unsafe {
            self.current.raw_mut().set_viewports(0, std::iter::once(viewport));
        }
    }

    pub fn set_scissor_rectangle(&mut self, rect: Rect) {
        unsafe {
            self.current.raw_mut().set_scissors(0, std::iter::once(rect));
        }
    }

    pub fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[(Arc<RwLock<BufferHandle>>, u64)]) {
        let needed = first_binding as usize + buffers.len();
        if self.vertex_buffers.len() < needed {
            self.vertex_buffers.resize_with(needed, || None);
        }
        for (i, (buffer, offset)) in buffers.iter().enumerate() {
            self.vertex_buffers[first_binding as usize + i] = Some(VertexBinding {
                buffer: buffer.clone(),
                offset: *offset,
            });
        }
        self.vertex_buffers_up_to_date = false;
    }

    pub fn bind_index_buffer(&mut self, buffer: Arc<RwLock<BufferHandle>>, offset: u64, index_type: IndexType) {
        self.index_buffer = Some(IndexBinding {
            buffer,
            offset,
            index_type,
        });
        self.index_buffer_up_to_date = false;
    }

    pub fn bind_resource_heap(&mut self, set_index: u32, heap: Arc<RwLock<ResourceHeap>>, transition_policy: TransitionPolicy) {
        let needed = set_index as usize + 1;
        if self.resource_heaps.len() < needed {
            self.resource_heaps.resize_with(needed, || None);
        }
        self.resource_heaps[set_index as usize] = Some(ResourceHeapBinding { heap, transition_policy });
        self.resource_heaps_up_to_date = false;
    }

    // ---- 4.4.9 SetRenderTarget ------------------------------------------------------------------

    /// Build a cache key from `colors`/`depth`, resolve the render pass and framebuffer it
    /// resolves to, and stash the pair as pending. If `auto_transition`, each color attachment is
    /// transitioned to `RENDER_TARGET` and the depth attachment (if any) to `DEPTH_STENCIL_WRITE`
    /// first; on failure partway through, the previously pending render target is left untouched
    /// and the error is returned (strong exception safety at this call's boundary).
    pub fn set_render_target(
        &mut self,
        colors: Vec<AttachmentSource>,
        depth: Option<AttachmentSource>,
        extent: Extent,
        auto_transition: bool,
    ) -> Result<()> {
        if colors.is_empty() && depth.is_none() {
            return Err(crate::error::Error::invalid_argument(
                "set_render_target requires at least one color or depth attachment",
            ));
        }

        let color_formats: Vec<Format> = colors.iter().map(AttachmentSource::format).collect();
        let depth_format = depth.as_ref().map(AttachmentSource::format);

        let key = RenderPassCacheKey {
            sample_count: 1,
            color_formats: color_formats.clone(),
            depth_format,
            input_formats: vec![],
        };

        let mut device = self.device.write().map_err(|_| LockPoisoned::Device)?;

        let render_pass = self.render_pass_cache.get_or_create(
            &mut device,
            key,
            uniform_load_store_spec(&color_formats, depth_format),
        )?;

        let mut view_ids: Vec<u64> = colors.iter().map(AttachmentSource::id).collect();
        if let Some(d) = &depth {
            view_ids.push(d.id());
        }
        let fb_key = FramebufferCacheKey::new(&render_pass, view_ids, extent);

        let attachment_descs: Result<Vec<FramebufferAttachment>> = colors
            .iter()
            .chain(depth.iter())
            .map(AttachmentSource::framebuffer_attachment)
            .collect();
        let attachment_descs = attachment_descs?;

        let framebuffer = self.framebuffer_cache.get_or_create(
            &mut device,
            fb_key.clone(),
            render_pass.clone(),
            attachment_descs.into_iter(),
            extent,
        )?;
        drop(device);

        if auto_transition {
            for color in &colors {
                color.transition(&mut self.current, ResourceState::RENDER_TARGET, full_color_range())?;
            }
            if let Some(d) = &depth {
                d.transition(&mut self.current, ResourceState::DEPTH_STENCIL_WRITE, full_depth_range(d.format()))?;
            }
        }

        self.pending_render_target = Some(PendingRenderTarget {
            key: fb_key,
            render_pass,
            framebuffer,
            render_area: extent.rect(),
            colors,
            depth,
        });
        self.render_pass_up_to_date = false;

        Ok(())
    }

    // ---- 4.4.8 ClearRenderTarget / ClearDepthStencilView -----------------------------------------

    pub fn clear_render_target(&mut self, view_id: u64, color: [f32; 4], auto_transition: bool) -> Result<()> {
        let index = self
            .pending_render_target
            .as_ref()
            .and_then(|p| p.colors.iter().position(|a| a.id() == view_id));

        if let Some(index) = index {
            self.commit_render_pass()?;
            unsafe {
                self.current.raw_mut().clear_attachments(
                    std::iter::once(AttachmentClear::Color {
                        index,
                        value: color.into(),
                    }),
                    std::iter::once(ClearRect {
                        rect: self.pending_render_target.as_ref().unwrap().render_area,
                        layers: 0..1,
                    }),
                );
            }
            return Ok(());
        }

        let source = self.find_attachment_source(view_id).ok_or_else(|| {
            crate::error::Error::invalid_argument("clear_render_target: view not bound as a render target")
        })?;

        if self.current.has_active_render_pass() {
            self.current.end_render_pass();
            self.render_pass_up_to_date = false;
        }

        if auto_transition {
            source.transition(&mut self.current, ResourceState::TRANSFER_DESTINATION, full_color_range())?;
        }

        if let AttachmentSource::Texture { handle, .. } = &source {
            self.current.retain(handle.clone());
            let guard = handle.read().map_err(|_| LockPoisoned::MemoryPool)?;
            unsafe {
                self.current.raw_mut().clear_image(
                    guard.raw(),
                    Layout::TransferDstOptimal,
                    ClearValue { color: color.into() },
                    std::iter::once(full_color_range()),
                );
            }
        }

        Ok(())
    }

    pub fn clear_depth_stencil_view(&mut self, view_id: u64, depth: f32, stencil: u32, auto_transition: bool) -> Result<()> {
        let is_pending_depth = self
            .pending_render_target
            .as_ref()
            .and_then(|p| p.depth.as_ref())
            .map(|d| d.id() == view_id)
            .unwrap_or(false);

        if is_pending_depth {
            self.commit_render_pass()?;
            unsafe {
                self.current.raw_mut().clear_attachments(
                    std::iter::once(AttachmentClear::DepthStencil {
                        depth: Some(depth),
                        stencil: Some(stencil),
                    }),
                    std::iter::once(ClearRect {
                        rect: self.pending_render_target.as_ref().unwrap().render_area,
                        layers: 0..1,
                    }),
                );
            }
            return Ok(());
        }

        let source = self.find_attachment_source(view_id).ok_or_else(|| {
            crate::error::Error::invalid_argument("clear_depth_stencil_view: view not bound as a render target")
        })?;

        if self.current.has_active_render_pass() {
            self.current.end_render_pass();
            self.render_pass_up_to_date = false;
        }

        let depth_range = full_depth_range(source.format());

        if auto_transition {
            source.transition(&mut self.current, ResourceState::TRANSFER_DESTINATION, depth_range)?;
        }

        if let AttachmentSource::Texture { handle, .. } = &source {
            self.current.retain(handle.clone());
            let guard = handle.read().map_err(|_| LockPoisoned::MemoryPool)?;
            unsafe {
                self.current.raw_mut().clear_image(
                    guard.raw(),
                    Layout::TransferDstOptimal,
                    ClearValue {
                        depth_stencil: hal::command::ClearDepthStencil { depth, stencil },
                    },
                    std::iter::once(depth_range),
                );
            }
        }

        Ok(())
    }

    fn find_attachment_source(&self, view_id: u64) -> Option<AttachmentSource> {
        self.pending_render_target.as_ref().and_then(|p| {
            p.colors
                .iter()
                .chain(p.depth.iter())
                .find(|a| a.id() == view_id)
                .cloned()
        })
    }

    // ---- 4.4.7 Barriers -----------------------------------------------------------------------

    pub fn transit_texture_state(
        &mut self,
        texture: &Arc<RwLock<TextureHandle>>,
        to: ResourceState,
        range: SubresourceRange,
        record_state: bool,
    ) -> Result<()> {
        let mut guard = texture.write().map_err(|_| LockPoisoned::MemoryPool)?;
        let from = guard.state();
        if from == to {
            return Ok(());
        }

        if self.current.has_active_render_pass() {
            self.current.end_render_pass();
            self.render_pass_up_to_date = false;
        }

        self.current.retain(texture.clone());
        state::record_image_barrier(self.current.raw_mut(), guard.raw(), from, to, range);
        if record_state {
            guard.set_state(to);
        }
        Ok(())
    }

    pub fn transit_buffer_state(
        &mut self,
        buffer: &Arc<RwLock<BufferHandle>>,
        to: ResourceState,
        record_state: bool,
    ) -> Result<()> {
        let mut guard = buffer.write().map_err(|_| LockPoisoned::MemoryPool)?;
        let from = guard.state();
        if from == to || (is_read_only_buffer_state(from) && is_read_only_buffer_state(to)) {
            return Ok(());
        }

        if self.current.has_active_render_pass() {
            self.current.end_render_pass();
            self.render_pass_up_to_date = false;
        }

        self.current.retain(buffer.clone());
        state::record_buffer_barrier(self.current.raw_mut(), guard.raw(), from, to);
        if record_state {
            guard.set_state(to);
        }
        Ok(())
    }

    // ---- CopyBuffer / CopyBufferToTexture -------------------------------------------------------

    /// Record a buffer-to-buffer copy. Both buffers must already be in
    /// `TRANSFER_SOURCE`/`TRANSFER_DESTINATION` respectively; unlike [`Self::map_buffer`]'s
    /// `Discard` policy, this does not transition either side for the caller.
    pub fn copy_buffer(&mut self, src: &Arc<RwLock<BufferHandle>>, dst: &Arc<RwLock<BufferHandle>>, range: Range<u64>) -> Result<()> {
        let src_guard = src.read().map_err(|_| LockPoisoned::MemoryPool)?;
        let dst_guard = dst.read().map_err(|_| LockPoisoned::MemoryPool)?;
        dst_guard.record_copy_from(src_guard.raw(), range, self.current.raw_mut());
        drop(src_guard);
        drop(dst_guard);
        self.current.retain(src.clone());
        self.current.retain(dst.clone());
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn copy_buffer_to_texture(
        &mut self,
        src: &Arc<RwLock<BufferHandle>>,
        dst: &Arc<RwLock<TextureHandle>>,
        buffer_offset: u64,
        mip_level: u8,
        image_extent: Extent,
    ) -> Result<()> {
        let src_guard = src.read().map_err(|_| LockPoisoned::MemoryPool)?;
        let dst_guard = dst.read().map_err(|_| LockPoisoned::MemoryPool)?;

        let region = BufferImageCopy {
            buffer_offset,
            buffer_width: image_extent.width,
            buffer_height: image_extent.height,
            image_layers: SubresourceLayers {
                aspects: Aspects::COLOR,
                level: mip_level,
                layers: 0..1,
            },
            image_offset: Offset { x: 0, y: 0, z: 0 },
            image_extent,
        };

        unsafe {
            self.current.raw_mut().copy_buffer_to_image(
                src_guard.raw(),
                dst_guard.raw(),
                Layout::TransferDstOptimal,
                std::iter::once(region),
            );
        }
        drop(src_guard);
        drop(dst_guard);
        self.current.retain(src.clone());
        self.current.retain(dst.clone());
        Ok(())
    }

    // ---- 4.4.10 MapBuffer / UnmapBuffer ----------------------------------------------------------

    /// Map `range` of `buffer` for CPU access under `access`/`map_type`. Only `Read + Default`,
    /// `Write + Overwrite`, and `Write + Discard` are valid combinations (see
    /// [`crate::resource::buffer::MapAccess`]/[`crate::resource::buffer::MapType`]); anything else
    /// is an invalid argument. Every pool this crate maps through is allocated `CPU_VISIBLE |
    /// COHERENT` (see `crate::mem`), so there is no explicit flush/invalidate step here — the
    /// source material's manual ones are folded into that allocation guarantee instead.
    pub fn map_buffer(
        &mut self,
        device: &GraphicsDevice,
        buffer: &Arc<RwLock<BufferHandle>>,
        range: Range<u64>,
        access: MapAccess,
        map_type: MapType,
    ) -> Result<*mut u8> {
        let valid = matches!(
            (access, map_type),
            (MapAccess::Read, MapType::Default) | (MapAccess::Write, MapType::Overwrite) | (MapAccess::Write, MapType::Discard)
        );
        if !valid {
            return Err(crate::error::Error::invalid_argument(format!(
                "unsupported map combination: {:?} + {:?}",
                access, map_type
            )));
        }

        let key = Arc::as_ptr(buffer) as usize;
        if self.active_maps.contains_key(&key) {
            return Err(UsageError::BufferAlreadyMapped.into());
        }

        match map_type {
            MapType::Discard => {
                let size = range.end - range.start;
                let staging = Arc::new(RwLock::new(device.create_buffer(
                    BufferClass::Staging,
                    size,
                    hal::buffer::Usage::TRANSFER_SRC,
                )?));
                let ptr = {
                    let mut device_guard = self.device.write().map_err(|_| LockPoisoned::Device)?;
                    let mut staging_guard = staging.write().map_err(|_| LockPoisoned::MemoryPool)?;
                    staging_guard.map(&mut device_guard, 0..size, MapType::Discard)?
                };
                self.active_maps.insert(
                    key,
                    ActiveMap {
                        access,
                        map_type,
                        range,
                        staging: Some(staging),
                    },
                );
                Ok(ptr)
            }
            _ => {
                let ptr = {
                    let mut device_guard = self.device.write().map_err(|_| LockPoisoned::Device)?;
                    let mut guard = buffer.write().map_err(|_| LockPoisoned::MemoryPool)?;
                    guard.map(&mut device_guard, range.clone(), map_type)?
                };
                self.active_maps.insert(
                    key,
                    ActiveMap {
                        access,
                        map_type,
                        range,
                        staging: None,
                    },
                );
                Ok(ptr)
            }
        }
    }

    pub fn unmap_buffer(&mut self, buffer: &Arc<RwLock<BufferHandle>>) -> Result<()> {
        let key = Arc::as_ptr(buffer) as usize;
        let active = self.active_maps.remove(&key).ok_or(UsageError::BufferNotMapped)?;

        match active.staging {
            None => {
                // Host reads/writes through coherent memory need no GPU-side barrier; the
                // buffer's recorded `ResourceState` describes queue access scope, not host
                // visibility, so it is left untouched here.
                let _ = active.access;
                let mut device_guard = self.device.write().map_err(|_| LockPoisoned::Device)?;
                let mut guard = buffer.write().map_err(|_| LockPoisoned::MemoryPool)?;
                guard.unmap(&mut device_guard)?;
                Ok(())
            }
            Some(staging) => {
                {
                    let mut device_guard = self.device.write().map_err(|_| LockPoisoned::Device)?;
                    let mut staging_guard = staging.write().map_err(|_| LockPoisoned::MemoryPool)?;
                    staging_guard.unmap(&mut device_guard)?;
                    staging_guard.set_state(ResourceState::TRANSFER_SOURCE);
                }

                self.transit_buffer_state(&staging, ResourceState::TRANSFER_SOURCE, false)?;
                self.transit_buffer_state(buffer, ResourceState::TRANSFER_DESTINATION, true)?;
                self.copy_buffer(&staging, buffer, active.range.clone())?;

                if let Some((fence, expected_value)) = self.pending_fence.clone() {
                    self.pending_staging_cleanup.push(PendingStagingCleanup {
                        buffer: staging,
                        fence,
                        expected_value,
                    });
                } else {
                    // Nothing to track completion against; best-effort immediate attempt.
                    if let Ok(inner) = Arc::try_unwrap(staging) {
                        if let Ok(inner) = inner.into_inner() {
                            let device_guard = self.device.write().map_err(|_| LockPoisoned::Device)?;
                            let _ = inner.deactivate(&device_guard);
                        }
                    }
                }
                Ok(())
            }
        }
    }

    // ---- 4.4.11 GenerateMips --------------------------------------------------------------------

    pub fn generate_mips(&mut self, texture: &Arc<RwLock<TextureHandle>>, view_id: u64) -> Result<()> {
        let _ = view_id;
        let mut guard = texture.write().map_err(|_| LockPoisoned::MemoryPool)?;
        let spec = guard.spec().clone();
        let mip_count = spec.mip_levels;
        if mip_count < 2 {
            return Ok(());
        }

        if self.current.has_active_render_pass() {
            self.current.end_render_pass();
            self.render_pass_up_to_date = false;
        }
        self.current.retain(texture.clone());

        let initial_state = guard.state();

        for i in 1..mip_count {
            let src_range = mip_range(i - 1);
            let dst_range = mip_range(i);

            let src_from = if i == 1 { initial_state } else { ResourceState::TRANSFER_DESTINATION };
            state::record_image_barrier(
                self.current.raw_mut(),
                guard.raw(),
                src_from,
                ResourceState::TRANSFER_SOURCE,
                src_range,
            );
            state::record_image_barrier(
                self.current.raw_mut(),
                guard.raw(),
                ResourceState::UNDEFINED,
                ResourceState::TRANSFER_DESTINATION,
                dst_range,
            );

            let src_w = (spec.width >> (i - 1)).max(1);
            let src_h = (spec.height >> (i - 1)).max(1);
            let dst_w = (spec.width >> i).max(1);
            let dst_h = (spec.height >> i).max(1);

            let blit = ImageBlit {
                src_subresource: SubresourceLayers {
                    aspects: Aspects::COLOR,
                    level: i - 1,
                    layers: 0..1,
                },
                src_bounds: Offset { x: 0, y: 0, z: 0 }..Offset {
                    x: src_w as i32,
                    y: src_h as i32,
                    z: 1,
                },
                dst_subresource: SubresourceLayers {
                    aspects: Aspects::COLOR,
                    level: i,
                    layers: 0..1,
                },
                dst_bounds: Offset { x: 0, y: 0, z: 0 }..Offset {
                    x: dst_w as i32,
                    y: dst_h as i32,
                    z: 1,
                },
            };

            unsafe {
                self.current.raw_mut().blit_image(
                    guard.raw(),
                    Layout::TransferSrcOptimal,
                    guard.raw(),
                    Layout::TransferDstOptimal,
                    Filter::Linear,
                    std::iter::once(blit),
                );
            }
        }

        state::record_image_barrier(
            self.current.raw_mut(),
            guard.raw(),
            ResourceState::TRANSFER_DESTINATION,
            ResourceState::TRANSFER_SOURCE,
            mip_range(mip_count - 1),
        );
        guard.set_state(ResourceState::TRANSFER_SOURCE);

        Ok(())
    }

    // ---- Fences / queue -----------------------------------------------------------------------

    pub fn append_signal_fence(&mut self, fence: SharedTimelineFence) -> Result<()> {
        self.queue.write().map_err(|_| LockPoisoned::Queue)?.append_signal_fence(fence);
        Ok(())
    }

    pub fn append_wait_fence(&mut self, fence: SharedTimelineFence, stage: PipelineStage) -> Result<()> {
        self.queue
            .write()
            .map_err(|_| LockPoisoned::Queue)?
            .append_wait_fence(fence, stage);
        Ok(())
    }

    pub fn wait_queue_idle(&self) -> Result<()> {
        self.queue.read().map_err(|_| LockPoisoned::Queue)?.wait_idle()
    }

    // ---- 4.4.12 Flush -------------------------------------------------------------------------

    /// 1. Acquire a fresh command buffer first, so a failed submission still leaves the context
    ///    recording.
    /// 2. End any active render pass.
    /// 3. Finish recording.
    /// 4. Reset every "up to date" flag and clean up the framebuffer cache / completed staging
    ///    buffers.
    /// 5. Submit. On failure, the fresh buffer is already current; the error just propagates.
    /// 6. Park the submitted buffer and start recording the fresh one.
    pub fn flush(&mut self) -> Result<()> {
        let (fence, expected_value) = self
            .pending_fence
            .take()
            .ok_or_else(|| crate::error::Error::invalid_operation("flush called without begin_frame"))?;

        let device_guard = self.device.read().map_err(|_| LockPoisoned::Device)?;
        let mut fresh = self.pool.acquire(&device_guard);
        drop(device_guard);
        fresh.begin();

        let mut submitted = std::mem::replace(&mut self.current, fresh);

        if submitted.has_active_render_pass() {
            submitted.end_render_pass();
        }
        submitted.finish();

        self.render_pass_up_to_date = true;
        self.pipeline_up_to_date = true;
        self.vertex_buffers_up_to_date = true;
        self.index_buffer_up_to_date = true;
        self.resource_heaps_up_to_date = true;

        self.reap_staging_cleanup()?;

        let result = {
            let device_guard = self.device.read().map_err(|_| LockPoisoned::Device)?;
            let mut fence_guard = fence.write().map_err(|_| LockPoisoned::Fence)?;
            let mut queue_guard = self.queue.write().map_err(|_| LockPoisoned::Queue)?;
            queue_guard.submit(&device_guard, &submitted, &mut fence_guard, expected_value)
        };

        self.pool.give_back(submitted, Some((fence, expected_value)));

        result
    }

    fn reap_staging_cleanup(&mut self) -> Result<()> {
        let device_guard = self.device.read().map_err(|_| LockPoisoned::Device)?;
        let mut still_pending = Vec::with_capacity(self.pending_staging_cleanup.len());

        for entry in self.pending_staging_cleanup.drain(..) {
            let ready = entry
                .fence
                .read()
                .map_err(|_| LockPoisoned::Fence)?
                .poll(&device_guard)?
                >= entry.expected_value;

            if !ready {
                still_pending.push(entry);
                continue;
            }

            match Arc::try_unwrap(entry.buffer) {
                Ok(lock) => match lock.into_inner() {
                    Ok(buffer) => {
                        buffer.deactivate(&device_guard)?;
                    }
                    Err(_) => warn!("staging buffer lock poisoned at cleanup time; leaking it"),
                },
                Err(arc) => {
                    still_pending.push(PendingStagingCleanup {
                        buffer: arc,
                        fence: entry.fence,
                        expected_value: entry.expected_value,
                    });
                }
            }
        }

        self.pending_staging_cleanup = still_pending;
        Ok(())
    }

    /// Tear down every resource this context owns: the null vertex buffer, any staging buffers
    /// still waiting on a fence, the command pool, and the render-pass/framebuffer caches. The
    /// caller must `wait_queue_idle` first; this does not.
    pub fn deactivate(self) -> Result<()> {
        let DeviceContext {
            device,
            mut pool,
            mut current,
            null_vertex_buffer,
            render_pass_cache,
            framebuffer_cache,
            pending_staging_cleanup,
            live_context_counter,
            ..
        } = self;

        let device_guard = device.write().map_err(|_| LockPoisoned::Device)?;

        if current.has_active_render_pass() {
            current.end_render_pass();
        }
        if current.is_recording() {
            current.finish();
        }
        pool.give_back(current, None);

        for entry in pending_staging_cleanup {
            match Arc::try_unwrap(entry.buffer) {
                Ok(lock) => {
                    if let Ok(buffer) = lock.into_inner() {
                        buffer.deactivate(&device_guard)?;
                    }
                }
                Err(_) => warn!("staging buffer still referenced at context teardown; leaking it"),
            }
        }

        match Arc::try_unwrap(null_vertex_buffer) {
            Ok(lock) => {
                if let Ok(buffer) = lock.into_inner() {
                    buffer.deactivate(&device_guard)?;
                }
            }
            Err(_) => warn!("null vertex buffer still referenced at context teardown; leaking it"),
        }

        render_pass_cache.deactivate(&device_guard);
        framebuffer_cache.deactivate(&device_guard);
        pool.deactivate(&device_guard);

        drop(device_guard);
        live_context_counter.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }
}

fn full_color_range() -> SubresourceRange {
    SubresourceRange {
        aspects: Aspects::COLOR,
        level_start: 0,
        level_count: None,
        layer_start: 0,
        layer_count: None,
    }
}

fn full_depth_range(format: Format) -> SubresourceRange {
    let mut aspects = Aspects::DEPTH;
    if format.is_stencil() {
        aspects |= Aspects::STENCIL;
    }
    SubresourceRange {
        aspects,
        level_start: 0,
        level_count: None,
        layer_start: 0,
        layer_count: None,
    }
}

fn mip_range(level: u8) -> SubresourceRange {
    SubresourceRange {
        aspects: Aspects::COLOR,
        level_start: level,
        level_count: Some(1),
        layer_start: 0,
        layer_count: Some(1),
    }
}

/// Build a render-pass spec with `Load`/`Store` on every attachment. Explicit clears are issued by
/// [`DeviceContext::clear_render_target`]/[`DeviceContext::clear_depth_stencil_view`] as their own
/// commands rather than baked into the pass, precisely because [`RenderPassCacheKey`] doesn't
/// distinguish attachment ops; see `DESIGN.md`.
fn uniform_load_store_spec(color_formats: &[Format], depth_format: Option<Format>) -> RenderpassSpec {
    let ops = AttachmentOps::new(hal::pass::AttachmentLoadOp::Load, hal::pass::AttachmentStoreOp::Store);
    let stencil_ops = AttachmentOps::DONT_CARE;

    let colors = color_formats
        .iter()
        .map(|format| AttachmentSpec {
            attachment: Attachment {
                format: Some(*format),
                samples: 1,
                ops,
                stencil_ops,
                layouts: Layout::Undefined..Layout::ColorAttachmentOptimal,
            },
            used_layout: Layout::ColorAttachmentOptimal as AttachmentLayout,
        })
        .collect();

    let depth = depth_format.map(|format| AttachmentSpec {
        attachment: Attachment {
            format: Some(format),
            samples: 1,
            ops,
            stencil_ops,
            layouts: Layout::Undefined..Layout::DepthStencilAttachmentOptimal,
        },
        used_layout: Layout::DepthStencilAttachmentOptimal as AttachmentLayout,
    });

    RenderpassSpec {
        colors,
        depth,
        inputs: vec![],
        resolves: vec![],
        preserves: vec![],
    }
}
