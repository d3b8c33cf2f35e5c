use std::{any::Any, mem::ManuallyDrop, sync::Arc};

use hal::{
    command::{ClearValue, CommandBuffer as _, CommandBufferFlags, RenderAttachmentInfo, SubpassContents},
    pso::Rect,
};

use crate::types::*;

/// One render pass attachment as supplied at `begin_render_pass` time: the concrete image view to
/// write into (or read `Load` ops from) for this frame, plus the value to clear it to if the
/// committed render pass's attachment op for this slot turns out to be `Clear`.
///
/// `hal` 0.8's imageless-framebuffer model builds a [`crate::framebuffer::FramebufferCache`] entry
/// from attachment *descriptors* (format/usage only) and defers supplying the actual view to this
/// call, which is why a fresh `RenderAttachment` has to be assembled by the caller on every pass
/// rather than being bakeable into the framebuffer itself.
///
/// Holds a borrow rather than an owned `Arc`: a swap chain's current backbuffer view is only ever
/// borrowed from the acquired image for the lifetime of one frame and was never meant to be
/// retained past `present`, so ownership isn't this call's to take. `DeviceContext` is responsible
/// for calling [`CommandBuffer::retain`] on any device-owned attachment (one it actually destroys
/// on a `deactivate`) before this call, satisfying the usual every-referenced-resource-has-a-
/// strong-ref rule without forcing that same rule onto a resource this crate doesn't own.
pub struct RenderAttachment<'a> {
    pub view: &'a ImageViewT,
    pub clear_value: ClearValue,
}

/// A primary command buffer, plus the set of strong references to GPU resources it touched while
/// being recorded.
///
/// `hal` command buffers don't know what they reference; a buffer, texture, or pipeline destroyed
/// while the GPU is still executing a command buffer that uses it is undefined behaviour. Rather
/// than track this with lifetimes (which would make the whole recording API borrow-check against
/// a single frame, awkward for a retained-mode context like [`crate::context::DeviceContext`]),
/// every `Commit*`/draw call that references a resource clones an `Arc` into [`Self::retain`]. The
/// buffer then holds those `Arc`s until it is next reset, which only happens after its completion
/// fence is satisfied — so the resource's last strong reference from the command buffer's
/// perspective cannot outlive the work that reads it.
pub struct CommandBuffer {
    raw: ManuallyDrop<CommandBufferT>,
    recording: bool,
    retained: Vec<Arc<dyn Any + Send + Sync>>,

    /// Set between `begin_render_pass`/`end_render_pass`. Holds strong refs to the render pass and
    /// framebuffer so `DeviceContext` can tell whether a pass is active without tracking that
    /// state twice, and so those two objects can't be destroyed mid-pass even if every other
    /// reference to them is dropped.
    active_render_pass: Option<(Arc<RenderPassT>, Arc<FramebufferT>)>,
}

impl CommandBuffer {
    pub(crate) fn from_raw(raw: CommandBufferT) -> Self {
        CommandBuffer {
            raw: ManuallyDrop::new(raw),
            recording: false,
            retained: Vec::new(),
            active_render_pass: None,
        }
    }

    /// Begin recording. Drops any strong references retained by the previous use of this buffer —
    /// by the time it's handed back out, its previous submission's fence must already have been
    /// waited on by the caller (see [`crate::command::CommandPool::give_back`]).
    pub fn begin(&mut self) {
        debug_assert!(!self.recording, "begin() called on an already-recording command buffer");
        self.retained.clear();
        self.active_render_pass = None;
        unsafe { self.raw.begin_primary(CommandBufferFlags::ONE_TIME_SUBMIT) };
        self.recording = true;
    }

    pub fn finish(&mut self) {
        debug_assert!(self.recording, "finish() called on a command buffer that wasn't recording");
        debug_assert!(
            self.active_render_pass.is_none(),
            "finish() called with a render pass still active"
        );
        unsafe { self.raw.finish() };
        self.recording = false;
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn has_active_render_pass(&self) -> bool {
        self.active_render_pass.is_some()
    }

    /// Record `vkCmdBeginRenderPass`, supplying each attachment's concrete image view for this
    /// frame (the imageless-framebuffer model only bakes formats into the framebuffer itself).
    /// Retains strong references to `render_pass` and `framebuffer` for as long as the pass is
    /// active (and, via [`Self::retain`]'s usual rules, until this buffer is next reset); the
    /// attachment views themselves are the caller's responsibility to retain, see
    /// [`RenderAttachment`].
    pub fn begin_render_pass(
        &mut self,
        render_pass: Arc<RenderPassT>,
        framebuffer: Arc<FramebufferT>,
        render_area: Rect,
        attachments: &[RenderAttachment<'_>],
    ) {
        debug_assert!(self.recording, "begin_render_pass() called outside recording");
        debug_assert!(
            self.active_render_pass.is_none(),
            "begin_render_pass() called while a pass was already active"
        );

        let infos = attachments.iter().map(|a| RenderAttachmentInfo {
            image_view: a.view,
            clear_value: a.clear_value,
        });

        unsafe {
            self.raw.begin_render_pass(
                &render_pass,
                &framebuffer,
                render_area,
                infos,
                SubpassContents::Inline,
            );
        }

        self.retained.push(render_pass.clone());
        self.retained.push(framebuffer.clone());
        self.active_render_pass = Some((render_pass, framebuffer));
    }

    /// Record `vkCmdEndRenderPass`. A no-op (but debug-asserted against) if no pass is active.
    pub fn end_render_pass(&mut self) {
        debug_assert!(
            self.active_render_pass.is_some(),
            "end_render_pass() called with no active render pass"
        );
        if self.active_render_pass.take().is_some() {
            unsafe { self.raw.end_render_pass() };
        }
    }

    /// Keep `resource` alive at least as long as this command buffer's most recent recording.
    pub fn retain(&mut self, resource: Arc<dyn Any + Send + Sync>) {
        self.retained.push(resource);
    }

    pub fn raw(&self) -> &CommandBufferT {
        &self.raw
    }

    pub fn raw_mut(&mut self) -> &mut CommandBufferT {
        &mut self.raw
    }

    pub(crate) fn into_raw(mut self) -> CommandBufferT {
        self.retained.clear();
        self.active_render_pass = None;
        unsafe { ManuallyDrop::take(&mut self.raw) }
    }
}
