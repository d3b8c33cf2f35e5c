//! Resource states and the pipeline barriers needed to transition between them.
//!
//! A [`ResourceState`] names the next way a texture or buffer is about to be used (as a render
//! target, as a sampled texture, as a transfer destination, ...). Every `Commit*`/`PreDraw`/`Clear*`
//! call on [`crate::context::DeviceContext`] that changes how a resource will be used resolves the
//! old and new state to a concrete `hal` access mask, pipeline stage, and (for images) layout, and
//! emits exactly one barrier covering that transition. This file is the single place that
//! knowledge lives, grounded on the fixed state/transition table used by the Vulkan backend this
//! design is distilled from rather than invented per call site.

use hal::{
    buffer::Access as BufferAccess,
    command::CommandBuffer as _,
    image::Access as ImageAccess,
    image::{Layout, SubresourceRange},
    memory::Barrier,
    pso::PipelineStage,
};

use crate::types::{BufferT, CommandBufferT, ImageT};

bitflags::bitflags! {
    /// The way a resource is about to be read or written.
    ///
    /// This is a bitflag type because a buffer can legitimately be used as more than one thing at
    /// once (e.g. a combined vertex+index buffer is `VERTEX | INDEX`), but most call sites deal
    /// with exactly one bit set, and [`image_barrier_state`]/[`buffer_barrier_state`] require
    /// that.
    pub struct ResourceState: u32 {
        /// Freshly created, or the initial layout of a resource for which we do not care about
        /// preserving contents across the Undefined -> X transition.
        const UNDEFINED = 0;
        const TRANSFER_SOURCE = 1 << 0;
        const TRANSFER_DESTINATION = 1 << 1;
        const UNIFORM = 1 << 2;
        const VERTEX = 1 << 3;
        const INDEX = 1 << 4;
        const RENDER_TARGET = 1 << 5;
        const DEPTH_STENCIL_READ = 1 << 6;
        const DEPTH_STENCIL_WRITE = 1 << 7;
        const SHADER_READ_ONLY = 1 << 8;
        const PRESENT = 1 << 9;
    }
}

/// States a [`crate::resource::Texture`] can legally be in.
pub const TEXTURE_STATES: ResourceState = ResourceState::from_bits_truncate(
    ResourceState::UNDEFINED.bits()
        | ResourceState::TRANSFER_SOURCE.bits()
        | ResourceState::TRANSFER_DESTINATION.bits()
        | ResourceState::RENDER_TARGET.bits()
        | ResourceState::DEPTH_STENCIL_READ.bits()
        | ResourceState::DEPTH_STENCIL_WRITE.bits()
        | ResourceState::SHADER_READ_ONLY.bits()
        | ResourceState::PRESENT.bits(),
);

/// States a [`crate::resource::Buffer`] can legally be in.
pub const BUFFER_STATES: ResourceState = ResourceState::from_bits_truncate(
    ResourceState::UNDEFINED.bits()
        | ResourceState::TRANSFER_SOURCE.bits()
        | ResourceState::TRANSFER_DESTINATION.bits()
        | ResourceState::UNIFORM.bits()
        | ResourceState::VERTEX.bits()
        | ResourceState::INDEX.bits(),
);

pub fn is_texture_state(state: ResourceState) -> bool {
    TEXTURE_STATES.contains(state)
}

pub fn is_buffer_state(state: ResourceState) -> bool {
    BUFFER_STATES.contains(state)
}

/// The only states a buffer can be read from without also being written to. Used by
/// [`crate::context::DeviceContext::transit_buffer_state`] to skip barriers between two read
/// states, the same way a no-op `from == to` transition is skipped: a read-after-read needs no
/// memory dependency, only read-after-write and write-after-read do.
const READ_ONLY_BUFFER_STATES: ResourceState = ResourceState::from_bits_truncate(
    ResourceState::TRANSFER_SOURCE.bits()
        | ResourceState::UNIFORM.bits()
        | ResourceState::VERTEX.bits()
        | ResourceState::INDEX.bits(),
);

pub fn is_read_only_buffer_state(state: ResourceState) -> bool {
    READ_ONLY_BUFFER_STATES.contains(state)
}

/// Whether a [`crate::context::DeviceContext`] call should record the resource's new state into
/// the handle itself (`Transit`) or merely emit the barrier without touching the recorded state
/// (`Explicit`, for a resource whose state is instead being tracked externally by a caller that
/// drives it from more than one context — see `DESIGN.md`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTransition {
    Transit,
    Explicit,
}

/// Resolve a single-bit (or `UNDEFINED`) [`ResourceState`] to the access mask and image layout a
/// texture barrier should use on one side of a transition.
///
/// Panics if more than one bit is set; callers only ever transition a texture into one concrete
/// use at a time, so a combined state here means a bug in the caller, not a resource that needs
/// representing.
pub fn image_barrier_state(state: ResourceState) -> (ImageAccess, Layout) {
    match state {
        ResourceState::UNDEFINED => (ImageAccess::empty(), Layout::Undefined),
        ResourceState::TRANSFER_SOURCE => (ImageAccess::TRANSFER_READ, Layout::TransferSrcOptimal),
        ResourceState::TRANSFER_DESTINATION => {
            (ImageAccess::TRANSFER_WRITE, Layout::TransferDstOptimal)
        }
        ResourceState::RENDER_TARGET => (
            ImageAccess::COLOR_ATTACHMENT_READ | ImageAccess::COLOR_ATTACHMENT_WRITE,
            Layout::ColorAttachmentOptimal,
        ),
        ResourceState::DEPTH_STENCIL_READ => (
            ImageAccess::DEPTH_STENCIL_ATTACHMENT_READ,
            Layout::DepthStencilReadOnlyOptimal,
        ),
        ResourceState::DEPTH_STENCIL_WRITE => (
            ImageAccess::DEPTH_STENCIL_ATTACHMENT_WRITE,
            Layout::DepthStencilAttachmentOptimal,
        ),
        ResourceState::SHADER_READ_ONLY => {
            (ImageAccess::SHADER_READ, Layout::ShaderReadOnlyOptimal)
        }
        ResourceState::PRESENT => (ImageAccess::empty(), Layout::Present),
        other => panic!("image_barrier_state called with non-exclusive state {:?}", other),
    }
}

/// Resolve a single-bit (or `UNDEFINED`) [`ResourceState`] to the access mask a buffer barrier
/// should use on one side of a transition.
pub fn buffer_barrier_state(state: ResourceState) -> BufferAccess {
    match state {
        ResourceState::UNDEFINED => BufferAccess::empty(),
        ResourceState::TRANSFER_SOURCE => BufferAccess::TRANSFER_READ,
        ResourceState::TRANSFER_DESTINATION => BufferAccess::TRANSFER_WRITE,
        ResourceState::INDEX => BufferAccess::INDEX_BUFFER_READ,
        ResourceState::VERTEX => BufferAccess::VERTEX_BUFFER_READ,
        ResourceState::UNIFORM => BufferAccess::UNIFORM_READ,
        other => panic!("buffer_barrier_state called with non-exclusive state {:?}", other),
    }
}

/// The pipeline stage a transition into `state` should be synchronised against.
pub fn pipeline_stage(state: ResourceState) -> PipelineStage {
    match state {
        ResourceState::UNDEFINED => PipelineStage::TOP_OF_PIPE,
        ResourceState::TRANSFER_SOURCE | ResourceState::TRANSFER_DESTINATION => {
            PipelineStage::TRANSFER
        }
        ResourceState::INDEX | ResourceState::VERTEX => PipelineStage::VERTEX_INPUT,
        ResourceState::UNIFORM => PipelineStage::VERTEX_SHADER | PipelineStage::FRAGMENT_SHADER,
        ResourceState::DEPTH_STENCIL_READ | ResourceState::DEPTH_STENCIL_WRITE => {
            PipelineStage::EARLY_FRAGMENT_TESTS | PipelineStage::LATE_FRAGMENT_TESTS
        }
        ResourceState::RENDER_TARGET => PipelineStage::COLOR_ATTACHMENT_OUTPUT,
        ResourceState::PRESENT => PipelineStage::BOTTOM_OF_PIPE,
        ResourceState::SHADER_READ_ONLY => {
            PipelineStage::VERTEX_SHADER | PipelineStage::FRAGMENT_SHADER
        }
        other => panic!("pipeline_stage called with non-exclusive state {:?}", other),
    }
}

/// Record a pipeline barrier transitioning `buffer` from `from` to `to` on `cmd`, synchronised
/// between the two states' pipeline stages. A no-op if `from == to`: callers are expected to skip
/// the call entirely in that case (see `DeviceContext::transit_buffer_state`), but doing it here
/// too means call sites that can't cheaply check (like `ResourceHeap::prepare_binding`, which may
/// be transitioning several bindings at once) don't need to.
pub fn record_buffer_barrier(
    cmd: &mut CommandBufferT,
    buffer: &BufferT,
    from: ResourceState,
    to: ResourceState,
) {
    if from == to {
        return;
    }

    let barrier = Barrier::Buffer {
        states: buffer_barrier_state(from)..buffer_barrier_state(to),
        target: buffer,
        families: None,
        range: hal::buffer::SubRange::WHOLE,
    };

    unsafe {
        cmd.pipeline_barrier(
            pipeline_stage(from)..pipeline_stage(to),
            hal::memory::Dependencies::empty(),
            std::iter::once(barrier),
        );
    }
}

/// Record a pipeline barrier transitioning `image` (over `range`) from `from` to `to` on `cmd`.
/// A no-op if `from == to`, for the same reason as [`record_buffer_barrier`].
pub fn record_image_barrier(
    cmd: &mut CommandBufferT,
    image: &ImageT,
    from: ResourceState,
    to: ResourceState,
    range: SubresourceRange,
) {
    if from == to {
        return;
    }

    let (src_access, src_layout) = image_barrier_state(from);
    let (dst_access, dst_layout) = image_barrier_state(to);

    let barrier = Barrier::Image {
        states: (src_access, src_layout)..(dst_access, dst_layout),
        target: image,
        families: None,
        range,
    };

    unsafe {
        cmd.pipeline_barrier(
            pipeline_stage(from)..pipeline_stage(to),
            hal::memory::Dependencies::empty(),
            std::iter::once(barrier),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_states_excludes_buffer_only_states() {
        assert!(!TEXTURE_STATES.contains(ResourceState::UNIFORM));
        assert!(!TEXTURE_STATES.contains(ResourceState::VERTEX));
        assert!(!TEXTURE_STATES.contains(ResourceState::INDEX));
    }

    #[test]
    fn buffer_states_excludes_texture_only_states() {
        assert!(!BUFFER_STATES.contains(ResourceState::RENDER_TARGET));
        assert!(!BUFFER_STATES.contains(ResourceState::PRESENT));
        assert!(!BUFFER_STATES.contains(ResourceState::SHADER_READ_ONLY));
    }

    #[test]
    fn transfer_states_are_shared_between_textures_and_buffers() {
        assert!(is_texture_state(ResourceState::TRANSFER_SOURCE));
        assert!(is_buffer_state(ResourceState::TRANSFER_SOURCE));
    }

    #[test]
    fn render_target_transition_is_color_attachment_optimal() {
        let (access, layout) = image_barrier_state(ResourceState::RENDER_TARGET);
        assert_eq!(layout, Layout::ColorAttachmentOptimal);
        assert!(access.contains(ImageAccess::COLOR_ATTACHMENT_WRITE));
    }

    #[test]
    fn undefined_has_no_access_and_no_layout_guarantee() {
        let (access, layout) = image_barrier_state(ResourceState::UNDEFINED);
        assert_eq!(access, ImageAccess::empty());
        assert_eq!(layout, Layout::Undefined);
    }

    #[test]
    #[should_panic]
    fn combined_state_is_rejected_by_image_barrier_state() {
        let _ = image_barrier_state(ResourceState::VERTEX | ResourceState::INDEX);
    }

    #[test]
    fn read_only_buffer_states_exclude_transfer_destination() {
        assert!(is_read_only_buffer_state(ResourceState::VERTEX));
        assert!(is_read_only_buffer_state(ResourceState::INDEX));
        assert!(is_read_only_buffer_state(ResourceState::UNIFORM));
        assert!(is_read_only_buffer_state(ResourceState::TRANSFER_SOURCE));
        assert!(!is_read_only_buffer_state(ResourceState::TRANSFER_DESTINATION));
    }
}
