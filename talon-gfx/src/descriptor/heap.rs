//! A [`ResourceHeap`] is a mutable binding map — which buffer, sampler, and texture view sits at
//! each `(binding, array-index)` slot — that lazily writes itself into a recycled native
//! descriptor set only when something has actually changed.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use hal::{
    device::Device as _,
    format::Aspects,
    image::{Layout, SubresourceRange},
    pso::{Descriptor, DescriptorSetWrite},
};

use crate::{
    command::CommandBuffer,
    error::{LockPoisoned, Result},
    fence::SharedTimelineFence,
    resource::{buffer::BufferHandle, sampler::Sampler, texture::TextureHandle, texture::TextureView},
    state::{self, ResourceState},
    types::*,
};

use super::{layout::ResourceHeapLayout, pool::DescriptorPool};

/// Whether [`ResourceHeap::prepare_binding`] should transition bound resources into the state
/// they need to be read from by a shader, or leave them as-is because the caller already arranged
/// that itself (e.g. a buffer that's also bound as a vertex buffer and never stops being one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPolicy {
    /// Transition every bound buffer to `UNIFORM` and every bound texture to `SHADER_READ_ONLY`
    /// if it isn't already.
    Automatic,
    /// Leave every bound resource's state untouched.
    Manual,
}

/// A bound buffer range, referencing the same [`BufferHandle`] the caller created and still owns.
pub struct BufferBinding {
    handle: Arc<RwLock<BufferHandle>>,
    pub offset: u64,
    pub size: u64,
}

impl Clone for BufferBinding {
    fn clone(&self) -> Self {
        BufferBinding {
            handle: self.handle.clone(),
            offset: self.offset,
            size: self.size,
        }
    }
}

impl BufferBinding {
    pub fn new(handle: Arc<RwLock<BufferHandle>>, offset: u64, size: u64) -> Self {
        BufferBinding { handle, offset, size }
    }
}

/// A bound sampler + texture view pair. `texture` is the view's parent, carried alongside it so
/// [`ResourceHeap::prepare_binding`] can transition the texture's state; a [`TextureView`] alone
/// doesn't know what texture it was made from.
#[derive(Clone)]
pub struct SamplerBinding {
    pub sampler: Arc<Sampler>,
    pub view: Arc<TextureView>,
    pub texture: Arc<RwLock<TextureHandle>>,
}

/// The whole resource (every mip, every layer) of a color texture bound for sampling.
const SAMPLED_RESOURCES: SubresourceRange = SubresourceRange {
    aspects: Aspects::COLOR,
    level_start: 0,
    level_count: None,
    layer_start: 0,
    layer_count: None,
};

#[derive(Clone)]
enum Binding {
    Buffer(BufferBinding),
    Sampler(SamplerBinding),
}

/// User-supplied buffer/sampler/texture-view bindings, lazily written into a recycled descriptor
/// set. Binding slots are `(binding index, array index)` pairs, matching the addressing scheme
/// shader code uses to reach them.
pub struct ResourceHeap {
    layout: Arc<ResourceHeapLayout>,
    pool: DescriptorPool,
    bindings: HashMap<(u32, u32), Binding>,
    current_group: Option<super::pool::DescriptorSetGroup>,
}

impl ResourceHeap {
    pub fn new(layout: Arc<ResourceHeapLayout>) -> Self {
        let pool = DescriptorPool::new(layout.initial_size(), layout.growth_factor());
        ResourceHeap {
            layout,
            pool,
            bindings: HashMap::new(),
            current_group: None,
        }
    }

    pub fn layout(&self) -> &Arc<ResourceHeapLayout> {
        &self.layout
    }

    /// Stage a copy of the binding map, apply the new buffer bindings, and swap it in only once
    /// every entry has been built successfully — giving this call strong exception safety even
    /// though buffer bindings can't currently fail to construct.
    pub fn bind_buffers(&mut self, binding_index: u32, buffers: &[BufferBinding], array_start: u32) {
        let mut staged = self.bindings.clone();
        for (i, binding) in buffers.iter().enumerate() {
            staged.insert(
                (binding_index, array_start + i as u32),
                Binding::Buffer(binding.clone()),
            );
        }
        self.bindings = staged;
        self.mark_dirty();
    }

    pub fn bind_samplers(&mut self, binding_index: u32, samplers: &[SamplerBinding], array_start: u32) {
        let mut staged = self.bindings.clone();
        for (i, binding) in samplers.iter().enumerate() {
            staged.insert(
                (binding_index, array_start + i as u32),
                Binding::Sampler(binding.clone()),
            );
        }
        self.bindings = staged;
        self.mark_dirty();
    }

    fn mark_dirty(&mut self) {
        if let Some(group) = self.current_group.as_mut() {
            group.mark_not_up_to_date();
        }
        self.pool.mark_all_not_up_to_date();
    }

    /// Select a descriptor-set group (reusing the current one if its last use is complete,
    /// otherwise parking it and drawing a fresh one from the pool), add strong references to every
    /// bound resource, issue a descriptor write if the group's contents are stale, and record the
    /// command buffer's completion fence as this group's next last-use marker.
    pub fn prepare_binding(
        &mut self,
        device: &mut DeviceT,
        cmd: &mut CommandBuffer,
        completion_fence: SharedTimelineFence,
        expected_value: u64,
        transition_policy: TransitionPolicy,
    ) -> Result<&DescriptorSetT> {
        let needs_new_group = match &self.current_group {
            Some(group) => !group.is_available(device)?,
            None => true,
        };

        if needs_new_group {
            if let Some(old) = self.current_group.take() {
                self.pool.return_group(old);
            }
            let fresh = self.pool.get_group(device, &self.layout)?;
            self.current_group = Some(fresh);
        }

        for binding in self.bindings.values() {
            match binding {
                Binding::Buffer(b) => {
                    cmd.retain(b.handle.clone());
                }
                Binding::Sampler(s) => {
                    cmd.retain(s.sampler.clone());
                    cmd.retain(s.view.clone());
                    cmd.retain(s.texture.clone());
                }
            }
        }

        if transition_policy == TransitionPolicy::Automatic {
            self.transition_bindings(cmd)?;
        }

        let group = self.current_group.as_mut().expect("just ensured present");
        if !group.is_up_to_date() {
            for ((binding, array_offset), bound) in self.bindings.iter() {
                match bound {
                    Binding::Buffer(b) => {
                        let guard = b.handle.read().map_err(|_| LockPoisoned::MemoryPool)?;
                        device.write_descriptor_set(DescriptorSetWrite {
                            set: group.raw_mut(),
                            binding: *binding,
                            array_offset: *array_offset as usize,
                            descriptors: std::iter::once(Descriptor::Buffer(
                                guard.raw(),
                                hal::buffer::SubRange {
                                    offset: b.offset,
                                    size: Some(b.size),
                                },
                            )),
                        });
                    }
                    Binding::Sampler(s) => {
                        // One combined-image-sampler descriptor per logical slot, matching
                        // `DescriptorType::CombinedImageSampler` in the layout this heap was built
                        // against.
                        device.write_descriptor_set(DescriptorSetWrite {
                            set: group.raw_mut(),
                            binding: *binding,
                            array_offset: *array_offset as usize,
                            descriptors: std::iter::once(Descriptor::CombinedImageSampler(
                                s.view.raw(),
                                Layout::ShaderReadOnlyOptimal,
                                s.sampler.raw(),
                            )),
                        });
                    }
                }
            }
            group.mark_up_to_date();
        }

        group.record_use(completion_fence, expected_value);

        Ok(group.raw())
    }

    /// Transition every bound buffer to `UNIFORM` and every bound texture to `SHADER_READ_ONLY`
    /// that isn't already, recording one barrier per resource that actually needs to move. Per
    /// spec this only ever widens a resource's usage going into a draw; it never transitions a
    /// resource the caller still needs in some other state for the same draw (e.g. a buffer also
    /// bound as a vertex buffer), which is why this is opt-in via `TransitionPolicy`.
    fn transition_bindings(&mut self, cmd: &mut CommandBuffer) -> Result<()> {
        for binding in self.bindings.values() {
            match binding {
                Binding::Buffer(b) => {
                    let mut guard = b.handle.write().map_err(|_| LockPoisoned::MemoryPool)?;
                    let from = guard.state();
                    if from != ResourceState::UNIFORM {
                        state::record_buffer_barrier(
                            cmd.raw_mut(),
                            guard.raw(),
                            from,
                            ResourceState::UNIFORM,
                        );
                        guard.set_state(ResourceState::UNIFORM);
                    }
                }
                Binding::Sampler(s) => {
                    let mut guard = s.texture.write().map_err(|_| LockPoisoned::MemoryPool)?;
                    let from = guard.state();
                    if from != ResourceState::SHADER_READ_ONLY {
                        state::record_image_barrier(
                            cmd.raw_mut(),
                            guard.raw(),
                            from,
                            ResourceState::SHADER_READ_ONLY,
                            SAMPLED_RESOURCES,
                        );
                        guard.set_state(ResourceState::SHADER_READ_ONLY);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn deactivate(mut self, device: &DeviceT) {
        if let Some(group) = self.current_group.take() {
            self.pool.return_group(group);
        }
        self.pool.deactivate(device);
    }
}
