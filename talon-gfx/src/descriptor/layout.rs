//! The binding-slot layout a [`super::heap::ResourceHeap`] is built against.

use std::mem::ManuallyDrop;

use hal::{device::Device as _, pso::{DescriptorSetLayoutBinding as HalBinding, DescriptorType, ShaderStageFlags}};
use rendy_descriptor::{DescriptorRanges, DescriptorSetLayoutBinding as RendyBinding};

use crate::{error::Result, types::*};

/// One binding slot: a type of resource, how many array elements it holds, and which shader
/// stages can see it. Matches the native `DescriptorSetLayoutBinding` shape, kept separate so a
/// [`ResourceHeapLayout`] can build both the `hal` layout object and the `rendy_descriptor` range
/// set the allocator needs from the same source list.
#[derive(Debug, Clone, Copy)]
pub struct ResourceBindingLayout {
    pub binding: u32,
    pub ty: DescriptorType,
    pub count: usize,
    pub stage_flags: ShaderStageFlags,
}

impl ResourceBindingLayout {
    fn as_hal(&self) -> HalBinding {
        HalBinding {
            binding: self.binding,
            ty: self.ty,
            count: self.count,
            stage_flags: self.stage_flags,
            immutable_samplers: false,
        }
    }

    fn as_rendy(&self) -> RendyBinding {
        RendyBinding {
            binding: self.binding,
            ty: self.ty,
            count: self.count,
            stage_flags: self.stage_flags,
            immutable_samplers: false,
        }
    }
}

/// The default number of descriptor sets a [`super::pool::DescriptorPool`] carves out of its
/// first underlying native pool.
pub const DEFAULT_INITIAL_SIZE: usize = 4;

/// The default geometric growth factor between successive underlying pools.
pub const DEFAULT_GROWTH_FACTOR: usize = 2;

/// Describes the binding slots of a resource heap: a native descriptor-set-layout handle plus the
/// pool-growth configuration every heap built from it should use.
pub struct ResourceHeapLayout {
    raw: ManuallyDrop<DescriptorSetLayoutT>,
    bindings: Vec<ResourceBindingLayout>,
    ranges: DescriptorRanges,
    initial_size: usize,
    growth_factor: usize,
}

impl ResourceHeapLayout {
    pub fn new(device: &DeviceT, bindings: Vec<ResourceBindingLayout>) -> Result<Self> {
        Self::with_pool_sizing(device, bindings, DEFAULT_INITIAL_SIZE, DEFAULT_GROWTH_FACTOR)
    }

    pub fn with_pool_sizing(
        device: &DeviceT,
        bindings: Vec<ResourceBindingLayout>,
        initial_size: usize,
        growth_factor: usize,
    ) -> Result<Self> {
        let hal_bindings: Vec<HalBinding> = bindings.iter().map(ResourceBindingLayout::as_hal).collect();
        let rendy_bindings: Vec<RendyBinding> =
            bindings.iter().map(ResourceBindingLayout::as_rendy).collect();

        let raw = unsafe {
            device.create_descriptor_set_layout(hal_bindings.into_iter(), std::iter::empty())
        }?;

        Ok(ResourceHeapLayout {
            raw: ManuallyDrop::new(raw),
            bindings,
            ranges: DescriptorRanges::from_bindings(&rendy_bindings),
            initial_size,
            growth_factor,
        })
    }

    pub fn raw(&self) -> &DescriptorSetLayoutT {
        &self.raw
    }

    pub fn bindings(&self) -> &[ResourceBindingLayout] {
        &self.bindings
    }

    pub(crate) fn ranges(&self) -> DescriptorRanges {
        self.ranges
    }

    pub fn initial_size(&self) -> usize {
        self.initial_size
    }

    pub fn growth_factor(&self) -> usize {
        self.growth_factor
    }

    pub fn deactivate(mut self, device: &DeviceT) {
        unsafe { device.destroy_descriptor_set_layout(ManuallyDrop::take(&mut self.raw)) };
    }
}
