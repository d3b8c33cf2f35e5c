//! Recycles native descriptor sets across frames, parking vended sets until the fence that last
//! used them is satisfied.
//!
//! Allocation itself is delegated to `rendy_descriptor::DescriptorAllocator`, which already knows
//! how to grow its backing native pools; what it doesn't track is *which set was last used by
//! which submission*, so [`DescriptorPool`] layers that bookkeeping — and the geometric
//! "how many sets to carve out of the next native pool" policy — on top.

use std::mem::ManuallyDrop;

use crate::{
    error::{LockPoisoned, Result},
    fence::SharedTimelineFence,
    types::*,
};

use super::layout::ResourceHeapLayout;

/// One descriptor set plus the fence value that must be reached before it may be reused, and
/// whether its current contents still match the heap's bindings.
pub struct DescriptorSetGroup {
    set: ManuallyDrop<RDescriptorSet>,
    last_use: Option<(SharedTimelineFence, u64)>,
    up_to_date: bool,
}

impl DescriptorSetGroup {
    fn fresh(set: RDescriptorSet) -> Self {
        DescriptorSetGroup {
            set: ManuallyDrop::new(set),
            last_use: None,
            up_to_date: false,
        }
    }

    pub fn raw(&self) -> &DescriptorSetT {
        self.set.raw()
    }

    pub fn raw_mut(&mut self) -> &mut RDescriptorSet {
        &mut self.set
    }

    pub fn is_up_to_date(&self) -> bool {
        self.up_to_date
    }

    pub fn mark_up_to_date(&mut self) {
        self.up_to_date = true;
    }

    pub fn mark_not_up_to_date(&mut self) {
        self.up_to_date = false;
    }

    /// Record that this group will not be reusable until `fence` reaches `expected_value`.
    pub fn record_use(&mut self, fence: SharedTimelineFence, expected_value: u64) {
        self.last_use = Some((fence, expected_value));
    }

    /// Whether the last submission that used this group has completed (or it was never used).
    pub fn is_available(&self, device: &DeviceT) -> Result<bool> {
        match &self.last_use {
            None => Ok(true),
            Some((fence, expected)) => {
                let fence = fence.read().map_err(|_| LockPoisoned::Fence)?;
                Ok(fence.poll(device)? >= *expected)
            }
        }
    }

    fn into_raw(mut self) -> RDescriptorSet {
        unsafe { ManuallyDrop::take(&mut self.set) }
    }
}

/// Geometrically-growing pool of native descriptor pools, vending [`DescriptorSetGroup`]s and
/// parking them until their last-use fence is satisfied.
pub struct DescriptorPool {
    allocator: ManuallyDrop<DescriptorAllocator>,
    parked: Vec<DescriptorSetGroup>,
    initial_size: usize,
    growth_factor: usize,
    pools_allocated: u32,
}

impl DescriptorPool {
    pub fn new(initial_size: usize, growth_factor: usize) -> Self {
        DescriptorPool {
            allocator: ManuallyDrop::new(DescriptorAllocator::new()),
            parked: Vec::new(),
            initial_size,
            growth_factor,
            pools_allocated: 0,
        }
    }

    /// How many sets the next underlying native pool will be sized to hold.
    /// Pure arithmetic: `initial_size * growth_factor ^ pools_allocated`.
    pub fn next_pool_size(&self) -> usize {
        self.initial_size * self.growth_factor.pow(self.pools_allocated)
    }

    /// Pick the first parked group whose last use has completed, or grow and carve a fresh batch.
    pub fn get_group(&mut self, device: &DeviceT, layout: &ResourceHeapLayout) -> Result<DescriptorSetGroup> {
        if let Some(idx) = self
            .parked
            .iter()
            .position(|g| g.is_available(device).unwrap_or(false))
        {
            return Ok(self.parked.remove(idx));
        }

        let batch_size = self.next_pool_size();
        let mut allocated: Vec<RDescriptorSet> = Vec::with_capacity(batch_size);
        unsafe {
            self.allocator
                .allocate(device, layout.raw(), layout.ranges(), batch_size as u32, &mut allocated)
        }
        .map_err(|e| crate::error::Error::out_of_memory(format!("descriptor pool exhausted: {:?}", e)))?;
        self.pools_allocated += 1;

        let mut allocated: Vec<DescriptorSetGroup> =
            allocated.into_iter().map(DescriptorSetGroup::fresh).collect();
        let vended = allocated.pop().ok_or_else(|| {
            crate::error::Error::out_of_memory("descriptor allocator returned an empty batch")
        })?;
        self.parked.extend(allocated);

        Ok(vended)
    }

    pub fn return_group(&mut self, group: DescriptorSetGroup) {
        self.parked.push(group);
    }

    /// Invalidate every parked group's cached writes; called whenever a heap's bindings mutate,
    /// since any group that gets reused later must rewrite its descriptors.
    pub fn mark_all_not_up_to_date(&mut self) {
        for group in &mut self.parked {
            group.mark_not_up_to_date();
        }
    }

    pub fn deactivate(mut self, device: &DeviceT) {
        unsafe {
            for group in self.parked.drain(..) {
                self.allocator.free(std::iter::once(group.into_raw()));
            }
            ManuallyDrop::take(&mut self.allocator).dispose(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometric_growth_matches_default_policy() {
        let mut pool = DescriptorPool::new(4, 2);
        assert_eq!(pool.next_pool_size(), 4);
        pool.pools_allocated = 1;
        assert_eq!(pool.next_pool_size(), 8);
        pool.pools_allocated = 2;
        assert_eq!(pool.next_pool_size(), 16);
        pool.pools_allocated = 3;
        assert_eq!(pool.next_pool_size(), 32);
    }

    #[test]
    fn non_default_sizing_still_geometric() {
        let mut pool = DescriptorPool::new(3, 3);
        assert_eq!(pool.next_pool_size(), 3);
        pool.pools_allocated = 2;
        assert_eq!(pool.next_pool_size(), 27);
    }
}
