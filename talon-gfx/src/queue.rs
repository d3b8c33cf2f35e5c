//! Queue families and queues: negotiating which queue family to use for a given purpose, and
//! sharing/allocating the resulting queues between callers.
//!
//! [`QueueNegotiator`] is created by [`crate::device::GraphicsDevice`] during construction and
//! handed to callers that need a queue for something other than drawing (e.g. an upload queue
//! used while building a [`crate::resource::Texture`]). The draw queue itself is negotiated the
//! same way, using the built-in [`DrawQueueSelector`].
//!
//! ```ignore
//! fn find_aux_queues<'c>(
//!     adapter: &'c Adapter,
//!     queue_negotiator: &mut QueueNegotiator,
//! ) -> Result<()> {
//!     queue_negotiator.find(adapter, &UploadQueueSelector)
//! }
//! ```

use crate::{
    command::CommandBuffer,
    error::{EnvironmentError, Error, LockPoisoned, Result, UsageError},
    fence::SharedTimelineFence,
    types::*,
};

use hal::{pso::PipelineStage, queue::{family::QueueFamilyId, CommandQueue as _}};
use std::{
    any::TypeId,
    collections::HashMap,
    sync::{Arc, RwLock},
};

/// A queue, possibly shared between callers that were given the same queue family. Wrapped in
/// [`DeviceQueue`] rather than the bare native type so every caller shares the same pending
/// wait/signal bookkeeping.
pub type SharedQueue = Arc<RwLock<DeviceQueue>>;

/// A thin wrapper over a native `hal` submission queue that accumulates pending wait/signal
/// semaphores across calls, attaching all of them to the next [`DeviceQueue::submit`].
///
/// This is how cross-queue ordering is expressed: a caller that needs this queue's next
/// submission to wait on (or signal) some other queue's [`crate::fence::TimelineFence`] calls
/// [`Self::append_wait_fence`]/[`Self::append_signal_fence`] any number of times before the draw
/// that eventually flushes; all of them are attached atomically at `submit` and the pending lists
/// are cleared, so a fence appended once is waited/signalled exactly once.
pub struct DeviceQueue {
    raw: QueueT,
    pending_waits: Vec<(SharedTimelineFence, PipelineStage)>,
    pending_signals: Vec<SharedTimelineFence>,
}

impl DeviceQueue {
    pub fn new(raw: QueueT) -> Self {
        DeviceQueue {
            raw,
            pending_waits: Vec::new(),
            pending_signals: Vec::new(),
        }
    }

    pub fn raw(&self) -> &QueueT {
        &self.raw
    }

    pub fn raw_mut(&mut self) -> &mut QueueT {
        &mut self.raw
    }

    /// Queue this submission to wait on `fence`'s semaphore at `stage`, before the command buffer
    /// begins executing work that depends on it. Cleared after the next [`Self::submit`].
    pub fn append_wait_fence(&mut self, fence: SharedTimelineFence, stage: PipelineStage) {
        self.pending_waits.push((fence, stage));
    }

    /// Queue this submission to signal `fence`'s semaphore once the command buffer completes, so
    /// another queue can wait on it without a CPU round-trip. Cleared after the next
    /// [`Self::submit`].
    pub fn append_signal_fence(&mut self, fence: SharedTimelineFence) {
        self.pending_signals.push(fence);
    }

    /// Submit `cmd` to this queue, attaching every pending wait/signal accumulated since the last
    /// `submit`, plus `completion_fence`'s own binary fence (bumped to `expected_value`) as the
    /// submission's CPU-observable completion marker. Draining the pending lists happens whether
    /// or not this call succeeds, matching the spec's "wait and signal arrays are drained
    /// atomically at submit" invariant — a failed submission should not leave stale waits queued
    /// for the next one.
    pub fn submit(
        &mut self,
        device: &DeviceT,
        cmd: &CommandBuffer,
        completion_fence: &mut crate::fence::TimelineFence,
        expected_value: u64,
    ) -> Result<()> {
        let waits = std::mem::take(&mut self.pending_waits);
        let signals = std::mem::take(&mut self.pending_signals);

        // Hold each fence's read guard only long enough to borrow its semaphore for the call
        // below; the guards themselves never escape this function.
        let wait_guards: Vec<_> = waits
            .iter()
            .map(|(f, _)| f.read().map_err(|_| Error::from(LockPoisoned::Fence)))
            .collect::<Result<Vec<_>>>()?;
        let signal_guards: Vec<_> = signals
            .iter()
            .map(|f| f.read().map_err(|_| Error::from(LockPoisoned::Fence)))
            .collect::<Result<Vec<_>>>()?;

        let wait_iter = wait_guards
            .iter()
            .zip(waits.iter())
            .map(|(guard, (_, stage))| (guard.semaphore(), *stage));
        let signal_iter = signal_guards.iter().map(|guard| guard.semaphore());

        let raw_fence = completion_fence.begin_signal(device, expected_value)?;

        unsafe {
            self.raw.submit(
                std::iter::once(cmd.raw()),
                wait_iter,
                signal_iter,
                Some(raw_fence),
            );
        }

        Ok(())
    }

    /// Block until every submission made to this queue has completed.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.raw.wait_idle() }.map_err(Error::from)
    }

    /// Present `image` (previously returned by [`hal::window::PresentationSurface::acquire_image`])
    /// to `surface`. Returns `true` if the backend reports the surface as suboptimal and should be
    /// reconfigured before the next frame.
    ///
    /// No explicit wait semaphore is passed: `hal` 0.8 folds the acquire-side synchronisation into
    /// the image handle itself, relying on it being submitted against exactly once between
    /// `acquire_image` calls — see `crate::target` and `DESIGN.md`.
    pub fn present(&mut self, surface: &mut SurfaceT, image: SwapchainImageT) -> Result<bool> {
        match unsafe { self.raw.present(surface, image, None) } {
            Ok(suboptimal) => Ok(suboptimal.is_some()),
            Err(e) => Err(Error::external(anyhow::anyhow!("present failed: {:?}", e))),
        }
    }
}

/// A queue family as exposed to callers: its `hal` id, plus whether it's the one carrying the
/// draw queue (relevant for deciding whether resources need an ownership-transfer barrier when
/// moving between families).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceQueueFamily {
    pub id: QueueFamilyId,
    pub is_draw_family: bool,
}

/// Used to find appropriate queue families, and to hand out (possibly shared) queues from them.
pub struct QueueNegotiator {
    family_ids: HashMap<TypeId, QueueFamilyId>,
    already_allocated: HashMap<TypeId, (Vec<SharedQueue>, usize)>,
    all: Vec<QueueGroup>,
    draw_family: Option<QueueFamilyId>,
}

/// Used to select an appropriate queue family for some purpose (drawing, uploading, ...).
pub trait QueueFamilySelector: 'static {
    /// Return true if the given family is suitable for this purpose.
    fn is_suitable(&self, family: &QueueFamilyT) -> bool;
}

impl QueueNegotiator {
    pub(crate) fn new() -> Self {
        QueueNegotiator {
            family_ids: HashMap::new(),
            already_allocated: HashMap::new(),
            all: vec![],
            draw_family: None,
        }
    }

    /// Attempt to find an appropriate queue family using the given selector. Returns early if the
    /// *type* of the selector has already been allocated a family.
    pub fn find<T: QueueFamilySelector>(&mut self, adapter: &Adapter, filter: &T) -> Result<()> {
        if self.family_ids.contains_key(&TypeId::of::<T>()) {
            return Ok(());
        }

        let candidates: Vec<&QueueFamilyT> = adapter
            .queue_families
            .iter()
            .filter(|x| filter.is_suitable(*x))
            .collect();

        if candidates.is_empty() {
            return Err(Error::from(EnvironmentError::NoSuitableFamilies));
        }

        // Prefer families not already claimed by another selector, so aux work doesn't contend
        // with the draw queue's family when a distinct one is available.
        let family = match candidates
            .iter()
            .find(|x| !self.family_ids.values().any(|y| *y == x.id()))
        {
            Some(x) => *x,
            None => candidates[0],
        };

        self.family_ids.insert(TypeId::of::<T>(), family.id());

        Ok(())
    }

    /// Get a (possibly shared) queue. Prefer calling this once and storing the result.
    ///
    /// Round-robin allocation is used to try to fairly distribute work between each queue. The
    /// family of the queue returned is guaranteed to meet the spec of the `QueueFamilySelector`
    /// originally used by [`Self::find`].
    pub fn get_queue<T: QueueFamilySelector>(&mut self) -> Result<SharedQueue> {
        let tid = TypeId::of::<T>();
        let family_id = *self
            .family_ids
            .get(&tid)
            .ok_or(UsageError::QueueNegotiatorMisuse)?;

        match self
            .all
            .iter()
            .position(|x| !x.queues.is_empty() && x.family == family_id)
        {
            Some(idx) => {
                let queue = self.all[idx].queues.pop().unwrap();
                let queue = Arc::new(RwLock::new(DeviceQueue::new(queue)));

                self.add_to_allocated::<T>(queue.clone());

                Ok(queue)
            }
            None => match self.already_allocated.get_mut(&tid) {
                Some((queues, next_share)) => {
                    let queue = queues[*next_share].clone();
                    *next_share = (*next_share + 1) % queues.len();
                    Ok(queue)
                }
                None => Err(Error::from(EnvironmentError::NoQueues)),
            },
        }
    }

    /// Convenience function returning a queue family plus priorities vec, suitable for passing to
    /// `hal::adapter::PhysicalDevice::open`. `count` is the maximum number of individual queues to
    /// request; fewer may be granted, in which case they will be shared.
    pub fn family_spec<'a, T: QueueFamilySelector>(
        &self,
        queue_families: &'a [QueueFamilyT],
        count: usize,
    ) -> Result<(&'a QueueFamilyT, Vec<f32>)> {
        let qf_id = self.family::<T>().ok_or(UsageError::QueueNegotiatorMisuse)?;

        let qf = queue_families
            .iter()
            .find(|x| x.id() == qf_id)
            .ok_or(EnvironmentError::NoSuitableFamilies)?;

        Ok((qf, vec![1.0; count]))
    }

    /// Get the queue family ID being used by the given selector.
    pub fn family<T: QueueFamilySelector>(&self) -> Option<QueueFamilyId> {
        self.family_ids.get(&TypeId::of::<T>()).copied()
    }

    /// Describe the family selected by `T`, including whether it doubles as the draw family.
    pub fn device_family<T: QueueFamilySelector>(&self) -> Option<DeviceQueueFamily> {
        self.family::<T>().map(|id| DeviceQueueFamily {
            id,
            is_draw_family: self.draw_family == Some(id),
        })
    }

    pub(crate) fn set_draw_family(&mut self, id: QueueFamilyId) {
        self.draw_family = Some(id);
    }

    pub(crate) fn set_queue_groups(&mut self, queue_groups: Vec<QueueGroup>) {
        self.all = queue_groups
    }

    fn add_to_allocated<T: QueueFamilySelector>(&mut self, queue: SharedQueue) {
        let tid = TypeId::of::<T>();
        match self.already_allocated.get_mut(&tid) {
            None => {
                self.already_allocated.insert(tid, (vec![queue], 0));
            }
            Some(x) => x.0.push(queue),
        }
    }
}

/// Selects a queue family suitable for drawing to a given surface.
///
/// Precomputes the set of suitable family ids from a borrowed surface at construction time rather
/// than holding the surface itself: [`QueueFamilySelector`] requires `'static` (its `TypeId` is
/// used as a negotiator map key), and the surface needs to outlive selection to be handed to
/// [`crate::target::SwapChain::new`] afterwards, so [`GraphicsDevice`](crate::device::GraphicsDevice)
/// keeps ownership of it throughout.
pub struct DrawQueueSelector {
    supported_family_ids: Vec<QueueFamilyId>,
}

impl DrawQueueSelector {
    pub fn new(surface: &SurfaceT, adapter: &Adapter) -> Self {
        let supported_family_ids = adapter
            .queue_families
            .iter()
            .filter(|f| surface.supports_queue_family(f) && f.queue_type().supports_graphics())
            .map(|f| f.id())
            .collect();
        DrawQueueSelector { supported_family_ids }
    }
}

impl QueueFamilySelector for DrawQueueSelector {
    fn is_suitable(&self, family: &QueueFamilyT) -> bool {
        self.supported_family_ids.contains(&family.id())
    }
}

/// Selects a queue family suitable for transfer/upload work: any family that supports transfer,
/// preferring one that supports *only* transfer (a dedicated DMA engine on hardware that has one).
pub struct TransferQueueSelector;

impl QueueFamilySelector for TransferQueueSelector {
    fn is_suitable(&self, family: &QueueFamilyT) -> bool {
        family.queue_type().supports_transfer()
    }
}
