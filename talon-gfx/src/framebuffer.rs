//! Framebuffers and the cache that avoids rebuilding one every time the same render pass is
//! committed against the same set of image views.

use std::{collections::HashMap, sync::Arc};

use hal::{device::Device as _, image::Extent};
use log::debug;

use crate::{error::Result, types::*};

/// Identifies a framebuffer by the identity of the render pass it was built against, the identity
/// of each attachment's image view, and the extent. Image views don't implement `Hash`/`Eq`
/// themselves, so views are identified by the numeric id assigned at creation time (see
/// [`crate::resource::texture::TextureView::id`]), and the render pass by the pointer of the `Arc`
/// it's stored behind — stable for as long as that `Arc` is alive, which a framebuffer built from
/// it always ensures by holding a clone of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FramebufferCacheKey {
    pub render_pass: usize,
    pub view_ids: Vec<u64>,
    pub extent: (u32, u32, u16),
}

impl FramebufferCacheKey {
    pub fn new(render_pass: &Arc<RenderPassT>, view_ids: Vec<u64>, extent: Extent) -> Self {
        FramebufferCacheKey {
            render_pass: Arc::as_ptr(render_pass) as usize,
            view_ids,
            extent: (extent.width, extent.height, extent.depth as u16),
        }
    }
}

struct Entry {
    framebuffer: Arc<FramebufferT>,
    // Kept alive so `render_pass` above stays a valid identity for the lifetime of this entry.
    _render_pass: Arc<RenderPassT>,
}

/// Caches framebuffers by [`FramebufferCacheKey`]. Owned by a [`crate::context::DeviceContext`].
pub struct FramebufferCache {
    entries: HashMap<FramebufferCacheKey, Entry>,
}

impl FramebufferCache {
    pub fn new() -> Self {
        FramebufferCache {
            entries: HashMap::new(),
        }
    }

    /// Returns an owned `Arc`, not a borrow: [`crate::command::CommandBuffer::begin_render_pass`]
    /// retains its own strong reference for the duration of the pass, the same way it does for the
    /// render pass itself, rather than tying the pass to this cache's borrow lifetime.
    #[allow(clippy::too_many_arguments)]
    pub fn get_or_create(
        &mut self,
        device: &mut DeviceT,
        key: FramebufferCacheKey,
        render_pass: Arc<RenderPassT>,
        attachments: impl Iterator<Item = hal::image::FramebufferAttachment>,
        extent: Extent,
    ) -> Result<Arc<FramebufferT>> {
        if !self.entries.contains_key(&key) {
            debug!("framebuffer cache miss for {:?}, building new framebuffer", key);
            let framebuffer = unsafe { device.create_framebuffer(&render_pass, attachments, extent)? };
            self.entries.insert(
                key.clone(),
                Entry {
                    framebuffer: Arc::new(framebuffer),
                    _render_pass: render_pass,
                },
            );
        }

        Ok(self.entries.get(&key).unwrap().framebuffer.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every cached framebuffer whose key references `view_id`. Called when a texture view is
    /// destroyed, so stale framebuffers referencing a now-dead view are never handed back out.
    pub fn evict_views(&mut self, device: &DeviceT, view_id: u64) {
        let stale: Vec<FramebufferCacheKey> = self
            .entries
            .keys()
            .filter(|k| k.view_ids.contains(&view_id))
            .cloned()
            .collect();

        for key in stale {
            if let Some(entry) = self.entries.remove(&key) {
                match Arc::try_unwrap(entry.framebuffer) {
                    Ok(fb) => unsafe { device.destroy_framebuffer(fb) },
                    Err(_) => {
                        log::warn!(
                            "framebuffer for {:?} still has outstanding references on view eviction; leaking it",
                            key
                        );
                    }
                }
            }
        }
    }

    pub fn deactivate(self, device: &DeviceT) {
        for (key, entry) in self.entries {
            match Arc::try_unwrap(entry.framebuffer) {
                Ok(fb) => unsafe { device.destroy_framebuffer(fb) },
                Err(_) => {
                    log::warn!(
                        "framebuffer for {:?} still has outstanding references at shutdown; leaking it",
                        key
                    );
                }
            }
        }
    }
}

impl Default for FramebufferCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_differing_only_in_extent_are_distinct() {
        let rp = Arc::new(());
        let a = FramebufferCacheKey {
            render_pass: Arc::as_ptr(&rp) as usize,
            view_ids: vec![1, 2],
            extent: (1920, 1080, 1),
        };
        let b = FramebufferCacheKey {
            render_pass: Arc::as_ptr(&rp) as usize,
            view_ids: vec![1, 2],
            extent: (1280, 720, 1),
        };
        assert_ne!(a, b);
    }

    #[test]
    fn keys_with_same_views_in_different_order_are_distinct() {
        let rp = Arc::new(());
        let a = FramebufferCacheKey {
            render_pass: Arc::as_ptr(&rp) as usize,
            view_ids: vec![1, 2],
            extent: (1920, 1080, 1),
        };
        let b = FramebufferCacheKey {
            render_pass: Arc::as_ptr(&rp) as usize,
            view_ids: vec![2, 1],
            extent: (1920, 1080, 1),
        };
        assert_ne!(a, b, "attachment order is part of framebuffer identity");
    }
}
