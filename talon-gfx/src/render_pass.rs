//! Render passes and the cache that keeps us from rebuilding one every time a render target
//! combination we've already seen is committed.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use hal::{device::Device as _, format::Format};
use log::debug;

use crate::{builders::renderpass::RenderpassSpec, error::Result, types::*};

/// Identifies a render pass purely by the attachment formats and layouts it was built for, not by
/// load/store operations or clear values.
///
/// This is a deliberate narrowing: two render passes that differ only in whether a color
/// attachment is cleared or preserved on load are interchangeable from the point of view of
/// everything downstream (pipelines, framebuffers) that only cares about attachment *compatibility*
/// per the Vulkan render-pass-compatibility rules, so keying on load/store ops as well would just
/// create cache misses for passes that are otherwise identical. See `DESIGN.md` for this as a
/// recorded Open Question resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderPassCacheKey {
    pub sample_count: u8,
    pub color_formats: Vec<Format>,
    pub depth_format: Option<Format>,
    pub input_formats: Vec<Format>,
}

/// Caches render passes by [`RenderPassCacheKey`]. Owned by a
/// [`crate::context::DeviceContext`]; render passes are destroyed when the cache itself is
/// deactivated, which must happen only after every framebuffer built from one of its entries has
/// already been destroyed.
pub struct RenderPassCache {
    entries: HashMap<RenderPassCacheKey, Arc<RenderPassT>>,
}

impl RenderPassCache {
    pub fn new() -> Self {
        RenderPassCache {
            entries: HashMap::new(),
        }
    }

    /// Look up `key`, building a new render pass from `spec` via `build` if this is the first
    /// time this combination of formats has been committed.
    pub fn get_or_create(
        &mut self,
        device: &mut DeviceT,
        key: RenderPassCacheKey,
        spec: RenderpassSpec,
    ) -> Result<Arc<RenderPassT>> {
        if let Some(existing) = self.entries.get(&key) {
            return Ok(existing.clone());
        }

        debug!("render pass cache miss for {:?}, building new pass", key);
        let pass = Arc::new(spec.build_renderpass(device)?);
        self.entries.insert(key, pass.clone());
        Ok(pass)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Destroy every cached render pass. The caller must ensure no framebuffer still references
    /// one of them.
    pub fn deactivate(self, device: &DeviceT) {
        for (key, pass) in self.entries {
            match Arc::try_unwrap(pass) {
                Ok(pass) => unsafe { device.destroy_render_pass(pass) },
                Err(_) => {
                    log::warn!(
                        "render pass for {:?} still has outstanding references at shutdown; leaking it",
                        key
                    );
                }
            }
        }
    }
}

impl Default for RenderPassCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared-ownership handle to a device lock, used by caches that need to build resources lazily
/// without holding the lock across their whole lifetime.
pub type SharedDevice = Arc<RwLock<DeviceT>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_with_same_formats_are_equal() {
        let a = RenderPassCacheKey {
            sample_count: 1,
            color_formats: vec![Format::Rgba8Srgb],
            depth_format: Some(Format::D32Sfloat),
            input_formats: vec![],
        };
        let b = RenderPassCacheKey {
            sample_count: 1,
            color_formats: vec![Format::Rgba8Srgb],
            depth_format: Some(Format::D32Sfloat),
            input_formats: vec![],
        };
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn keys_differing_only_in_depth_format_are_distinct() {
        let a = RenderPassCacheKey {
            sample_count: 1,
            color_formats: vec![Format::Rgba8Srgb],
            depth_format: Some(Format::D32Sfloat),
            input_formats: vec![],
        };
        let b = RenderPassCacheKey {
            sample_count: 1,
            color_formats: vec![Format::Rgba8Srgb],
            depth_format: None,
            input_formats: vec![],
        };
        assert_ne!(a, b);
    }

    #[test]
    fn keys_differing_only_in_sample_count_are_distinct() {
        let a = RenderPassCacheKey {
            sample_count: 1,
            color_formats: vec![Format::Rgba8Srgb],
            depth_format: None,
            input_formats: vec![],
        };
        let b = RenderPassCacheKey {
            sample_count: 4,
            color_formats: vec![Format::Rgba8Srgb],
            depth_format: None,
            input_formats: vec![],
        };
        assert_ne!(a, b);
    }
}
