//! The windowing system is an external collaborator: this crate only ever sees a native window
//! handle (via [`raw_window_handle::HasRawWindowHandle`]) and a resize notification. There is no
//! dependency on any particular windowing crate (no `winit`); an application wires its own event
//! loop into [`WindowResizeSource::notify_resized`] and passes the handle itself to
//! [`crate::device::GraphicsDevice::new`]/[`crate::target::SwapChain::new`].
//!
//! Subscriptions replace the source corpus's implicit event wiring (a swap chain that reaches
//! directly into a concrete `winit::Window`) with an explicit registry: [`WindowResizeSource`]
//! hands back a [`ResizeSubscription`] token on registration, and dropping that token
//! unsubscribes. [`crate::target::SwapChain`] is the one subscriber this crate ships; it doesn't
//! act on a resize event directly (doing real work on whatever thread delivers the notification
//! would race with a `StartFrame` in progress on the render thread) — it just raises a flag that
//! `StartFrame` checks before acquiring the next image.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, Weak,
};

/// Notified when a window's client area changes size.
pub trait SurfaceResizeObserver: Send + Sync {
    /// `new_size` is the window's new client size in physical pixels.
    fn on_resize(&self, new_size: (u32, u32));
}

struct Entry {
    id: u64,
    observer: Weak<dyn SurfaceResizeObserver>,
}

/// Owned by whatever wires this crate to a real window; the application calls
/// [`Self::notify_resized`] from its own event loop (e.g. on `winit`'s `WindowEvent::Resized`).
#[derive(Default)]
pub struct WindowResizeSource {
    observers: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl WindowResizeSource {
    pub fn new() -> Self {
        WindowResizeSource {
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register `observer`. Returns a token that unsubscribes it when dropped; the registry itself
    /// only holds a weak reference, so letting `observer` itself drop also unsubscribes it.
    pub fn subscribe(self: &Arc<Self>, observer: Arc<dyn SurfaceResizeObserver>) -> ResizeSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut observers = self.observers.lock().expect("resize source lock poisoned");
        observers.push(Entry {
            id,
            observer: Arc::downgrade(&observer),
        });
        ResizeSubscription {
            source: Arc::downgrade(self),
            id,
        }
    }

    /// Call from the application's event loop whenever the window's client area changes size.
    pub fn notify_resized(&self, new_size: (u32, u32)) {
        let mut observers = self.observers.lock().expect("resize source lock poisoned");
        observers.retain(|entry| entry.observer.strong_count() > 0);
        for entry in observers.iter() {
            if let Some(observer) = entry.observer.upgrade() {
                observer.on_resize(new_size);
            }
        }
    }
}

/// Unsubscribes its observer from the [`WindowResizeSource`] it was registered with when dropped.
pub struct ResizeSubscription {
    source: Weak<WindowResizeSource>,
    id: u64,
}

impl Drop for ResizeSubscription {
    fn drop(&mut self) {
        if let Some(source) = self.source.upgrade() {
            if let Ok(mut observers) = source.observers.lock() {
                observers.retain(|entry| entry.id != self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct FlagObserver(Arc<AtomicBool>);
    impl SurfaceResizeObserver for FlagObserver {
        fn on_resize(&self, _new_size: (u32, u32)) {
            self.0.store(true, Ordering::Relaxed);
        }
    }

    #[test]
    fn subscriber_is_notified() {
        let source = Arc::new(WindowResizeSource::new());
        let flag = Arc::new(AtomicBool::new(false));
        let observer = Arc::new(FlagObserver(flag.clone()));
        let _sub = source.subscribe(observer);

        source.notify_resized((1280, 720));
        assert!(flag.load(Ordering::Relaxed));
    }

    #[test]
    fn dropping_subscription_stops_notifications() {
        let source = Arc::new(WindowResizeSource::new());
        let flag = Arc::new(AtomicBool::new(false));
        let observer = Arc::new(FlagObserver(flag.clone()));
        let sub = source.subscribe(observer);
        drop(sub);

        source.notify_resized((1280, 720));
        assert!(!flag.load(Ordering::Relaxed));
    }

    #[test]
    fn dropping_observer_stops_notifications_even_with_live_subscription() {
        let source = Arc::new(WindowResizeSource::new());
        let flag = Arc::new(AtomicBool::new(false));
        let observer = Arc::new(FlagObserver(flag.clone()));
        let _sub = source.subscribe(observer.clone());
        drop(observer);

        source.notify_resized((1280, 720));
        assert!(!flag.load(Ordering::Relaxed));
    }
}
