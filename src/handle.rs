//! Owning wrapper around an opaque driver handle.
//!
//! A [`Handle`] pairs a raw value with the function that releases it. The
//! release runs exactly once: on drop, on [`Handle::reset`], or never if the
//! value is taken back out with [`Handle::into_raw`].

use std::fmt;

type Release<T> = Box<dyn FnOnce(T) + Send>;

pub struct Handle<T> {
    raw: Option<T>,
    release: Option<Release<T>>,
}

impl<T> Handle<T> {
    pub fn new(raw: T, release: impl FnOnce(T) + Send + 'static) -> Self {
        Self {
            raw: Some(raw),
            release: Some(Box::new(release)),
        }
    }

    pub fn get(&self) -> Option<&T> {
        self.raw.as_ref()
    }

    pub fn is_live(&self) -> bool {
        self.raw.is_some()
    }

    /// Release the wrapped value now instead of at drop.
    pub fn reset(&mut self) {
        if let (Some(raw), Some(release)) = (self.raw.take(), self.release.take()) {
            release(raw);
        }
    }

    /// Give up ownership without releasing.
    pub fn into_raw(mut self) -> Option<T> {
        self.release = None;
        self.raw.take()
    }
}

impl<T> Drop for Handle<T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T: fmt::Debug> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.raw).finish()
    }
}

/// Opaque network interface handle (an `esp_netif_t*` on device).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetifId(pub usize);

pub type Netif = Handle<NetifId>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting(released: &Arc<AtomicUsize>) -> Handle<u32> {
        let released = released.clone();
        Handle::new(42, move |raw| {
            assert_eq!(raw, 42);
            released.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn released_once_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        drop(counting(&released));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reset_then_drop_releases_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut handle = counting(&released);
        handle.reset();
        assert!(!handle.is_live());
        handle.reset();
        drop(handle);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn moved_handle_releases_at_final_owner() {
        let released = Arc::new(AtomicUsize::new(0));
        let handle = counting(&released);
        let moved = vec![handle];
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(moved);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn into_raw_skips_release() {
        let released = Arc::new(AtomicUsize::new(0));
        assert_eq!(counting(&released).into_raw(), Some(42));
        assert_eq!(released.load(Ordering::SeqCst), 0);
    }
}
