//! Pluggable low-level allocate/resize/free, out of scope for the tree
//! itself but the seam every node allocation ultimately goes through.

use core::alloc::Layout;
use core::ptr::NonNull;

use log::error;

#[cfg(debug_assertions)]
use spin::Mutex;
#[cfg(debug_assertions)]
use alloc::vec::Vec;

/// A pluggable memory back end. Defaults to the process's global allocator
/// (`SystemBackend`), but any implementation may be supplied to a
/// [`Context`](crate::Context) at construction time.
///
/// # Safety
/// Implementations must behave like `GlobalAlloc`: `allocate` returns memory
/// valid for `layout`, `resize` either grows/shrinks that memory in place or
/// returns a fresh block with the old contents copied (like `realloc`), and
/// `free` releases memory previously returned by `allocate`/`resize` with
/// the exact layout passed to that call.
pub unsafe trait Backend {
    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Option<NonNull<u8>>;

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);

    /// Advisory error hook. Called before the triggering operation returns
    /// `Err`. The default implementation logs and otherwise does nothing;
    /// it may be replaced to abort the process, but returning from it is
    /// well defined (the caller still observes a normal `Err`).
    fn on_error(&self, message: &str) {
        error!("treealloc: {message}");
    }

    /// Used by [`Context::check`](crate::Context::check) to validate that a
    /// node's address range lies within an allocation this backend actually
    /// made. Backends with no bookkeeping to check against (the default for
    /// any implementation that doesn't override it) report every range as
    /// valid, so the structural checker only ever flags a real mismatch
    /// where a backend can actually prove one.
    fn check_bounds(&self, _addr: usize, _size: usize) -> bool {
        true
    }
}

/// Default backend: the process's global allocator.
///
/// Under `debug_assertions` this also records every live `(address, size)`
/// pair in a side table so [`Context::check`](crate::Context::check) can
/// validate that nodes lie within an allocation it actually made, without
/// requiring allocator-specific introspection.
pub struct SystemBackend {
    #[cfg(debug_assertions)]
    live: Mutex<Vec<(usize, usize)>>,
}

impl SystemBackend {
    pub const fn new() -> Self {
        SystemBackend {
            #[cfg(debug_assertions)]
            live: Mutex::new(Vec::new()),
        }
    }

    #[cfg(debug_assertions)]
    pub(crate) fn contains(&self, addr: usize, size: usize) -> bool {
        self.live
            .lock()
            .iter()
            .any(|&(a, s)| addr >= a && addr + size <= a + s)
    }

    #[cfg(not(debug_assertions))]
    pub(crate) fn contains(&self, _addr: usize, _size: usize) -> bool {
        true
    }

    #[cfg(debug_assertions)]
    fn track(&self, addr: usize, size: usize) {
        self.live.lock().push((addr, size));
    }

    #[cfg(debug_assertions)]
    fn untrack(&self, addr: usize) {
        let mut live = self.live.lock();
        if let Some(idx) = live.iter().position(|&(a, _)| a == addr) {
            live.swap_remove(idx);
        }
    }
}

impl Default for SystemBackend {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Backend for SystemBackend {
    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let ptr = unsafe { alloc::alloc::alloc(layout) };
        let ptr = NonNull::new(ptr)?;

        #[cfg(debug_assertions)]
        self.track(ptr.as_ptr() as usize, layout.size());

        Some(ptr)
    }

    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Option<NonNull<u8>> {
        if old_layout.align() != new_layout.align() {
            // the global allocator cannot change alignment in place; fall
            // back to allocate + copy + free
            let new_ptr = unsafe { self.allocate(new_layout) }?;
            let copy_len = core::cmp::min(old_layout.size(), new_layout.size());
            unsafe {
                core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy_len);
                self.free(ptr, old_layout);
            }
            return Some(new_ptr);
        }

        #[cfg(debug_assertions)]
        self.untrack(ptr.as_ptr() as usize);

        let raw = unsafe {
            alloc::alloc::realloc(ptr.as_ptr(), old_layout, new_layout.size())
        };
        let new_ptr = NonNull::new(raw)?;

        #[cfg(debug_assertions)]
        self.track(new_ptr.as_ptr() as usize, new_layout.size());

        Some(new_ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        #[cfg(debug_assertions)]
        self.untrack(ptr.as_ptr() as usize);

        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) }
    }

    fn check_bounds(&self, addr: usize, size: usize) -> bool {
        self.contains(addr, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_tracks_allocations_across_resize_and_free() {
        let backend = SystemBackend::new();
        let layout = Layout::from_size_align(16, 8).unwrap();
        let ptr = unsafe { backend.allocate(layout) }.unwrap();
        assert!(backend.contains(ptr.as_ptr() as usize, 16));
        assert!(!backend.contains(ptr.as_ptr() as usize, 17));

        let bigger = Layout::from_size_align(32, 8).unwrap();
        let ptr = unsafe { backend.resize(ptr, layout, bigger) }.unwrap();
        assert!(backend.contains(ptr.as_ptr() as usize, 32));

        unsafe { backend.free(ptr, bigger) };
        assert!(!backend.contains(ptr.as_ptr() as usize, 32));
    }
}
