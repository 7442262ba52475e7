//! A `Backend` test double that can be told to fail its Nth call, used to
//! exercise boundary/failure behavior without exhausting real memory.

use std::alloc::Layout;
use std::cell::Cell;
use std::ptr::NonNull;
use std::rc::Rc;

use treealloc::Backend;

pub struct MockBackend {
    calls: Rc<Cell<usize>>,
    fail_at: Rc<Cell<Option<usize>>>,
}

/// A handle retained by the test after the `MockBackend` itself has been
/// moved into a `Context`, used to inspect the call count and arm a future
/// failure.
pub struct MockBackendHandle {
    calls: Rc<Cell<usize>>,
    fail_at: Rc<Cell<Option<usize>>>,
}

impl MockBackend {
    pub fn new() -> (MockBackend, MockBackendHandle) {
        let calls = Rc::new(Cell::new(0));
        let fail_at = Rc::new(Cell::new(None));
        let handle = MockBackendHandle {
            calls: calls.clone(),
            fail_at: fail_at.clone(),
        };
        (MockBackend { calls, fail_at }, handle)
    }

    fn tick(&self) -> bool {
        let n = self.calls.get() + 1;
        self.calls.set(n);
        self.fail_at.get() != Some(n)
    }
}

impl MockBackendHandle {
    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    /// Arms the backend to fail the very next `allocate`/`resize` call.
    pub fn fail_on_next_call(&self) {
        self.fail_at.set(Some(self.calls.get() + 1));
    }
}

unsafe impl Backend for MockBackend {
    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if !self.tick() {
            return None;
        }
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr)
    }

    unsafe fn resize(&self, ptr: NonNull<u8>, old_layout: Layout, new_layout: Layout) -> Option<NonNull<u8>> {
        if !self.tick() {
            return None;
        }
        let raw = unsafe { std::alloc::realloc(ptr.as_ptr(), old_layout, new_layout.size()) };
        NonNull::new(raw)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}
