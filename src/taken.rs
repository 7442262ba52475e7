//! The "taken pointer" collaborator: an external helper that marks a
//! pointer as ownership-transferred. `Context::dup`/`expand` query it so a
//! "taken" source can be resized and stolen in place rather than copied.
//!
//! This bookkeeping is an external collaborator, not owned functionality:
//! this crate defines the seam and a no-op default, and does not implement
//! duplication-helper policy beyond it.

use core::ptr::NonNull;

/// Queried by `Context::dup`/`Context::expand` to decide whether a source
/// buffer's ownership can be transferred (stolen) instead of copied.
pub trait TakenTracker {
    /// Returns `true` if `ptr` was previously marked taken and should be
    /// consumed (its ownership transferred) rather than copied from.
    fn is_taken(&self, ptr: NonNull<u8>) -> bool;

    /// Called when a taken pointer has actually been consumed.
    fn consume(&self, ptr: NonNull<u8>);

    /// Registered by the allocator as a failure callback: invoked when an
    /// operation that consumed a taken pointer later fails, so the
    /// tracker can release its own bookkeeping for `ptr`.
    fn on_alloc_failure(&self, ptr: NonNull<u8>) {
        let _ = ptr;
    }
}

/// Default tracker: nothing is ever taken, so `dup`/`expand` always copy.
#[derive(Default)]
pub struct NullTakenTracker;

impl TakenTracker for NullTakenTracker {
    fn is_taken(&self, _ptr: NonNull<u8>) -> bool {
        false
    }

    fn consume(&self, _ptr: NonNull<u8>) {}
}
