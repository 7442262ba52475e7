//! Fluent construction of a [`Context`], functioning similarly to the
//! standard library's `process::Command`: configure, then call
//! [`AllocatorBuilder::build`] once at the end.

use crate::backend::{Backend, SystemBackend};
use crate::taken::{NullTakenTracker, TakenTracker};
use crate::tree::Context;

pub struct AllocatorBuilder<B: Backend = SystemBackend, T: TakenTracker = NullTakenTracker> {
    backend: B,
    taken: T,
    run_checks: bool,
}

impl AllocatorBuilder<SystemBackend, NullTakenTracker> {
    /// Starts from the system allocator, no taken-pointer tracking, and
    /// checks disabled.
    pub fn new() -> Self {
        AllocatorBuilder {
            backend: SystemBackend::new(),
            taken: NullTakenTracker,
            run_checks: false,
        }
    }
}

impl Default for AllocatorBuilder<SystemBackend, NullTakenTracker> {
    fn default() -> Self {
        AllocatorBuilder::new()
    }
}

impl<B: Backend, T: TakenTracker> AllocatorBuilder<B, T> {
    /// Swaps in a custom backend, discarding the previously configured one.
    pub fn backend<B2: Backend>(self, backend: B2) -> AllocatorBuilder<B2, T> {
        AllocatorBuilder {
            backend,
            taken: self.taken,
            run_checks: self.run_checks,
        }
    }

    /// Swaps in a custom taken-pointer tracker.
    pub fn taken_tracker<T2: TakenTracker>(self, taken: T2) -> AllocatorBuilder<B, T2> {
        AllocatorBuilder {
            backend: self.backend,
            taken,
            run_checks: self.run_checks,
        }
    }

    /// When `run`, `check` runs after every mutating operation. Always a
    /// no-op outside `debug_assertions` regardless of this setting.
    pub fn run_checks(mut self, run: bool) -> Self {
        self.run_checks = run;
        self
    }

    pub fn build(self) -> Context<B, T> {
        Context::build(self.backend, self.taken, self.run_checks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_usable_context_with_checks_enabled() {
        let ctx = AllocatorBuilder::new().run_checks(true).build();
        let n = ctx.alloc(None, 8, false, None).unwrap();
        ctx.free(Some(n));
    }
}
