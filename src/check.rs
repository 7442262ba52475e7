//! Debug-only structural validation: walk a subtree confirming sibling
//! links are mutually consistent, every CHILDREN owner points back at the
//! node that owns it, property chains carry at most one of each non-NOTIFIER
//! kind, and (when the backend is `SystemBackend`) every node's memory is
//! still within a live allocation.
//!
//! Compiled out entirely in release builds: `Context::run_checks` still
//! exists there, but `check` is a no-op, so expensive self-validation is
//! paid for only under `debug_assertions`.

use core::ptr::NonNull;

use log::error;

use crate::backend::Backend;
use crate::header::Header;
use crate::property::{PropertyData, PropertyKind, PropertyLink};
use crate::taken::TakenTracker;
use crate::tree::Context;
use crate::NodeId;

impl<B: Backend, T: TakenTracker> Context<B, T> {
    /// Validates the subtree rooted at `node` (the whole forest if `None`),
    /// logging every inconsistency found under `error_prefix`. Returns
    /// whether the subtree passed. Always returns `true` in release builds
    /// without looking at anything.
    pub fn check(&self, node: Option<NodeId>, error_prefix: &str) -> bool {
        #[cfg(debug_assertions)]
        {
            let root = node.map(|n| unsafe { Header::from_payload_ptr(n) }).unwrap_or(self.sentinel);
            self.check_node(root, error_prefix)
        }
        #[cfg(not(debug_assertions))]
        {
            let _ = (node, error_prefix);
            true
        }
    }

    #[cfg(debug_assertions)]
    fn check_node(&self, header: NonNull<Header>, error_prefix: &str) -> bool {
        let mut ok = true;

        ok &= self.check_bounds(header, error_prefix);

        if let Some(first) = self.first_child(header) {
            ok &= self.check_siblings(header, first, error_prefix);
        }

        let mut child = self.first_child(header);
        while let Some(c) = child {
            ok &= self.check_node(c, error_prefix);
            let c_ref = unsafe { c.as_ref() };
            child = c_ref.sibling_next.get();
        }

        ok &= self.check_properties(header, error_prefix);

        ok
    }

    /// Confirms `header`'s own allocation (header plus payload plus any
    /// LENGTH slack) lies within a range the backend actually handed out.
    /// Backends with no bookkeeping report every range as valid (see
    /// `Backend::check_bounds`), so this only ever fails against
    /// `SystemBackend` in a debug build.
    #[cfg(debug_assertions)]
    fn check_bounds(&self, header: NonNull<Header>, error_prefix: &str) -> bool {
        let header_ref = unsafe { header.as_ref() };
        let size = header_ref.layout.get().size();
        if self.backend.check_bounds(header.as_ptr() as usize, size) {
            true
        } else {
            error!(
                "{error_prefix}: node {:p} ({size} bytes) lies outside any allocation the backend made",
                header.as_ptr()
            );
            false
        }
    }

    #[cfg(debug_assertions)]
    fn check_siblings(&self, parent: NonNull<Header>, first: NonNull<Header>, error_prefix: &str) -> bool {
        let mut ok = true;
        let mut current = first;
        let mut prev: Option<NonNull<Header>> = None;

        loop {
            let current_ref = unsafe { current.as_ref() };

            if current_ref.sibling_prev.get() != prev {
                error!("{error_prefix}: node {:p} has a mismatched sibling_prev link", current.as_ptr());
                ok = false;
            }

            match current_ref.parent_children.get() {
                Some(children_node) => match &unsafe { children_node.as_ref() }.data {
                    PropertyData::Children(c) if c.owner.get() == parent => {}
                    _ => {
                        error!(
                            "{error_prefix}: node {:p} does not point back at its parent {:p}",
                            current.as_ptr(),
                            parent.as_ptr()
                        );
                        ok = false;
                    }
                },
                None => {
                    error!("{error_prefix}: node {:p} has no recorded parent", current.as_ptr());
                    ok = false;
                }
            }

            prev = Some(current);
            match current_ref.sibling_next.get() {
                Some(next) => current = next,
                None => break,
            }
        }

        ok
    }

    #[cfg(debug_assertions)]
    fn check_properties(&self, header: NonNull<Header>, error_prefix: &str) -> bool {
        let header_ref = unsafe { header.as_ref() };
        let mut ok = true;
        let mut seen_children = false;
        let mut seen_name = false;
        let mut seen_length = false;

        let mut link = header_ref.properties.get();
        loop {
            match link {
                PropertyLink::End | PropertyLink::Literal(_) => break,
                PropertyLink::Node(node) => {
                    let node_ref = unsafe { node.as_ref() };
                    match node_ref.data.kind() {
                        PropertyKind::Children if seen_children => {
                            error!("{error_prefix}: node {:p} carries more than one CHILDREN property", header.as_ptr());
                            ok = false;
                        }
                        PropertyKind::Children => seen_children = true,
                        PropertyKind::Name if seen_name => {
                            error!("{error_prefix}: node {:p} carries more than one NAME property", header.as_ptr());
                            ok = false;
                        }
                        PropertyKind::Name => seen_name = true,
                        PropertyKind::Length if seen_length => {
                            error!("{error_prefix}: node {:p} carries more than one LENGTH property", header.as_ptr());
                            ok = false;
                        }
                        PropertyKind::Length => seen_length = true,
                        PropertyKind::Notifier => {}
                    }
                    link = node_ref.next.get();
                }
            }
        }

        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;
    use crate::backend::SystemBackend;
    use crate::builder::AllocatorBuilder;

    /// Forwards every operation to a real `SystemBackend` but never
    /// considers any address range valid, so a node built on top of it
    /// always fails `check`'s bounds check regardless of where it lives.
    struct DenyingBackend(SystemBackend);

    unsafe impl Backend for DenyingBackend {
        unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
            unsafe { self.0.allocate(layout) }
        }

        unsafe fn resize(
            &self,
            ptr: NonNull<u8>,
            old_layout: Layout,
            new_layout: Layout,
        ) -> Option<NonNull<u8>> {
            unsafe { self.0.resize(ptr, old_layout, new_layout) }
        }

        unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
            unsafe { self.0.free(ptr, layout) }
        }

        fn check_bounds(&self, _addr: usize, _size: usize) -> bool {
            false
        }
    }

    #[test]
    fn check_reports_a_node_the_backend_cannot_account_for() {
        let ctx = AllocatorBuilder::new()
            .backend(DenyingBackend(SystemBackend::new()))
            .build();
        let n = ctx.alloc(None, 8, false, None).unwrap();

        assert!(!ctx.check(Some(n), "test"));

        ctx.free(Some(n));
    }

    #[test]
    fn a_freshly_built_tree_passes() {
        let ctx = Context::new();
        let root = ctx.alloc(None, 8, false, None).unwrap();
        let _a = ctx.alloc(Some(root), 8, false, None).unwrap();
        let _b = ctx.alloc(Some(root), 8, false, None).unwrap();

        assert!(ctx.check(None, "test"));

        ctx.free(Some(root));
    }

    #[test]
    fn check_on_a_single_leaf_subtree_passes() {
        let ctx = Context::new();
        let leaf = ctx.alloc(None, 8, false, None).unwrap();
        assert!(ctx.check(Some(leaf), "test"));
        ctx.free(Some(leaf));
    }
}
