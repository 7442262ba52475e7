//! Attach, detach, reparent, recursive free, and traversal over the
//! ownership forest rooted at a [`Context`]'s sentinel.

use core::cell::Cell;
use core::ptr::NonNull;

use log::{debug, trace, warn};

use crate::backend::{Backend, SystemBackend};
use crate::error::AllocError;
use crate::event::{Event, NotifierInfo};
use crate::header::Header;
use crate::property::{
    find_property, free_all_properties, init_property, ChildrenData, PropertyData, PropertyKind,
    PropertyLink,
};
use crate::taken::{NullTakenTracker, TakenTracker};
use crate::{Label, NodeId};

/// Per-forest state: the sentinel root, the pluggable backend, the taken-
/// pointer collaborator, and the context-wide notifier count that gates
/// whether ADD_CHILD/DEL_CHILD/MOVE/RESIZE/RENAME dispatch bothers walking
/// any property lists at all.
///
/// `Context` is not `Sync`: two threads sharing one `&Context` could race
/// on the same node's sibling pointers. Give each thread (or each isolated
/// subsystem) its own `Context`.
pub struct Context<B: Backend = SystemBackend, T: TakenTracker = NullTakenTracker> {
    pub(crate) backend: B,
    pub(crate) taken: T,
    pub(crate) sentinel: NonNull<Header>,
    pub(crate) notifier_count: Cell<usize>,
    pub(crate) run_checks: bool,
}

impl Context<SystemBackend, NullTakenTracker> {
    /// A new context backed by the system allocator, with no taken-pointer
    /// tracking and structural self-checks disabled.
    pub fn new() -> Self {
        Context::with_backend(SystemBackend::new())
    }
}

impl Default for Context<SystemBackend, NullTakenTracker> {
    fn default() -> Self {
        Context::new()
    }
}

impl<B: Backend> Context<B, NullTakenTracker> {
    pub fn with_backend(backend: B) -> Self {
        Context::build(backend, NullTakenTracker, false)
    }
}

impl<B: Backend, T: TakenTracker> Context<B, T> {
    pub(crate) fn build(backend: B, taken: T, run_checks: bool) -> Self {
        let layout = Header::total_layout(0);
        let raw = unsafe { backend.allocate(layout) }
            .expect("failed to allocate the sentinel root node");
        let header_ptr = raw.cast::<Header>();
        unsafe {
            header_ptr.as_ptr().write(Header::new(0, layout));
        }
        let sentinel = header_ptr;

        // the sentinel owns a permanent CHILDREN property pointing at
        // itself, so every otherwise-parentless node has somewhere to
        // attach to from the very first allocation.
        let children = PropertyData::Children(ChildrenData {
            owner: Cell::new(sentinel),
            head: Cell::new(None),
        });
        init_property(&backend, unsafe { sentinel.as_ref() }, children)
            .expect("failed to allocate the sentinel's CHILDREN property");

        Context {
            backend,
            taken,
            sentinel,
            notifier_count: Cell::new(0),
            run_checks,
        }
    }

    /// Runs the structural checker if the context was built with
    /// `run_checks` set, logging under `what`. A no-op call in release
    /// builds and whenever checks are disabled.
    pub(crate) fn maybe_check(&self, what: &str) {
        if self.run_checks {
            self.check(None, what);
        }
    }

    fn header_of(&self, node: NodeId) -> NonNull<Header> {
        unsafe { Header::from_payload_ptr(node) }
    }

    fn resolve_parent(&self, parent: Option<NodeId>) -> NonNull<Header> {
        parent.map(|p| self.header_of(p)).unwrap_or(self.sentinel)
    }

    /// The actual owning node (sentinel or real), with no sentinel-to-None
    /// collapsing. `None` only for a node with no recorded owner at all
    /// (should not occur for any live node this `Context` produced).
    pub(crate) fn real_parent_header(&self, node: NonNull<Header>) -> Option<NonNull<Header>> {
        let node_ref = unsafe { node.as_ref() };
        let children_node = node_ref.parent_children.get()?;
        let children_ref = unsafe { children_node.as_ref() };
        match &children_ref.data {
            PropertyData::Children(c) => Some(c.owner.get()),
            _ => None,
        }
    }

    /// The public notion of "parent": the sentinel itself is never reported
    /// as a parent, so a node attached only to the sentinel looks parentless
    /// to callers.
    pub(crate) fn parent_header(&self, node: NonNull<Header>) -> Option<NonNull<Header>> {
        if node == self.sentinel {
            return None;
        }
        self.real_parent_header(node).filter(|&p| p != self.sentinel)
    }

    /// Returns the recorded parent, or `None` if `node` is parentless
    /// (attached only to the sentinel).
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.parent_header(self.header_of(node)).map(Header::payload_ptr)
    }

    /// Finds or lazily creates `parent`'s CHILDREN property, then links
    /// `child` onto the head of that list.
    pub(crate) fn add_child(
        &self,
        parent: NonNull<Header>,
        child: NonNull<Header>,
    ) -> Result<(), AllocError> {
        let parent_ref = unsafe { parent.as_ref() };
        let children_node = match find_property(parent_ref, PropertyKind::Children) {
            Some((_, node)) => node,
            None => {
                let data = PropertyData::Children(ChildrenData {
                    owner: Cell::new(parent),
                    head: Cell::new(None),
                });
                init_property(&self.backend, parent_ref, data)?
            }
        };

        let children_ref = unsafe { children_node.as_ref() };
        let children = match &children_ref.data {
            PropertyData::Children(c) => c,
            _ => unreachable!("find_property returned a non-CHILDREN record for PropertyKind::Children"),
        };

        let child_ref = unsafe { child.as_ref() };
        let old_head = children.head.get();
        child_ref.sibling_next.set(old_head);
        child_ref.sibling_prev.set(None);
        if let Some(old_head) = old_head {
            unsafe { old_head.as_ref() }.sibling_prev.set(Some(child));
        }
        children.head.set(Some(child));
        child_ref.parent_children.set(Some(children_node));

        Ok(())
    }

    /// Unlinks `child` from whatever child list it is currently on. A
    /// no-op if `child` is already detached (idempotent, so a re-entrant
    /// `free` landing here twice cannot corrupt anything).
    pub(crate) fn detach(&self, child: NonNull<Header>) {
        let child_ref = unsafe { child.as_ref() };
        let prev = child_ref.sibling_prev.get();
        let next = child_ref.sibling_next.get();

        match prev {
            Some(p) => unsafe { p.as_ref() }.sibling_next.set(next),
            None => {
                if let Some(children_node) = child_ref.parent_children.get() {
                    let children_ref = unsafe { children_node.as_ref() };
                    if let PropertyData::Children(c) = &children_ref.data {
                        c.head.set(next);
                    }
                }
            }
        }

        if let Some(n) = next {
            unsafe { n.as_ref() }.sibling_prev.set(prev);
        }

        child_ref.sibling_prev.set(None);
        child_ref.sibling_next.set(None);
        child_ref.parent_children.set(None);
    }

    pub(crate) fn first_child(&self, header: NonNull<Header>) -> Option<NonNull<Header>> {
        let header_ref = unsafe { header.as_ref() };
        match find_property(header_ref, PropertyKind::Children) {
            Some((_, node)) => match &unsafe { node.as_ref() }.data {
                PropertyData::Children(c) => c.head.get(),
                _ => None,
            },
            None => None,
        }
    }

    /// First child of `root` (of the sentinel if `root` is `None`).
    pub fn first(&self, root: Option<NodeId>) -> Option<NodeId> {
        self.first_child(self.resolve_parent(root)).map(Header::payload_ptr)
    }

    fn next_header(&self, root: NonNull<Header>, prev: NonNull<Header>) -> Option<NonNull<Header>> {
        if let Some(child) = self.first_child(prev) {
            return Some(child);
        }

        let mut current = prev;
        loop {
            if current == root {
                return None;
            }

            let current_ref = unsafe { current.as_ref() };
            if let Some(next_sibling) = current_ref.sibling_next.get() {
                return Some(next_sibling);
            }

            current = self.real_parent_header(current)?;
        }
    }

    /// Next node in depth-first pre-order confined to the subtree rooted
    /// at `root` (the sentinel if `root` is `None`). Restartable: callers
    /// pass back whatever `first`/`next` last returned.
    pub fn next(&self, root: Option<NodeId>, prev: NodeId) -> Option<NodeId> {
        let root_header = self.resolve_parent(root);
        let prev_header = self.header_of(prev);
        self.next_header(root_header, prev_header).map(Header::payload_ptr)
    }

    /// Allocates `size` bytes under `parent` (the sentinel if `None`).
    pub fn alloc(
        &self,
        parent: Option<NodeId>,
        size: usize,
        clear: bool,
        label: Option<Label>,
    ) -> Result<NodeId, AllocError> {
        let parent_header = self.resolve_parent(parent);
        let layout = Header::try_total_layout(size)
            .ok_or(AllocError::Overflow("computing a node's allocation size"))?;

        let raw = unsafe { self.backend.allocate(layout) }.ok_or_else(|| {
            self.backend.on_error("allocating a node");
            AllocError::Backend("allocating a node")
        })?;

        let header_ptr = raw.cast::<Header>();
        unsafe {
            header_ptr.as_ptr().write(Header::new(size, layout));
        }
        let header_ref = unsafe { header_ptr.as_ref() };

        if clear {
            let payload = Header::payload_ptr(header_ptr);
            unsafe { core::ptr::write_bytes(payload.as_ptr(), 0, size) };
        }

        if let Some(label) = label {
            header_ref.properties.set(PropertyLink::Literal(label));
        }

        if let Err(e) = self.add_child(parent_header, header_ptr) {
            unsafe { self.backend.free(raw, layout) };
            return Err(e);
        }

        if self.notifier_count.get() > 0 {
            self.fire(parent_header, Event::ADD_CHILD, NotifierInfo::None);
        }

        trace!("treealloc: allocated node of {size} bytes at {:p}", raw.as_ptr());
        self.maybe_check("post-alloc check");
        Ok(Header::payload_ptr(header_ptr))
    }

    /// Frees `node` and every node in its subtree. A no-op on `None` or on
    /// a node already mid-teardown (re-entrant free of the currently
    /// freeing node).
    pub fn free(&self, node: Option<NodeId>) {
        let Some(node) = node else { return };
        let header = self.header_of(node);

        if header == self.sentinel {
            warn!("treealloc: ignoring attempt to free the sentinel root");
            return;
        }

        let header_ref = unsafe { header.as_ref() };
        if header_ref.destroying.get() {
            // re-entrant free of the node currently being torn down
            return;
        }

        if self.notifier_count.get() > 0 {
            if let Some(real_parent) = self.real_parent_header(header) {
                self.fire(real_parent, Event::DEL_CHILD, NotifierInfo::None);
            }
        }

        self.detach(header);
        self.del_tree(header);
        self.maybe_check("post-free check");
    }

    /// Depth-first, post-order-ish teardown: fire FREE on this node, then
    /// recurse into children (re-reading the current first child after
    /// every recursive call, since a destructor may have mutated the
    /// list), then free this node's own properties and storage.
    fn del_tree(&self, header: NonNull<Header>) {
        let header_ref = unsafe { header.as_ref() };
        if header_ref.destroying.get() {
            return;
        }
        header_ref.destroying.set(true);

        self.fire(header, Event::FREE, NotifierInfo::None);

        loop {
            let child = self.first_child(header);
            let Some(child) = child else { break };
            self.detach(child);
            self.del_tree(child);
        }

        free_all_properties(&self.backend, header_ref);

        let layout = header_ref.layout.get();
        debug!("treealloc: freeing node at {:p}", header.as_ptr());
        unsafe { self.backend.free(header.cast(), layout) };
    }

    /// Reparents `node` onto `new_parent` (the sentinel if `None`). On
    /// failure to attach to the new parent, re-attaches to the old parent
    /// (guaranteed to succeed) and reports the original error.
    pub fn steal(&self, new_parent: Option<NodeId>, node: NodeId) -> Result<(), AllocError> {
        let header = self.header_of(node);
        let new_parent_header = self.resolve_parent(new_parent);
        let old_parent_header = self.real_parent_header(header);

        self.detach(header);

        match self.add_child(new_parent_header, header) {
            Ok(()) => {
                if self.notifier_count.get() > 0 {
                    self.fire(header, Event::STEAL, NotifierInfo::None);
                }
                self.maybe_check("post-steal check");
                Ok(())
            }
            Err(e) => {
                if let Some(old_parent) = old_parent_header {
                    self.add_child(old_parent, header)
                        .expect("re-attaching to the previous parent must not fail");
                }
                Err(e)
            }
        }
    }
}
