//! Intrusive, singly-linked property chain: CHILDREN, NAME, NOTIFIER,
//! LENGTH. Real properties are heap nodes allocated through the node's
//! `Backend`; a property chain may also end in a *literal* name, a
//! borrowed `&'static str` that doubles as both a NAME value and the
//! chain terminator.
//!
//! The C original distinguishes literal terminators from real property
//! headers by a first-byte tagging convention on the list's `next`
//! pointer. This crate represents the same idea as an explicit sum type
//! instead (see `PropertyLink`), preserving the observable behavior (a
//! literal name shadows any nonexistent NAME property) without pointer
//! aliasing tricks.

use core::alloc::Layout;
use core::cell::Cell;
use core::ptr::NonNull;

use alloc::vec::Vec;

use crate::backend::Backend;
use crate::error::AllocError;
use crate::event::Event;
use crate::header::Header;

pub type DestructorFn = fn(&mut [u8]);
pub type NotifierFn = fn(&mut [u8], Event, crate::event::NotifierInfo);

#[derive(Clone, Copy)]
pub(crate) enum Callback {
    Destructor(DestructorFn),
    Notifier(NotifierFn),
}

impl Callback {
    pub(crate) fn addr(&self) -> usize {
        match self {
            Callback::Destructor(f) => *f as usize,
            Callback::Notifier(f) => *f as usize,
        }
    }
}

pub(crate) struct ChildrenData {
    /// The node this CHILDREN property belongs to. A plain field would be
    /// enough at creation time, but a `resize` that relocates the owning
    /// node must patch this afterward, hence `Cell`.
    pub(crate) owner: Cell<NonNull<Header>>,
    pub(crate) head: Cell<Option<NonNull<Header>>>,
}

pub(crate) struct NotifierData {
    pub(crate) mask: Cell<Event>,
    pub(crate) callback: Callback,
}

/// A block of bytes owned by this property, allocated through the node's
/// backend rather than the ambient global allocator (property storage must
/// flow through the same pluggable backend as node storage).
pub(crate) struct OwnedBytes {
    ptr: NonNull<u8>,
    len: usize,
}

impl OwnedBytes {
    fn alloc(backend: &dyn Backend, bytes: &[u8]) -> Result<OwnedBytes, AllocError> {
        let layout = Layout::array::<u8>(bytes.len().max(1))
            .map_err(|_| AllocError::Overflow("computing name storage layout"))?;
        let ptr = unsafe { backend.allocate(layout) }
            .ok_or(AllocError::Backend("allocating name storage"))?;
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
        }
        Ok(OwnedBytes { ptr, len: bytes.len() })
    }

    pub(crate) fn as_str(&self) -> &str {
        let slice = unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) };
        unsafe { core::str::from_utf8_unchecked(slice) }
    }

    unsafe fn free(&self, backend: &dyn Backend) {
        let layout = Layout::array::<u8>(self.len.max(1)).unwrap();
        unsafe { backend.free(self.ptr, layout) };
    }
}

pub(crate) enum PropertyData {
    Children(ChildrenData),
    Name(OwnedBytes),
    Notifier(NotifierData),
    /// Element count for array allocations. Physically resident in the
    /// payload's trailing slack rather than a separate backend allocation
    /// (see `crate::resize`); freeing a node must therefore skip this
    /// variant when walking properties to free.
    Length(usize),
}

impl PropertyData {
    pub(crate) fn kind(&self) -> PropertyKind {
        match self {
            PropertyData::Children(_) => PropertyKind::Children,
            PropertyData::Name(_) => PropertyKind::Name,
            PropertyData::Notifier(_) => PropertyKind::Notifier,
            PropertyData::Length(_) => PropertyKind::Length,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PropertyKind {
    Children,
    Name,
    Notifier,
    Length,
}

pub(crate) struct PropertyNode {
    pub(crate) next: Cell<PropertyLink>,
    pub(crate) data: PropertyData,
}

/// How a property chain continues: another property, the end, or a
/// borrowed literal name terminating (and shadowing) the chain.
#[derive(Clone, Copy)]
pub(crate) enum PropertyLink {
    End,
    Node(NonNull<PropertyNode>),
    Literal(&'static str),
}

/// Layout reserved at the tail of an array payload for an in-place LENGTH
/// record. Using `PropertyNode`'s own layout keeps `find_property`
/// oblivious to whether a property was backend-allocated or placed in a
/// node's trailing slack.
pub(crate) fn length_record_layout() -> Layout {
    Layout::new::<PropertyNode>()
}

/// Push a backend-allocated property onto the head of `header`'s chain.
pub(crate) fn init_property(
    backend: &dyn Backend,
    header: &Header,
    data: PropertyData,
) -> Result<NonNull<PropertyNode>, AllocError> {
    let layout = Layout::new::<PropertyNode>();
    let ptr = unsafe { backend.allocate(layout) }
        .ok_or(AllocError::Backend("allocating a property record"))?;
    let node_ptr = ptr.cast::<PropertyNode>();
    unsafe {
        node_ptr.as_ptr().write(PropertyNode {
            next: Cell::new(header.properties.get()),
            data,
        });
    }
    header.properties.set(PropertyLink::Node(node_ptr));
    Ok(node_ptr)
}

/// Write a LENGTH property directly into previously reserved payload
/// slack (no backend allocation) and push it onto the head of the chain.
pub(crate) fn init_length_in_place(
    header: &Header,
    at: NonNull<u8>,
    count: usize,
) -> NonNull<PropertyNode> {
    let node_ptr = at.cast::<PropertyNode>();
    unsafe {
        node_ptr.as_ptr().write(PropertyNode {
            next: Cell::new(header.properties.get()),
            data: PropertyData::Length(count),
        });
    }
    header.properties.set(PropertyLink::Node(node_ptr));
    node_ptr
}

pub(crate) fn set_name_owned(
    backend: &dyn Backend,
    header: &Header,
    name: &str,
) -> Result<(), AllocError> {
    remove_name(backend, header);
    let bytes = OwnedBytes::alloc(backend, name.as_bytes())?;
    init_property(backend, header, PropertyData::Name(bytes))?;
    Ok(())
}

pub(crate) fn set_name_literal(backend: &dyn Backend, header: &Header, name: &'static str) {
    remove_name(backend, header);
    // splice the literal onto the tail of the chain: walk to the current
    // end (stopping before any pre-existing literal, which remove_name
    // above already stripped) and replace it with the new literal.
    let mut slot = &header.properties;
    loop {
        match slot.get() {
            PropertyLink::End => {
                slot.set(PropertyLink::Literal(name));
                return;
            }
            PropertyLink::Literal(_) => {
                slot.set(PropertyLink::Literal(name));
                return;
            }
            PropertyLink::Node(node) => {
                let node_ref = unsafe { node.as_ref() };
                slot = &node_ref.next;
            }
        }
    }
}

/// Remove any existing NAME property or literal terminator, freeing
/// backend-owned storage in the owned-name case.
pub(crate) fn remove_name(backend: &dyn Backend, header: &Header) {
    unlink_matching(backend, header, |data| matches!(data, PropertyData::Name(_)));

    // a literal terminator is not a `PropertyData::Name`, so strip it
    // separately by finding whichever link currently points at `End`/
    // `Literal` (the tail) and resetting it to `End`.
    let mut slot = &header.properties;
    loop {
        match slot.get() {
            PropertyLink::Literal(_) => {
                slot.set(PropertyLink::End);
                return;
            }
            PropertyLink::End => return,
            PropertyLink::Node(node) => {
                let node_ref = unsafe { node.as_ref() };
                slot = &node_ref.next;
            }
        }
    }
}

/// Name this node carries: an owned NAME property's text, or the literal
/// terminator string, whichever is present.
pub(crate) fn name_of<'a>(header: &'a Header) -> Option<&'a str> {
    let mut link = header.properties.get();
    loop {
        match link {
            PropertyLink::End => return None,
            PropertyLink::Literal(s) => return Some(s),
            PropertyLink::Node(node) => {
                let node_ref = unsafe { node.as_ref() };
                if let PropertyData::Name(bytes) = &node_ref.data {
                    return Some(bytes.as_str());
                }
                link = node_ref.next.get();
            }
        }
    }
}

/// Find the first property of `kind`, returning a reference to the
/// `PropertyNode` plus the slot (a `&Cell<PropertyLink>`) that points at
/// it, so the caller can unlink in O(1). Stops at the first literal
/// terminator, as a literal can never be a real property.
pub(crate) fn find_property<'a>(
    header: &'a Header,
    kind: PropertyKind,
) -> Option<(&'a Cell<PropertyLink>, NonNull<PropertyNode>)> {
    let mut slot = &header.properties;
    loop {
        match slot.get() {
            PropertyLink::End | PropertyLink::Literal(_) => return None,
            PropertyLink::Node(node) => {
                let node_ref = unsafe { node.as_ref() };
                if node_ref.data.kind() == kind {
                    return Some((slot, node));
                }
                slot = &node_ref.next;
            }
        }
    }
}

/// Find every NOTIFIER property, in chain order.
pub(crate) fn notifiers<'a>(header: &'a Header) -> Vec<NonNull<PropertyNode>> {
    let mut out = Vec::new();
    let mut link = header.properties.get();
    loop {
        match link {
            PropertyLink::End | PropertyLink::Literal(_) => return out,
            PropertyLink::Node(node) => {
                let node_ref = unsafe { node.as_ref() };
                if matches!(node_ref.data, PropertyData::Notifier(_)) {
                    out.push(node);
                }
                link = node_ref.next.get();
            }
        }
    }
}

/// Unlink and free (through `backend`, except LENGTH records) the first
/// property matching `pred`.
pub(crate) fn unlink_matching(
    backend: &dyn Backend,
    header: &Header,
    pred: impl Fn(&PropertyData) -> bool,
) -> bool {
    let mut slot = &header.properties;
    loop {
        match slot.get() {
            PropertyLink::End | PropertyLink::Literal(_) => return false,
            PropertyLink::Node(node) => {
                let node_ref = unsafe { node.as_ref() };
                if pred(&node_ref.data) {
                    slot.set(node_ref.next.get());
                    free_property_node(backend, node);
                    return true;
                }
                slot = &node_ref.next;
            }
        }
    }
}

/// Unlink (without freeing) the property at `slot`, returning it. Used by
/// `resize` when a LENGTH record moves to a new address and the old one
/// must be spliced out without running its (nonexistent) free logic.
pub(crate) fn unlink_only(slot: &Cell<PropertyLink>, node: NonNull<PropertyNode>) {
    let node_ref = unsafe { node.as_ref() };
    slot.set(node_ref.next.get());
}

/// Free every property on `header`'s chain that is neither LENGTH (tail
/// slack, freed with the node itself) nor a literal (borrowed storage).
pub(crate) fn free_all_properties(backend: &dyn Backend, header: &Header) {
    let mut link = header.properties.get();
    header.properties.set(PropertyLink::End);
    loop {
        match link {
            PropertyLink::End | PropertyLink::Literal(_) => return,
            PropertyLink::Node(node) => {
                let node_ref = unsafe { node.as_ref() };
                let next = node_ref.next.get();
                if matches!(node_ref.data, PropertyData::Length(_)) {
                    // tail slack, not independently freed
                } else {
                    free_property_node(backend, node);
                }
                link = next;
            }
        }
    }
}

fn free_property_node(backend: &dyn Backend, node: NonNull<PropertyNode>) {
    unsafe {
        let node_ref = node.as_ref();
        if let PropertyData::Name(bytes) = &node_ref.data {
            bytes.free(backend);
        }
        core::ptr::drop_in_place(node.as_ptr());
        backend.free(node.cast(), Layout::new::<PropertyNode>());
    }
}
