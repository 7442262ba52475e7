//! Array allocations: a node that additionally tracks an element count,
//! in-place (or moving) resize, `expand`-into-larger-copy, and `dup`.
//!
//! The element count is stored as a LENGTH property living in the node's
//! own trailing payload slack rather than a separate backend allocation,
//! so it travels with the node through `resize` for free, and costs
//! nothing beyond `size_of::<PropertyNode>()` extra bytes per array node.

use core::ptr::NonNull;

use log::trace;

use crate::backend::Backend;
use crate::error::AllocError;
use crate::event::{Event, NotifierInfo};
use crate::header::{Header, HEADER_SIZE};
use crate::property::{
    find_property, init_length_in_place, length_record_layout, unlink_only, ChildrenData,
    PropertyData, PropertyKind,
};
use crate::taken::TakenTracker;
use crate::tree::Context;
use crate::{Label, NodeId};

fn align_up_checked(value: usize, align: usize) -> Option<usize> {
    let mask = align - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Computes the payload size to actually allocate for an array of `count`
/// elements of `elem_size`, plus (if `add_count`) the byte offset within
/// that payload at which to place the in-place LENGTH record.
fn array_layout(elem_size: usize, count: usize, add_count: bool) -> Result<(usize, Option<usize>), AllocError> {
    let base = elem_size
        .checked_mul(count)
        .ok_or(AllocError::Overflow("multiplying element size by element count"))?;
    if !add_count {
        return Ok((base, None));
    }

    let record = length_record_layout();
    let offset = align_up_checked(base, record.align())
        .ok_or(AllocError::Overflow("aligning an array payload for its length record"))?;
    let total = offset
        .checked_add(record.size())
        .ok_or(AllocError::Overflow("reserving slack for a length record"))?;
    Ok((total, Some(offset)))
}

impl<B: Backend, T: TakenTracker> Context<B, T> {
    /// The element count recorded in `node`'s LENGTH property, or `0` if
    /// `node` was not allocated as an array (carries no LENGTH property).
    pub fn count(&self, node: NodeId) -> usize {
        let header = unsafe { Header::from_payload_ptr(node) };
        match find_property(unsafe { header.as_ref() }, PropertyKind::Length) {
            Some((_, length_node)) => match &unsafe { length_node.as_ref() }.data {
                PropertyData::Length(n) => *n,
                _ => 0,
            },
            None => 0,
        }
    }

    /// Allocates an array of `count` elements of `elem_size` bytes each.
    /// When `add_count` is set, the element count is recorded in a LENGTH
    /// property so later `count`/`resize`/`expand` calls on the returned
    /// node know how many elements it holds without the caller repeating
    /// itself.
    pub fn alloc_array(
        &self,
        parent: Option<NodeId>,
        elem_size: usize,
        count: usize,
        clear: bool,
        add_count: bool,
        label: Option<Label>,
    ) -> Result<NodeId, AllocError> {
        let (payload_size, length_offset) = array_layout(elem_size, count, add_count)?;
        let node = self.alloc(parent, payload_size, clear, label)?;

        if let Some(offset) = length_offset {
            let header = unsafe { Header::from_payload_ptr(node) };
            let header_ref = unsafe { header.as_ref() };
            let at = unsafe { NonNull::new_unchecked(node.as_ptr().add(offset)) };
            init_length_in_place(header_ref, at, count);
            // the slack reserved for the length record is never part of
            // the logical payload callers see through `payload_slice`.
            header_ref.payload_size.set(elem_size.checked_mul(count).unwrap());
        }

        Ok(node)
    }

    /// Repairs sibling/CHILDREN-owner pointers after a node's backing
    /// storage moved from `old_header` to `new_header` during `resize`.
    fn repair_after_move(&self, new_header: NonNull<Header>) {
        let new_ref = unsafe { new_header.as_ref() };

        match new_ref.sibling_prev.get() {
            Some(prev) => unsafe { prev.as_ref() }.sibling_next.set(Some(new_header)),
            None => {
                if let Some(children_node) = new_ref.parent_children.get() {
                    if let PropertyData::Children(c) = &unsafe { children_node.as_ref() }.data {
                        c.head.set(Some(new_header));
                    }
                }
            }
        }
        if let Some(next) = new_ref.sibling_next.get() {
            unsafe { next.as_ref() }.sibling_prev.set(Some(new_header));
        }

        if let Some((_, children_node)) = find_property(new_ref, PropertyKind::Children) {
            if let PropertyData::Children(ChildrenData { owner, .. }) =
                &unsafe { children_node.as_ref() }.data
            {
                owner.set(new_header);
            }
        }
    }

    /// Resizes `node` in place to hold `new_count` elements of `elem_size`
    /// bytes, updating `*node` if the backend had to move the allocation
    /// and firing MOVE (if moved) then RESIZE. If `node` carries a LENGTH
    /// property, its slack is preserved and rewritten with `new_count`;
    /// nodes without one are resized as plain byte buffers.
    pub fn resize(&self, node: &mut NodeId, elem_size: usize, new_count: usize) -> Result<(), AllocError> {
        let header = unsafe { Header::from_payload_ptr(*node) };
        let header_ref = unsafe { header.as_ref() };

        let base = elem_size
            .checked_mul(new_count)
            .ok_or(AllocError::Overflow("multiplying element size by new element count"))?;
        let had_length = find_property(header_ref, PropertyKind::Length).is_some();
        let (new_payload, new_offset) = array_layout(elem_size, new_count, had_length)?;

        // detach (without freeing -- the record lives in tail slack, not
        // backend-owned storage) any existing LENGTH property so nothing
        // keeps pointing into memory the backend may relocate out from
        // under it.
        if let Some((slot, length_node)) = find_property(header_ref, PropertyKind::Length) {
            unlink_only(slot, length_node);
        }

        let old_layout = header_ref.layout.get();
        let new_layout = Header::try_total_layout(new_payload)
            .ok_or(AllocError::Overflow("computing a resized node's allocation size"))?;
        let old_addr = Header::payload_ptr(header).as_ptr() as usize;

        let new_raw = unsafe { self.backend.resize(header.cast(), old_layout, new_layout) }.ok_or_else(|| {
            self.backend.on_error("resizing a node");
            AllocError::Backend("resizing a node")
        })?;

        let new_header = new_raw.cast::<Header>();
        let new_header_ref = unsafe { new_header.as_ref() };
        new_header_ref.layout.set(new_layout);
        new_header_ref.payload_size.set(base);

        if let Some(offset) = new_offset {
            let at = unsafe { NonNull::new_unchecked(new_raw.as_ptr().add(HEADER_SIZE).add(offset)) };
            init_length_in_place(new_header_ref, at, new_count);
        }

        let moved = new_header != header;
        if moved {
            self.repair_after_move(new_header);
        }

        *node = Header::payload_ptr(new_header);

        if self.notifier_count.get() > 0 {
            if moved {
                self.fire(new_header, Event::MOVE, NotifierInfo::OldAddress(old_addr));
            }
            self.fire(new_header, Event::RESIZE, NotifierInfo::NewSize(base));
        }

        trace!("treealloc: resized node to {base} bytes at {:p}", new_raw.as_ptr());
        self.maybe_check("post-resize check");
        Ok(())
    }

    /// Grows `node` by `added_count` elements and copies `src` into the
    /// newly added tail. `node` must already carry a LENGTH property (i.e.
    /// was allocated with `add_count` set). `src` must not overlap the
    /// region being grown; consults the `TakenTracker` on `src`'s address
    /// the same way `dup` does.
    pub fn expand(
        &self,
        node: &mut NodeId,
        src: &[u8],
        elem_size: usize,
        added_count: usize,
    ) -> Result<(), AllocError> {
        let old_count = self.count(*node);
        let new_count = old_count
            .checked_add(added_count)
            .ok_or(AllocError::Overflow("adding to an array's element count"))?;

        let header = unsafe { Header::from_payload_ptr(*node) };
        let old_len = unsafe { header.as_ref() }.payload_size.get();
        let node_start = node.as_ptr() as usize;
        let node_end = node_start + old_len;
        let src_start = src.as_ptr() as usize;
        let src_end = src_start + src.len();
        if !src.is_empty() && src_start < node_end && node_start < src_end {
            return Err(AllocError::Corrupt("expand source aliases the region being grown"));
        }

        let src_ptr = NonNull::new(src.as_ptr() as *mut u8);
        let mut taken = false;
        if let Some(src_ptr) = src_ptr {
            if self.taken.is_taken(src_ptr) {
                self.taken.consume(src_ptr);
                taken = true;
            }
        }

        if let Err(e) = self.resize(node, elem_size, new_count) {
            if taken {
                if let Some(src_ptr) = src_ptr {
                    self.taken.on_alloc_failure(src_ptr);
                }
            }
            return Err(e);
        }

        let copy_bytes = elem_size.checked_mul(added_count).unwrap_or(usize::MAX).min(src.len());
        if copy_bytes > 0 {
            let tail = unsafe { node.as_ptr().add(old_len) };
            unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), tail, copy_bytes) };
        }

        Ok(())
    }

    /// Allocates a new array under `parent` with `n + extra` elements of
    /// `elem_size` bytes, copying `n` elements from `src`. Elements beyond
    /// `src`'s length are left uninitialized unless `clear` zeroes them
    /// first; `clear` is implied whenever `extra > 0`, since otherwise the
    /// tail past the copied prefix would expose uninitialized memory.
    /// Consults the `TakenTracker` on `src`'s address to warn about
    /// duplicating a buffer the tracker considers already spoken for.
    pub fn dup(
        &self,
        parent: Option<NodeId>,
        src: &[u8],
        elem_size: usize,
        n: usize,
        extra: usize,
        add_count: bool,
        label: Option<Label>,
    ) -> Result<NodeId, AllocError> {
        let src_ptr = NonNull::new(src.as_ptr() as *mut u8);
        let mut taken = false;
        if let Some(src_ptr) = src_ptr {
            if self.taken.is_taken(src_ptr) {
                self.taken.consume(src_ptr);
                taken = true;
            }
        }

        let total_count = n
            .checked_add(extra)
            .ok_or(AllocError::Overflow("adding extra elements to a duplicated array's count"))?;
        let clear = extra > 0;
        let node = match self.alloc_array(parent, elem_size, total_count, clear, add_count, label) {
            Ok(node) => node,
            Err(e) => {
                if taken {
                    if let Some(src_ptr) = src_ptr {
                        self.taken.on_alloc_failure(src_ptr);
                    }
                }
                return Err(e);
            }
        };

        let copy_bytes = elem_size
            .checked_mul(n)
            .ok_or(AllocError::Overflow("computing bytes to copy into a duplicated array"))?;
        let copy_bytes = copy_bytes.min(src.len());
        if copy_bytes > 0 {
            unsafe {
                core::ptr::copy_nonoverlapping(src.as_ptr(), node.as_ptr(), copy_bytes);
            }
        }

        Ok(node)
    }
}
