//! Human-readable names: an owned copy, or a borrowed literal that also
//! terminates the property chain.

use crate::backend::Backend;
use crate::error::AllocError;
use crate::event::{Event, NotifierInfo};
use crate::header::Header;
use crate::property::{name_of, set_name_literal, set_name_owned};
use crate::taken::TakenTracker;
use crate::tree::Context;
use crate::NodeId;

/// Where a name's bytes live.
pub enum Name<'a> {
    /// Copied into backend-owned storage.
    Owned(&'a str),
    /// Borrowed for the lifetime of the program; also terminates the
    /// property chain (see `crate::property`).
    Literal(&'static str),
}

impl<B: Backend, T: TakenTracker> Context<B, T> {
    /// Sets (replacing any existing) name on `node`, firing RENAME.
    pub fn set_name(&self, node: NodeId, name: Name<'_>) -> Result<(), AllocError> {
        let header = unsafe { Header::from_payload_ptr(node) };
        let header_ref = unsafe { header.as_ref() };

        match name {
            Name::Owned(s) => set_name_owned(&self.backend, header_ref, s)?,
            Name::Literal(s) => set_name_literal(&self.backend, header_ref, s),
        }

        if self.notifier_count.get() > 0 {
            self.fire(header, Event::RENAME, NotifierInfo::None);
        }
        self.maybe_check("post-rename check");
        Ok(())
    }

    /// The name held by `node`'s NAME property, or its literal terminator,
    /// whichever is present.
    pub fn name(&self, node: NodeId) -> Option<&str> {
        let header = unsafe { Header::from_payload_ptr(node) };
        name_of(unsafe { header.as_ref() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static RENAMES: AtomicUsize = AtomicUsize::new(0);

    fn on_rename(_payload: &mut [u8], event: Event, _info: NotifierInfo) {
        if event == Event::RENAME {
            RENAMES.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn set_name_fires_rename() {
        let ctx = Context::new();
        let n = ctx.alloc(None, 8, false, None).unwrap();
        ctx.add_notifier(n, Event::RENAME, on_rename).unwrap();

        let before = RENAMES.load(Ordering::SeqCst);
        ctx.set_name(n, Name::Owned("x")).unwrap();
        assert_eq!(RENAMES.load(Ordering::SeqCst), before + 1);

        ctx.free(Some(n));
    }
}
