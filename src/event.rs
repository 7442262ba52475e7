use bitflags::bitflags;

bitflags! {
    /// Lifecycle events a notifier can subscribe to.
    ///
    /// A destructor is a notifier implicitly restricted to `FREE` alone; it
    /// never needs to be constructed directly from these bits, but `FREE`
    /// is what the dispatcher checks to decide whether a non-destructor
    /// callback also wants free notifications.
    pub struct Event: u16 {
        const FREE          = 0b0_0000_0001;
        const STEAL         = 0b0_0000_0010;
        const MOVE          = 0b0_0000_0100;
        const RESIZE        = 0b0_0000_1000;
        const RENAME        = 0b0_0001_0000;
        const ADD_CHILD     = 0b0_0010_0000;
        const DEL_CHILD     = 0b0_0100_0000;
        const ADD_NOTIFIER  = 0b0_1000_0000;
        const DEL_NOTIFIER  = 0b1_0000_0000;
    }
}

/// Extra payload carried alongside the event type when a notifier fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierInfo {
    None,
    /// The node's previous address, fired with `Event::MOVE`.
    OldAddress(usize),
    /// The node's new payload byte size, fired with `Event::RESIZE`.
    NewSize(usize),
}
