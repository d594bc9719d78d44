//! Logical socket events and the rules governing their combinations
//!
//! A logical event is a lifecycle-aware abstraction over raw OS readiness:
//! `Read`/`Write` belong to an established stream or a datagram socket,
//! `Accept` to a listening socket, `Connect` to a stream socket with a
//! pending connection attempt. The three families describe distinct
//! lifecycle phases and must never be waited on at the same time; the
//! crate-internal `IoPhase` state machine makes the legal transitions
//! explicit.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// A logical socket event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Data can be received.
    Read,
    /// Data can be sent.
    Write,
    /// A pending connection can be accepted.
    Accept,
    /// A pending connection attempt has finished.
    Connect,
}

impl Event {
    /// Dispatch order for per-event handlers. Fixed: Read, Write, Accept,
    /// Connect.
    pub const DISPATCH_ORDER: [Event; 4] = [Event::Read, Event::Write, Event::Accept, Event::Connect];

    pub(crate) fn bit(self) -> u8 {
        match self {
            Event::Read => 1 << 0,
            Event::Write => 1 << 1,
            Event::Accept => 1 << 2,
            Event::Connect => 1 << 3,
        }
    }

    /// Handler table slot for this event.
    pub(crate) fn index(self) -> usize {
        match self {
            Event::Read => 0,
            Event::Write => 1,
            Event::Accept => 2,
            Event::Connect => 3,
        }
    }
}

/// A set of logical events.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct EventSet(u8);

impl EventSet {
    /// The empty set.
    pub const fn empty() -> Self {
        EventSet(0)
    }

    /// Whether the set contains `event`.
    pub fn contains(self, event: Event) -> bool {
        self.0 & event.bit() != 0
    }

    /// Whether the set is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns the set with `event` added.
    #[must_use]
    pub fn with(self, event: Event) -> Self {
        EventSet(self.0 | event.bit())
    }

    /// Returns the set with `event` removed.
    #[must_use]
    pub fn without(self, event: Event) -> Self {
        EventSet(self.0 & !event.bit())
    }

    /// The lifecycle phase this wait set describes.
    pub(crate) fn phase(self) -> IoPhase {
        if self.contains(Event::Accept) {
            IoPhase::Accepting
        } else if self.contains(Event::Connect) {
            IoPhase::Connecting
        } else if self.is_empty() {
            IoPhase::Idle
        } else {
            IoPhase::ReadWriting
        }
    }
}

impl From<Event> for EventSet {
    fn from(event: Event) -> Self {
        EventSet(event.bit())
    }
}

impl BitOr<Event> for Event {
    type Output = EventSet;

    fn bitor(self, rhs: Event) -> EventSet {
        EventSet(self.bit() | rhs.bit())
    }
}

impl BitOr<Event> for EventSet {
    type Output = EventSet;

    fn bitor(self, rhs: Event) -> EventSet {
        self.with(rhs)
    }
}

impl BitOrAssign<Event> for EventSet {
    fn bitor_assign(&mut self, rhs: Event) {
        self.0 |= rhs.bit();
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for ev in Event::DISPATCH_ORDER {
            if self.contains(ev) {
                set.entry(&ev);
            }
        }
        set.finish()
    }
}

/// The socket lifecycle phase implied by the current wait set.
///
/// `Read`/`Write` coexist with each other but with nothing else; `Accept`
/// and `Connect` each stand alone.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum IoPhase {
    Idle,
    ReadWriting,
    Accepting,
    Connecting,
}

impl IoPhase {
    /// Whether waiting on `event` is legal in this phase.
    pub(crate) fn allows(self, event: Event) -> bool {
        match self {
            IoPhase::Idle => true,
            IoPhase::ReadWriting => matches!(event, Event::Read | Event::Write),
            IoPhase::Accepting => event == Event::Accept,
            IoPhase::Connecting => event == Event::Connect,
        }
    }
}

/// Checks that `set` respects the event compatibility rules: `Accept` and
/// `Connect` are each exclusive with everything else.
pub(crate) fn is_compatible(set: EventSet) -> bool {
    match set.phase() {
        IoPhase::Idle | IoPhase::ReadWriting => {
            !set.contains(Event::Accept) && !set.contains(Event::Connect)
        }
        IoPhase::Accepting => set == EventSet::from(Event::Accept),
        IoPhase::Connecting => set == EventSet::from(Event::Connect),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_algebra() {
        let set = Event::Read | Event::Write;
        assert!(set.contains(Event::Read));
        assert!(set.contains(Event::Write));
        assert!(!set.contains(Event::Accept));
        assert!(set.without(Event::Read).without(Event::Write).is_empty());
    }

    #[test]
    fn test_phase_of_wait_set() {
        assert_eq!(EventSet::empty().phase(), IoPhase::Idle);
        assert_eq!(EventSet::from(Event::Read).phase(), IoPhase::ReadWriting);
        assert_eq!((Event::Read | Event::Write).phase(), IoPhase::ReadWriting);
        assert_eq!(EventSet::from(Event::Accept).phase(), IoPhase::Accepting);
        assert_eq!(EventSet::from(Event::Connect).phase(), IoPhase::Connecting);
    }

    #[test]
    fn test_phase_compatibility_matrix() {
        assert!(IoPhase::Idle.allows(Event::Accept));
        assert!(IoPhase::Idle.allows(Event::Connect));
        assert!(IoPhase::ReadWriting.allows(Event::Write));
        assert!(!IoPhase::ReadWriting.allows(Event::Accept));
        assert!(!IoPhase::ReadWriting.allows(Event::Connect));
        assert!(!IoPhase::Accepting.allows(Event::Read));
        assert!(!IoPhase::Accepting.allows(Event::Connect));
        assert!(!IoPhase::Connecting.allows(Event::Write));
        assert!(IoPhase::Connecting.allows(Event::Connect));
    }

    #[test]
    fn test_illegal_combinations_rejected() {
        assert!(is_compatible(Event::Read | Event::Write));
        assert!(is_compatible(EventSet::from(Event::Accept)));
        assert!(!is_compatible(Event::Read | Event::Accept));
        assert!(!is_compatible(Event::Write | Event::Connect));
        assert!(!is_compatible(Event::Accept | Event::Connect));
    }

    #[test]
    fn test_dispatch_order_is_fixed() {
        assert_eq!(
            Event::DISPATCH_ORDER,
            [Event::Read, Event::Write, Event::Accept, Event::Connect]
        );
    }
}
