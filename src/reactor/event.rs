use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Readiness kinds a fiber or callback can wait for on a descriptor.
///
/// The bit values match `EPOLLIN` and `EPOLLOUT`, so a mask converts to and from the
/// kernel representation without translation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Event(u32);

impl Event {
    pub const NONE: Event = Event(0);
    pub const READ: Event = Event(libc::EPOLLIN as u32);
    pub const WRITE: Event = Event(libc::EPOLLOUT as u32);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every kind in `other` is also in `self`.
    pub fn contains(self, other: Event) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether `self` and `other` share at least one kind.
    pub fn intersects(self, other: Event) -> bool {
        self.0 & other.0 != 0
    }

    /// Keeps the READ and WRITE bits of a kernel event mask.
    pub(crate) fn from_epoll(bits: u32) -> Event {
        Event(bits & (Self::READ.0 | Self::WRITE.0))
    }
}

impl BitOr for Event {
    type Output = Event;

    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

impl BitOrAssign for Event {
    fn bitor_assign(&mut self, rhs: Event) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Event {
    type Output = Event;

    fn bitand(self, rhs: Event) -> Event {
        Event(self.0 & rhs.0)
    }
}

impl Not for Event {
    type Output = Event;

    fn not(self) -> Event {
        Event(!self.0 & (Self::READ.0 | Self::WRITE.0))
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Event::READ), self.contains(Event::WRITE)) {
            (true, true) => f.write_str("READ|WRITE"),
            (true, false) => f.write_str("READ"),
            (false, true) => f.write_str("WRITE"),
            (false, false) => f.write_str("NONE"),
        }
    }
}
