//! Polling of non-blocking file descriptors using the system's polling
//! mechanism.
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(target_os = "linux")]
use crate::network_poller::epoll as sys;

#[cfg(not(target_os = "linux"))]
compile_error!("the reactor requires epoll and signalfd, which need Linux");

/// A poller for non-blocking file descriptors.
pub(crate) type NetworkPoller = sys::Poller;

/// The raw event type filled in by the poller.
pub(crate) type Event = sys::Event;

/// A set of readiness conditions of a file descriptor.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct Events {
    bits: u8,
}

impl Events {
    pub const NONE: Events = Events { bits: 0 };

    /// Data can be read, or the peer hung up its writing half.
    pub const READ: Events = Events { bits: 0b001 };

    /// Data can be written.
    pub const WRITE: Events = Events { bits: 0b010 };

    /// An error or hang-up occurred.
    ///
    /// This condition satisfies every wait on the descriptor, such that the
    /// next operation on it observes the actual error.
    pub const ERROR: Events = Events { bits: 0b100 };

    pub fn bits(self) -> u8 {
        self.bits
    }

    pub fn is_empty(self) -> bool {
        self.bits == 0
    }

    /// Returns `true` if all conditions in `other` are also in `self`.
    pub fn contains(self, other: Events) -> bool {
        self.bits & other.bits == other.bits
    }

    /// Returns `true` if `self` and `other` have at least one condition in
    /// common.
    pub fn intersects(self, other: Events) -> bool {
        self.bits & other.bits != 0
    }
}

impl BitOr for Events {
    type Output = Events;

    fn bitor(self, other: Events) -> Events {
        Events { bits: self.bits | other.bits }
    }
}

impl BitOrAssign for Events {
    fn bitor_assign(&mut self, other: Events) {
        self.bits |= other.bits;
    }
}

impl BitAnd for Events {
    type Output = Events;

    fn bitand(self, other: Events) -> Events {
        Events { bits: self.bits & other.bits }
    }
}

impl Not for Events {
    type Output = Events;

    fn not(self) -> Events {
        Events { bits: !self.bits & 0b111 }
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names = [
            (Events::READ, "READ"),
            (Events::WRITE, "WRITE"),
            (Events::ERROR, "ERROR"),
        ];
        let mut set: Vec<_> = names
            .iter()
            .filter(|(kind, _)| self.contains(*kind))
            .map(|(_, name)| *name)
            .collect();

        if set.is_empty() {
            set.push("NONE");
        }

        f.write_str(&set.join(" | "))
    }
}
