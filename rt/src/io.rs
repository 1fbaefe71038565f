//! Reading from and writing to non-blocking descriptors.
//!
//! These operations first try the system call, and only suspend the current
//! coroutine when the call would block. The descriptors must be registered
//! using `Reactor::register_fd`.
use crate::network_poller::Events;
use crate::result::{Error, Result};
use crate::scheduler::reactor::Reactor;
use crate::scheduler::timeouts::Deadline;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

impl Reactor {
    /// Calls `func` until it either succeeds or fails with an error other
    /// than `WouldBlock`, waiting for `events` in between attempts.
    ///
    /// A canceled coroutine gets `Error::Canceled` before each attempt, even
    /// if the descriptor has data available.
    pub(crate) fn blocking<T>(
        &self,
        fd: BorrowedFd,
        events: Events,
        deadline: Deadline,
        mut func: impl FnMut(BorrowedFd) -> io::Result<T>,
    ) -> Result<T> {
        let raw = fd.as_raw_fd();

        loop {
            if self.current_is_canceled() {
                return Err(Error::Canceled);
            }

            match func(fd) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    continue
                }
                res => return res.map_err(Error::from),
            }

            // Any readiness recorded before the attempt is stale now.
            self.consume(raw, events);
            self.wait_for_raw(raw, events, deadline)?;
        }
    }

    /// Reads up to `buf.len()` bytes from `fd`.
    ///
    /// A return value of zero signals the end of the input.
    pub fn read(
        &self,
        fd: impl AsFd,
        buf: &mut [u8],
        deadline: Deadline,
    ) -> Result<usize> {
        self.blocking(fd.as_fd(), Events::READ, deadline, |fd| {
            rustix::io::read(fd, &mut *buf).map_err(io::Error::from)
        })
    }

    /// Writes up to `buf.len()` bytes to `fd`, returning the number of bytes
    /// written.
    pub fn write(
        &self,
        fd: impl AsFd,
        buf: &[u8],
        deadline: Deadline,
    ) -> Result<usize> {
        self.blocking(fd.as_fd(), Events::WRITE, deadline, |fd| {
            rustix::io::write(fd, buf).map_err(io::Error::from)
        })
    }

    /// Writes all of `buf` to `fd`.
    ///
    /// The deadline applies to the operation as a whole, not to the
    /// individual writes.
    pub fn write_all(
        &self,
        fd: impl AsFd,
        mut buf: &[u8],
        deadline: Deadline,
    ) -> Result<()> {
        let fd = fd.as_fd();

        while !buf.is_empty() {
            match self.write(fd, buf, deadline)? {
                0 => return Err(Error::Os(io::ErrorKind::WriteZero.into())),
                written => buf = &buf[written..],
            }
        }

        Ok(())
    }
}
