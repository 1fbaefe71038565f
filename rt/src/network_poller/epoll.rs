use crate::network_poller::Events;
use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLET,
    EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, EPOLL_CLOEXEC, EPOLL_CTL_ADD,
    EPOLL_CTL_DEL,
};
use std::ffi::c_int;
use std::io::{Error, ErrorKind, Result as IoResult};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::null_mut;
use std::time::Duration;

/// Descriptors are watched for all conditions at once, and only changes are
/// reported.
const FLAGS: c_int = EPOLLIN | EPOLLOUT | EPOLLRDHUP | EPOLLET;

pub(crate) type Event = epoll_event;

fn events_for(flags: u32) -> Events {
    let flags = flags as c_int;
    let mut events = Events::NONE;

    if flags & (EPOLLIN | EPOLLRDHUP) != 0 {
        events |= Events::READ;
    }

    if flags & EPOLLOUT != 0 {
        events |= Events::WRITE;
    }

    if flags & (EPOLLERR | EPOLLHUP) != 0 {
        events |= Events::ERROR;
    }

    events
}

/// Converts a timeout into milliseconds, rounding up so we never wake up
/// before a deadline passed.
fn timeout_millis(timeout: Option<Duration>) -> c_int {
    match timeout {
        Some(time) => {
            let millis = time.as_nanos().div_ceil(1_000_000);

            millis.min(c_int::MAX as u128) as c_int
        }
        None => -1,
    }
}

pub(crate) struct Poller {
    fd: OwnedFd,
}

impl Poller {
    pub(crate) fn new() -> IoResult<Poller> {
        let fd = unsafe { epoll_create1(EPOLL_CLOEXEC) };

        if fd == -1 {
            return Err(Error::last_os_error());
        }

        // Safety: we checked the file descriptor so at this point it's
        // guaranteed to be valid.
        Ok(Poller { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    /// Waits for events, for at most `timeout` or forever if it's `None`.
    pub(crate) fn poll<'a>(
        &self,
        events: &'a mut Vec<Event>,
        timeout: Option<Duration>,
    ) -> impl Iterator<Item = (RawFd, Events)> + 'a {
        let millis = timeout_millis(timeout);
        let res = loop {
            let res = unsafe {
                epoll_wait(
                    self.fd.as_raw_fd(),
                    events.as_mut_ptr(),
                    events.capacity() as _,
                    millis,
                )
            };

            if res != -1 {
                break res;
            }

            let err = Error::last_os_error();

            // A signal arriving while we wait isn't a problem, but we retry
            // with the full timeout. The caller recomputes it after every
            // poll, so at worst we wait a bit longer than necessary.
            if err.kind() != ErrorKind::Interrupted {
                panic!("epoll_wait() failed: {}", err);
            }
        };

        // Safety: the above check ensures the length value is valid.
        unsafe { events.set_len(res as _) };
        events.iter().map(|e| (e.u64 as RawFd, events_for(e.events)))
    }

    pub(crate) fn add(&self, source: impl AsRawFd) -> IoResult<()> {
        let fd = source.as_raw_fd();
        let mut event = epoll_event { events: FLAGS as u32, u64: fd as u64 };

        self.ctl(EPOLL_CTL_ADD, fd, &mut event)
    }

    pub(crate) fn delete(&self, source: impl AsRawFd) -> IoResult<()> {
        self.ctl(EPOLL_CTL_DEL, source.as_raw_fd(), null_mut())
    }

    fn ctl(&self, op: c_int, fd: RawFd, event: *mut Event) -> IoResult<()> {
        let res = unsafe { epoll_ctl(self.fd.as_raw_fd(), op, fd, event) };

        if res == -1 {
            Err(Error::last_os_error())
        } else {
            Ok(())
        }
    }
}
