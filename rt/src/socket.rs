//! Accepting and establishing socket connections.
mod socket_address;

use crate::network_poller::Events;
use crate::result::{Error, Result};
use crate::scheduler::reactor::Reactor;
use crate::scheduler::timeouts::Deadline;
use crate::socket::socket_address::describe;
use log::debug;
use rustix::io::Errno;
use socket2::{SockAddr, SockRef};
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

impl Reactor {
    /// Accepts a connection on the listening socket `fd`.
    ///
    /// The returned socket is in non-blocking mode, but it's up to the caller
    /// to register it.
    pub fn accept(
        &self,
        fd: impl AsFd,
        deadline: Deadline,
    ) -> Result<(OwnedFd, SockAddr)> {
        let (socket, address) =
            self.blocking(fd.as_fd(), Events::READ, deadline, |fd| {
                SockRef::from(&fd).accept()
            })?;

        // Accepted sockets don't inherit the non-blocking status of the
        // listener, so we need to manually mark them as non-blocking.
        socket.set_nonblocking(true)?;
        debug!("accepted a connection from {}", describe(&address));
        Ok((socket.into(), address))
    }

    /// Connects the non-blocking socket `fd` to `address`.
    pub fn connect(
        &self,
        fd: impl AsFd,
        address: &SockAddr,
        deadline: Deadline,
    ) -> Result<()> {
        let fd = fd.as_fd();
        let socket = SockRef::from(&fd);

        match socket.connect(address) {
            Ok(_) => return Ok(()),
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted
                    || e.raw_os_error()
                        == Some(Errno::INPROGRESS.raw_os_error()) => {}
            Err(ref e)
                if e.raw_os_error() == Some(Errno::ISCONN.raw_os_error()) =>
            {
                // We may run into an ISCONN if a previous connect(2) attempt
                // would block. In this case we can just continue.
                return Ok(());
            }
            Err(e) => return Err(Error::Os(e)),
        }

        let raw = fd.as_raw_fd();

        // An unconnected socket reports a hang-up, which mustn't be mistaken
        // for the outcome of this attempt.
        self.consume(raw, Events::WRITE);
        self.wait_for_raw(raw, Events::WRITE, deadline)?;

        // The outcome of the connection attempt is stored in SO_ERROR.
        match socket.take_error()? {
            Some(err) => Err(Error::Os(err)),
            None => {
                debug!("connected to {}", describe(address));
                Ok(())
            }
        }
    }
}
