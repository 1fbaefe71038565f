//! A TCP server that sends back whatever its clients send.
use crate::logger;
use libc::{SIGHUP, SIGINT, SIGTERM};
use log::{debug, error, info, warn};
use portcullis::{Deadline, Error, Reactor, Result, SignalSet};
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::time::Duration;

/// The number of pending connections the listener accepts.
const BACKLOG: i32 = 1024;

/// The size of the buffer used for reading from clients.
const BUFFER_SIZE: usize = 16 * 1024;

/// How long to wait before accepting connections again after accepting one
/// failed, such as when running out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Settings for the echo server.
pub(crate) struct Server {
    /// The address to listen on.
    pub(crate) address: SocketAddr,

    /// How long a client may stay idle before it's disconnected.
    pub(crate) timeout: Option<Duration>,
}

impl Server {
    /// Runs the server until it receives SIGINT or SIGTERM.
    ///
    /// SIGHUP reloads the log level.
    pub(crate) fn run(&self, reactor: &Reactor) -> Result<()> {
        let listener = listen(self.address)?;
        let timeout = self.timeout;
        let mut shutdown = SignalSet::new();

        shutdown.add(SIGINT).add(SIGTERM);
        reactor.on_signals(&shutdown, |info| {
            info!(
                "received signal {} from process {}, shutting down",
                info.signal(),
                info.sender()
            );

            if let Some(reactor) = Reactor::current() {
                reactor.cancel_all();
            }
        })?;

        reactor.on_signal(SIGHUP, |_| logger::reload())?;
        reactor.register_fd(&listener)?;
        info!("listening on {}", self.address);
        reactor.start_coroutine(move || accept_loop(listener, timeout));
        reactor.run();
        info!("stopped");
        Ok(())
    }
}

fn listen(address: SocketAddr) -> Result<Socket> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, None)?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;
    socket.listen(BACKLOG)?;
    Ok(socket)
}

fn accept_loop(listener: Socket, timeout: Option<Duration>) {
    let Some(reactor) = Reactor::current() else { return };

    loop {
        match reactor.accept(&listener, Deadline::NEVER) {
            Ok((client, address)) => {
                let peer = address
                    .as_socket()
                    .map_or_else(|| "a client".to_string(), |a| a.to_string());

                reactor.start_coroutine(move || echo(client, peer, timeout));
            }
            Err(Error::Canceled) => break,
            Err(err) => {
                error!("failed to accept a connection: {}", err);

                if reactor.sleep(ACCEPT_BACKOFF).is_err() {
                    break;
                }
            }
        }
    }

    reactor.close_fd(&listener);
    debug!("no longer accepting connections");
}

fn echo(client: OwnedFd, peer: String, timeout: Option<Duration>) {
    let Some(reactor) = Reactor::current() else { return };

    if let Err(err) = reactor.register_fd(&client) {
        error!("failed to register the connection with {}: {}", peer, err);
        return;
    }

    info!("{} connected", peer);

    let mut buf = vec![0_u8; BUFFER_SIZE];
    let result = loop {
        let deadline = timeout.map_or(Deadline::NEVER, Deadline::after);
        let read = match reactor.read(&client, &mut buf, deadline) {
            Ok(0) => break Ok(()),
            Ok(read) => read,
            Err(err) => break Err(err),
        };

        if let Err(err) = reactor.write_all(&client, &buf[..read], deadline) {
            break Err(err);
        }
    };

    match result {
        Ok(()) => info!("{} disconnected", peer),
        Err(Error::TimedOut) => info!("{} was idle for too long", peer),
        Err(Error::Canceled) => debug!("closing the connection with {}", peer),
        Err(err) => warn!("the connection with {} failed: {}", peer, err),
    }

    reactor.close_fd(&client);
}
