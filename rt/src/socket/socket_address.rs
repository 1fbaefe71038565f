use socket2::{Domain, SockAddr};

/// Returns a description of `sockaddr` suitable for log messages.
///
/// IP addresses are formatted along with their port, UNIX sockets using their
/// path.
pub(crate) fn describe(sockaddr: &SockAddr) -> String {
    if let Some(addr) = sockaddr.as_socket() {
        return addr.to_string();
    }

    if sockaddr.domain() == Domain::UNIX {
        // Abstract and unnamed sockets don't have a path.
        return sockaddr
            .as_pathname()
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_else(|| "an unnamed UNIX socket".to_string());
    }

    format!("an address of family {}", sockaddr.family())
}
