/*!
 * Connection
 *
 * An accepted socket plus its peer and local addresses and the protocol
 * tag inherited from the listener. Owned by the acceptor until it enters
 * the queue, then by exactly one worker until close.
 */

use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use log::debug;
use socket2::Socket;

use crate::core::types::Protocol;

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    proto: Protocol,
}

impl Connection {
    #[must_use]
    pub fn new(stream: TcpStream, peer: SocketAddr, local: SocketAddr, proto: Protocol) -> Self {
        Self {
            stream,
            peer,
            local,
            proto,
        }
    }

    #[inline]
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[inline]
    #[must_use]
    pub fn local(&self) -> SocketAddr {
        self.local
    }

    #[inline]
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.proto
    }

    #[inline]
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    #[inline]
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Block up to `timeout` for the peer to send more data. Returns true
    /// when a read would not block, which is how the keep-alive loop peeks
    /// for a pipelined request.
    #[must_use]
    pub fn wait_readable(&self, timeout: Duration) -> bool {
        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
        use std::os::fd::AsFd;

        let mut fds = [PollFd::new(self.stream.as_fd(), PollFlags::POLLIN)];
        let millis = timeout.as_millis().min(u16::MAX as u128) as u16;
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(n) if n > 0 => fds[0]
                .revents()
                .map(|r| r.contains(PollFlags::POLLIN))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Abortive close: linger zero makes the kernel reset instead of
    /// draining, used on errors and immediate termination.
    pub fn hard_close(self) {
        let sock = Socket::from(self.stream);
        let _ = sock.set_linger(Some(Duration::from_secs(0)));
        debug!("hard-closing connection from {}", self.peer);
    }

    /// Orderly close: give the kernel up to `linger` to flush.
    pub fn linger_close(self, linger: Duration) {
        let sock = Socket::from(self.stream);
        let _ = sock.set_linger(Some(linger));
        debug!("linger-closing connection from {}", self.peer);
    }
}
