//! Listening-socket owner.
//!
//! The driver binds and listens; the acceptor takes the listener from there,
//! switches it to non-blocking mode so every accept loop can observe the
//! shutdown token, and turns pending peers into [`Connection`]s.

use crate::runtime::Connection;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Accept failures.
#[derive(Debug, Error)]
pub enum AcceptError {
    /// Nothing to accept right now (would block, interrupted, or the peer
    /// gave up before the handshake finished). Retry later.
    #[error("no connection available")]
    Unavailable,
    /// The listener is unusable; the accept loop must stop.
    #[error("accept failed: {0}")]
    Fatal(#[source] io::Error),
}

/// Owns the listening socket.
#[derive(Debug)]
pub struct Acceptor {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    max_message_len: usize,
    accepted: u64,
}

impl Acceptor {
    /// Take ownership of a bound, listening socket.
    ///
    /// Connections produced by this acceptor reject messages longer than
    /// `max_message_len`.
    pub fn new(listener: TcpListener, max_message_len: usize) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: Some(listener),
            local_addr,
            max_message_len,
            accepted: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Descriptor of the listening socket, or `None` after shutdown.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|l| l.as_raw_fd())
    }

    /// Total connections handed out.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn is_closed(&self) -> bool {
        self.listener.is_none()
    }

    /// Accept one pending connection without blocking.
    pub fn accept_one(&mut self) -> Result<Connection, AcceptError> {
        let listener = self.listener.as_ref().ok_or_else(|| {
            AcceptError::Fatal(io::Error::new(
                io::ErrorKind::NotConnected,
                "listener closed",
            ))
        })?;

        match listener.accept() {
            Ok((stream, peer)) => {
                self.accepted += 1;
                Ok(Connection::new(stream, peer, self.max_message_len))
            }
            Err(e) if is_retryable(&e) => Err(AcceptError::Unavailable),
            Err(e) => Err(AcceptError::Fatal(e)),
        }
    }

    /// Wait up to `timeout` for a pending connection.
    ///
    /// Returns `Ok(false)` on timeout, on interruption by a signal, or when
    /// the listener is already closed.
    pub fn wait_ready(&self, timeout: Duration) -> io::Result<bool> {
        let Some(fd) = self.raw_fd() else {
            return Ok(false);
        };

        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: `pfd` is a valid pollfd for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(rc > 0)
    }

    /// Close the listening socket. Returns `true` only for the call that
    /// actually closed it.
    pub fn shutdown(&mut self) -> bool {
        match self.listener.take() {
            Some(listener) => {
                drop(listener);
                debug!(addr = %self.local_addr, accepted = self.accepted, "Listener closed");
                true
            }
            None => false,
        }
    }
}

fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::time::Instant;

    pub(crate) fn local_acceptor(max_message_len: usize) -> Acceptor {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        Acceptor::new(listener, max_message_len).unwrap()
    }

    /// Accept the next connection, waiting up to a few seconds.
    pub(crate) fn accept_within(acceptor: &mut Acceptor) -> Connection {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if !acceptor.wait_ready(Duration::from_millis(50)).unwrap() {
                continue;
            }
            match acceptor.accept_one() {
                Ok(conn) => return conn,
                Err(AcceptError::Unavailable) => continue,
                Err(e) => panic!("accept failed: {e}"),
            }
        }
        panic!("no connection accepted");
    }

    #[test]
    fn test_accept_without_peer_is_unavailable() {
        let mut acceptor = local_acceptor(64);
        assert!(matches!(
            acceptor.accept_one(),
            Err(AcceptError::Unavailable)
        ));
        assert!(!acceptor.wait_ready(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_accept_reports_peer() {
        let mut acceptor = local_acceptor(64);
        let client = TcpStream::connect(acceptor.local_addr()).unwrap();

        let conn = accept_within(&mut acceptor);
        assert_eq!(conn.peer(), client.local_addr().unwrap());
        assert_eq!(acceptor.accepted(), 1);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut acceptor = local_acceptor(64);
        assert!(acceptor.raw_fd().is_some());

        assert!(acceptor.shutdown());
        assert!(!acceptor.shutdown());
        assert!(acceptor.is_closed());
        assert!(acceptor.raw_fd().is_none());

        assert!(matches!(acceptor.accept_one(), Err(AcceptError::Fatal(_))));
        assert!(!acceptor.wait_ready(Duration::from_millis(1)).unwrap());
    }
}
