//! Accepted client connections.
//!
//! A connection couples a socket with its peer address and its framing
//! state. Exactly one engine entity owns a connection at a time; dropping it
//! closes the socket and releases the payload buffer.

use crate::runtime::framing::{FrameError, Framer, Progress};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use tracing::debug;

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    stream: S,
    peer: SocketAddr,
    framer: Framer,
}

impl Connection<TcpStream> {
    /// Wrap a freshly accepted socket.
    pub fn new(stream: TcpStream, peer: SocketAddr, max_message_len: usize) -> Self {
        Self {
            stream,
            peer,
            framer: Framer::new(max_message_len),
        }
    }

    /// Switch to non-blocking mode and hand the socket to mio.
    pub fn into_mio(self) -> io::Result<Connection<mio::net::TcpStream>> {
        self.stream.set_nonblocking(true)?;
        Ok(Connection {
            stream: mio::net::TcpStream::from_std(self.stream),
            peer: self.peer,
            framer: self.framer,
        })
    }
}

impl<S> Connection<S> {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn framer(&self) -> &Framer {
        &self.framer
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Log the close at debug level with per-connection counters.
    pub fn log_close(&self, conn_id: usize, reason: &dyn fmt::Display) {
        debug!(
            conn_id,
            peer = %self.peer,
            messages = self.framer.messages(),
            bytes = self.framer.transferred(),
            reason = %reason,
            "Connection closed"
        );
    }
}

impl<S: Read + Write> Connection<S> {
    /// Run the framing state machine against this connection's socket.
    pub fn drive(&mut self) -> Result<Progress, FrameError> {
        self.framer.advance(&mut self.stream)
    }

    /// Run the state machine up to the end of the current message.
    pub fn drive_message(&mut self) -> Result<Progress, FrameError> {
        self.framer.advance_message(&mut self.stream)
    }
}
