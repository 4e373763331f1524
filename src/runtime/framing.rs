//! Length-prefixed echo framing.
//!
//! Wire format, identical in both directions:
//!
//! ```text
//! <u32 big-endian length><length bytes of payload>
//! ```
//!
//! The server echoes each payload back without a prefix. A zero length ends
//! the session.
//!
//! `Framer` is an incremental state machine: `advance` consumes whatever the
//! stream yields without blocking and remembers exactly where it stopped, so
//! the same code serves blocking worker threads (where "would block" means a
//! read timeout expired) and non-blocking event loops.

use std::io::{self, Read, Write};
use thiserror::Error;
use tracing::trace;

/// Size of the length prefix in bytes.
pub const PREFIX_LEN: usize = 4;

/// Where a connection is in the message cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Collecting the length prefix.
    ReadingLength {
        /// Prefix bytes collected so far.
        have: usize,
    },
    /// Collecting the payload.
    ReadingBody {
        /// Payload bytes collected so far.
        filled: usize,
    },
    /// Writing the payload back.
    Echoing {
        /// Payload bytes sent so far.
        written: usize,
    },
    /// Peer sent a zero-length prefix.
    Closed,
}

/// Outcome of one `advance` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Stream would block; resume on the next readiness event.
    Pending,
    /// One echo finished and the framer is back at a message boundary.
    /// Only returned by [`Framer::advance_message`].
    Echoed,
    /// Session ended cleanly; the engine should close the connection.
    Closed,
}

/// Connection-fatal framing errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("message length {len} exceeds limit {max}")]
    MessageTooLarge { len: usize, max: usize },
    #[error("write returned zero bytes")]
    WriteZero,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Per-connection decoder/encoder.
#[derive(Debug)]
pub struct Framer {
    state: FrameState,
    prefix: [u8; PREFIX_LEN],
    msg_len: usize,
    /// Payload buffer, reused across messages.
    buf: Vec<u8>,
    max_message_len: usize,
    messages: u64,
    transferred: u64,
}

impl Framer {
    /// Create a framer that rejects payloads longer than `max_message_len`.
    pub fn new(max_message_len: usize) -> Self {
        Self {
            state: FrameState::ReadingLength { have: 0 },
            prefix: [0; PREFIX_LEN],
            msg_len: 0,
            buf: Vec::new(),
            max_message_len,
            messages: 0,
            transferred: 0,
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// True while an echo is partially written.
    pub fn wants_write(&self) -> bool {
        matches!(self.state, FrameState::Echoing { .. })
    }

    /// Decoded length of the current message (0 before a prefix completes).
    pub fn message_len(&self) -> usize {
        self.msg_len
    }

    /// Completed echoes.
    pub fn messages(&self) -> u64 {
        self.messages
    }

    /// Bytes read plus bytes written.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Allocated payload capacity. Never exceeds the message limit.
    pub fn buffer_capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Drive the state machine until the stream would block or the session
    /// ends.
    pub fn advance<S: Read + Write>(&mut self, stream: &mut S) -> Result<Progress, FrameError> {
        loop {
            match self.advance_message(stream)? {
                Progress::Echoed => continue,
                progress => return Ok(progress),
            }
        }
    }

    /// Like [`advance`](Self::advance), but stops after each completed echo
    /// so a blocking caller gets a chance to look around between messages.
    pub fn advance_message<S: Read + Write>(
        &mut self,
        stream: &mut S,
    ) -> Result<Progress, FrameError> {
        loop {
            match self.state {
                FrameState::ReadingLength { have } => {
                    let n = match read_some(stream, &mut self.prefix[have..])? {
                        Some(n) => n,
                        None => return Ok(Progress::Pending),
                    };
                    self.transferred += n as u64;

                    let have = have + n;
                    if have < PREFIX_LEN {
                        self.state = FrameState::ReadingLength { have };
                        continue;
                    }

                    self.begin_message(u32::from_be_bytes(self.prefix) as usize)?;
                    if self.state == FrameState::Closed {
                        return Ok(Progress::Closed);
                    }
                }
                FrameState::ReadingBody { filled } => {
                    let n = match read_some(stream, &mut self.buf[filled..self.msg_len])? {
                        Some(n) => n,
                        None => return Ok(Progress::Pending),
                    };
                    self.transferred += n as u64;

                    let filled = filled + n;
                    self.state = if filled == self.msg_len {
                        FrameState::Echoing { written: 0 }
                    } else {
                        FrameState::ReadingBody { filled }
                    };
                }
                FrameState::Echoing { written } => {
                    let n = match write_some(stream, &self.buf[written..self.msg_len])? {
                        Some(n) => n,
                        None => return Ok(Progress::Pending),
                    };
                    self.transferred += n as u64;

                    let written = written + n;
                    if written == self.msg_len {
                        self.messages += 1;
                        trace!(len = self.msg_len, "Echo complete");
                        self.msg_len = 0;
                        self.state = FrameState::ReadingLength { have: 0 };
                        return Ok(Progress::Echoed);
                    } else {
                        self.state = FrameState::Echoing { written };
                    }
                }
                FrameState::Closed => return Ok(Progress::Closed),
            }
        }
    }

    fn begin_message(&mut self, len: usize) -> Result<(), FrameError> {
        if len == 0 {
            self.state = FrameState::Closed;
            return Ok(());
        }
        if len > self.max_message_len {
            return Err(FrameError::MessageTooLarge {
                len,
                max: self.max_message_len,
            });
        }

        // Grow exactly to the message size so capacity stays within the limit.
        self.buf.clear();
        if self.buf.capacity() < len {
            self.buf.reserve_exact(len);
        }
        self.buf.resize(len, 0);

        self.msg_len = len;
        self.state = FrameState::ReadingBody { filled: 0 };
        Ok(())
    }
}

/// `TimedOut` shows up on blocking sockets with a read timeout on some
/// platforms; it means the same as `WouldBlock` here.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn read_some<S: Read>(stream: &mut S, buf: &mut [u8]) -> Result<Option<usize>, FrameError> {
    loop {
        match stream.read(buf) {
            Ok(0) => return Err(FrameError::PeerClosed),
            Ok(n) => return Ok(Some(n)),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e) if is_transient(e) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
}

fn write_some<S: Write>(stream: &mut S, buf: &[u8]) -> Result<Option<usize>, FrameError> {
    loop {
        match stream.write(buf) {
            Ok(0) => return Err(FrameError::WriteZero),
            Ok(n) => return Ok(Some(n)),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e) if is_transient(e) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
}
