//! Client side of the echo protocol and the load generator built on it.
//!
//! Each request is `<u32 big-endian length><payload>`; the server answers
//! with the payload alone. A zero length ends the session.

use bytes::{BufMut, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, trace};

/// Session failures seen by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("echo mismatch at byte {offset}")]
    Mismatch { offset: usize },
    #[error("echo length {got} does not match request length {expected}")]
    Length { expected: usize, got: usize },
}

/// Write one length-prefixed message.
///
/// Empty payloads are refused: a zero length is the session terminator,
/// sent by [`finish`].
pub async fn send_message<W>(stream: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty payload would end the session",
        ));
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload exceeds u32 length"))?;

    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(len);
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await?;
    stream.flush().await
}

/// Read exactly `len` echoed bytes.
pub async fn recv_echo<R>(stream: &mut R, len: usize) -> io::Result<BytesMut>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::zeroed(len);
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Send `payload` and wait for its echo.
pub async fn exchange<S>(stream: &mut S, payload: &[u8]) -> io::Result<BytesMut>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_message(stream, payload).await?;
    recv_echo(stream, payload.len()).await
}

/// Send the zero-length terminator.
pub async fn finish<W>(stream: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&0u32.to_be_bytes()).await?;
    stream.flush().await
}

/// Byte-for-byte comparison of a request and its echo.
pub fn verify_echo(expected: &[u8], got: &[u8]) -> Result<(), ClientError> {
    if expected.len() != got.len() {
        return Err(ClientError::Length {
            expected: expected.len(),
            got: got.len(),
        });
    }
    match expected.iter().zip(got).position(|(a, b)| a != b) {
        Some(offset) => Err(ClientError::Mismatch { offset }),
        None => Ok(()),
    }
}

/// Deterministic payload for request `seq` on connection `conn`.
///
/// Content differs per connection and per request so a misrouted echo is
/// caught by [`verify_echo`].
pub fn payload(conn: usize, seq: usize, size: usize) -> Vec<u8> {
    let seed = conn.wrapping_mul(31).wrapping_add(seq.wrapping_mul(7));
    (0..size)
        .map(|i| (seed.wrapping_add(i) % 251) as u8)
        .collect()
}

/// Load generator parameters.
#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub addr: SocketAddr,
    /// Concurrent connections.
    pub clients: usize,
    /// Messages per connection.
    pub requests: usize,
    /// Payload size in bytes.
    pub size: usize,
}

/// Totals across every connection of a load run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub succeeded: usize,
    pub failed: usize,
    pub requests: u64,
    pub bytes_received: u64,
    pub total_latency: Duration,
}

impl LoadReport {
    /// Mean round-trip time per completed request.
    pub fn mean_latency(&self) -> Option<Duration> {
        if self.requests == 0 {
            return None;
        }
        let requests = u32::try_from(self.requests).unwrap_or(u32::MAX);
        Some(self.total_latency / requests)
    }
}

#[derive(Debug, Default)]
struct SessionStats {
    requests: u64,
    bytes_received: u64,
    latency: Duration,
}

/// Run one connection's worth of requests.
async fn run_session(conn: usize, config: &LoadConfig) -> Result<SessionStats, ClientError> {
    let mut stream = TcpStream::connect(config.addr).await?;
    stream.set_nodelay(true)?;

    let mut stats = SessionStats::default();
    for seq in 0..config.requests {
        let request = payload(conn, seq, config.size);
        let start = Instant::now();
        let echo = exchange(&mut stream, &request).await?;
        stats.latency += start.elapsed();

        verify_echo(&request, &echo)?;
        stats.requests += 1;
        stats.bytes_received += echo.len() as u64;
        trace!(conn, seq, "Echo verified");
    }

    finish(&mut stream).await?;
    Ok(stats)
}

/// Open `clients` concurrent connections and drive `requests` echoes on
/// each.
pub async fn run_load(config: LoadConfig) -> LoadReport {
    let config = std::sync::Arc::new(config);
    let mut sessions = JoinSet::new();
    for conn in 0..config.clients {
        let config = std::sync::Arc::clone(&config);
        sessions.spawn(async move { (conn, run_session(conn, &config).await) });
    }

    let mut report = LoadReport::default();
    while let Some(joined) = sessions.join_next().await {
        match joined {
            Ok((_, Ok(stats))) => {
                report.succeeded += 1;
                report.requests += stats.requests;
                report.bytes_received += stats.bytes_received;
                report.total_latency += stats.latency;
            }
            Ok((conn, Err(e))) => {
                debug!(conn, error = %e, "Session failed");
                report.failed += 1;
            }
            Err(e) => {
                debug!(error = %e, "Session task aborted");
                report.failed += 1;
            }
        }
    }
    report
}
