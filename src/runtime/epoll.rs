//! Single-threaded readiness engine on mio (epoll on Linux, kqueue on
//! macOS).
//!
//! Notifications are edge-triggered, so every handler runs until the socket
//! would block: the listener is drained of pending accepts and each
//! connection is driven until its framer reports `Pending`. Connections are
//! registered for both directions once and never re-registered; the framer
//! state decides whether a wakeup reads or writes.

use crate::acceptor::{AcceptError, Acceptor};
use crate::runtime::{Connection, EngineError, EngineSettings, Progress};
use crate::shutdown::ShutdownToken;
use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

pub struct EpollEngine {
    token: ShutdownToken,
    poll_interval: Duration,
    max_connections: usize,
    poll: Option<Poll>,
    events: Events,
    listener_fd: Option<RawFd>,
    connections: Slab<Connection<TcpStream>>,
    /// Scratch list of tokens ready this iteration.
    ready: Vec<Token>,
}

impl EpollEngine {
    pub fn new(settings: &EngineSettings, token: ShutdownToken) -> Self {
        Self {
            token,
            poll_interval: settings.poll_interval,
            max_connections: settings.max_connections,
            poll: None,
            events: Events::with_capacity(settings.event_capacity.max(1)),
            listener_fd: None,
            connections: Slab::with_capacity(settings.max_connections.min(1024)),
            ready: Vec::with_capacity(settings.event_capacity.max(1)),
        }
    }

    /// Create the notification instance and watch the listener.
    pub fn init(&mut self, acceptor: &Acceptor) -> Result<(), EngineError> {
        let fd = acceptor.raw_fd().ok_or_else(|| {
            EngineError::Init(io::Error::new(
                io::ErrorKind::NotConnected,
                "listener closed",
            ))
        })?;

        let poll = Poll::new().map_err(EngineError::Init)?;
        poll.registry()
            .register(&mut SourceFd(&fd), LISTENER_TOKEN, Interest::READABLE)
            .map_err(EngineError::Init)?;

        self.poll = Some(poll);
        self.listener_fd = Some(fd);

        info!(
            max_connections = self.max_connections,
            events = self.events.capacity(),
            "Epoll engine ready"
        );
        Ok(())
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Register a freshly accepted connection.
    pub fn add_client(&mut self, conn: Connection) -> Result<(), EngineError> {
        if self.connections.len() >= self.max_connections {
            warn!(peer = %conn.peer(), limit = self.max_connections, "Connection limit reached, closing");
            return Ok(());
        }

        let Some(poll) = self.poll.as_ref() else {
            return Err(EngineError::Register(io::Error::new(
                io::ErrorKind::NotConnected,
                "engine not initialized",
            )));
        };

        let conn = match conn.into_mio() {
            Ok(conn) => conn,
            Err(e) => {
                debug!(error = %e, "Failed to switch connection to non-blocking");
                return Ok(());
            }
        };

        let entry = self.connections.vacant_entry();
        let id = entry.key();
        let conn = entry.insert(conn);
        if let Err(e) = poll.registry().register(
            conn.stream_mut(),
            Token(id),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            let conn = self.connections.remove(id);
            conn.log_close(id, &e);
            return Ok(());
        }

        trace!(conn_id = id, peer = %self.connections[id].peer(), "Connection registered");
        Ok(())
    }

    /// Accept/dispatch loop. Returns once the token is set or the listener
    /// is closed.
    pub fn run(&mut self, acceptor: &mut Acceptor) -> Result<(), EngineError> {
        loop {
            if self.token.is_shutdown() {
                debug!("Epoll loop observed shutdown");
                return Ok(());
            }
            if acceptor.is_closed() {
                return Ok(());
            }

            let Some(poll) = self.poll.as_mut() else {
                return Ok(());
            };
            match poll.poll(&mut self.events, Some(self.poll_interval)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(EngineError::Wait(e)),
            }

            let mut ready = std::mem::take(&mut self.ready);
            ready.clear();
            ready.extend(self.events.iter().map(|event| event.token()));

            for &token in &ready {
                match token {
                    LISTENER_TOKEN => self.accept_pending(acceptor)?,
                    Token(id) => self.dispatch(id),
                }
            }
            self.ready = ready;
        }
    }

    /// Edge-triggered: accept until the listener would block.
    fn accept_pending(&mut self, acceptor: &mut Acceptor) -> Result<(), EngineError> {
        loop {
            match acceptor.accept_one() {
                Ok(conn) => self.add_client(conn)?,
                Err(AcceptError::Unavailable) => return Ok(()),
                Err(AcceptError::Fatal(e)) => return Err(EngineError::Accept(e)),
            }
        }
    }

    fn dispatch(&mut self, id: usize) {
        // Stale event for a connection closed earlier in this batch.
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };

        match conn.drive() {
            Ok(Progress::Pending | Progress::Echoed) => {}
            Ok(Progress::Closed) => self.close(id, &"session ended"),
            Err(e) => self.close(id, &e),
        }
    }

    fn close(&mut self, id: usize, reason: &dyn std::fmt::Display) {
        if !self.connections.contains(id) {
            return;
        }
        let mut conn = self.connections.remove(id);
        if let Some(poll) = self.poll.as_ref() {
            if let Err(e) = poll.registry().deregister(conn.stream_mut()) {
                trace!(conn_id = id, error = %e, "Deregister failed");
            }
        }
        conn.log_close(id, reason);
    }

    /// Deregister and close everything, then drop the poll instance.
    pub fn cleanup(&mut self) {
        let ids: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
        for &id in &ids {
            self.close(id, &"shutdown");
        }

        if let (Some(poll), Some(fd)) = (self.poll.as_ref(), self.listener_fd.take()) {
            // The listener may already be closed, in which case the kernel
            // dropped the registration with it.
            let _ = poll.registry().deregister(&mut SourceFd(&fd));
        }
        self.poll = None;

        info!(closed = ids.len(), "Epoll engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceptor::tests::local_acceptor;
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpStream as StdStream};
    use std::thread;
    use std::time::Instant;

    fn settings() -> EngineSettings {
        EngineSettings {
            poll_interval: Duration::from_millis(20),
            event_capacity: 16,
            ..EngineSettings::default()
        }
    }

    fn spawn_engine(
        max_message_len: usize,
        settings: EngineSettings,
    ) -> (
        SocketAddr,
        ShutdownToken,
        thread::JoinHandle<Result<(), EngineError>>,
    ) {
        let mut acceptor = local_acceptor(max_message_len);
        let addr = acceptor.local_addr();
        let token = ShutdownToken::new();
        let mut engine = EpollEngine::new(&settings, token.clone());
        engine.init(&acceptor).unwrap();

        let handle = thread::spawn(move || {
            let result = engine.run(&mut acceptor);
            engine.cleanup();
            result
        });
        (addr, token, handle)
    }

    fn client(addr: SocketAddr) -> StdStream {
        let stream = StdStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    #[test]
    fn test_add_client_before_init_fails() {
        let mut acceptor = local_acceptor(64);
        let _peer = StdStream::connect(acceptor.local_addr()).unwrap();
        let conn = crate::acceptor::tests::accept_within(&mut acceptor);

        let mut engine = EpollEngine::new(&settings(), ShutdownToken::new());
        assert!(matches!(
            engine.add_client(conn),
            Err(EngineError::Register(_))
        ));
    }

    #[test]
    fn test_large_message_echoes_across_wakeups() {
        let (addr, token, handle) = spawn_engine(1 << 20, settings());

        let payload: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
        let mut stream = client(addr);
        let mut writer = stream.try_clone().unwrap();
        let len = payload.len();

        // Write on another thread: the echo can fill the socket buffers
        // before the request is fully sent.
        let sender = {
            let payload = payload.clone();
            thread::spawn(move || {
                writer.write_all(&(len as u32).to_be_bytes()).unwrap();
                writer.write_all(&payload).unwrap();
            })
        };

        let mut echo = vec![0u8; len];
        stream.read_exact(&mut echo).unwrap();
        sender.join().unwrap();
        assert!(echo == payload);

        token.request_shutdown();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_zero_prefix_closes_session() {
        let (addr, token, handle) = spawn_engine(64, settings());

        let mut stream = client(addr);
        stream.write_all(&5u32.to_be_bytes()).unwrap();
        stream.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        stream.write_all(&0u32.to_be_bytes()).unwrap();
        let mut rest = Vec::new();
        assert_eq!(stream.read_to_end(&mut rest).unwrap_or(0), 0);

        token.request_shutdown();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_shutdown_with_idle_connections() {
        let (addr, token, handle) = spawn_engine(64, settings());

        let clients: Vec<_> = (0..4).map(|_| client(addr)).collect();
        thread::sleep(Duration::from_millis(50));

        token.request_shutdown();
        handle.join().unwrap().unwrap();

        for mut c in clients {
            let mut buf = [0u8; 1];
            assert_eq!(c.read(&mut buf).unwrap_or(0), 0);
        }
    }

    #[test]
    fn test_zero_prefix_releases_connection() {
        let mut acceptor = local_acceptor(64);
        let mut engine = EpollEngine::new(&settings(), ShutdownToken::new());
        engine.init(&acceptor).unwrap();

        let mut stream = client(acceptor.local_addr());
        let conn = crate::acceptor::tests::accept_within(&mut acceptor);
        engine.add_client(conn).unwrap();
        assert_eq!(engine.connection_count(), 1);

        let id = engine.connections.iter().next().unwrap().0;
        stream.write_all(&0u32.to_be_bytes()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.connection_count() > 0 {
            assert!(Instant::now() < deadline, "connection never closed");
            engine.dispatch(id);
            thread::sleep(Duration::from_millis(5));
        }
        engine.cleanup();
    }
}
