//! Single-threaded `select(2)` engine.
//!
//! Every iteration rebuilds the interest sets from scratch: the listener
//! and every connection go in the read set, connections with a partially
//! written echo also go in the write set. The wait is bounded by the poll
//! interval so the shutdown token is checked at least that often.
//!
//! Descriptors at or above `FD_SETSIZE` cannot be represented in an
//! `fd_set`; such connections are refused at `add_client`.

use crate::acceptor::{AcceptError, Acceptor};
use crate::runtime::{Connection, EngineError, EngineSettings, Progress};
use crate::shutdown::ShutdownToken;
use slab::Slab;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Owned `fd_set`.
struct FdSet(libc::fd_set);

impl FdSet {
    fn new() -> Self {
        // SAFETY: fd_set is plain data; FD_ZERO puts it in a defined state.
        let mut raw: libc::fd_set = unsafe { mem::zeroed() };
        unsafe { libc::FD_ZERO(&mut raw) };
        Self(raw)
    }

    fn fits(fd: RawFd) -> bool {
        fd >= 0 && (fd as usize) < libc::FD_SETSIZE as usize
    }

    fn insert(&mut self, fd: RawFd) {
        debug_assert!(Self::fits(fd));
        // SAFETY: `fd` is within FD_SETSIZE.
        unsafe { libc::FD_SET(fd, &mut self.0) };
    }

    fn contains(&self, fd: RawFd) -> bool {
        // SAFETY: `fd` is within FD_SETSIZE.
        Self::fits(fd) && unsafe { libc::FD_ISSET(fd, &self.0) }
    }

    fn as_mut_ptr(&mut self) -> *mut libc::fd_set {
        &mut self.0
    }
}

fn timeval(interval: Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: interval.as_secs() as libc::time_t,
        tv_usec: interval.subsec_micros() as libc::suseconds_t,
    }
}

pub struct SelectEngine {
    token: ShutdownToken,
    poll_interval: Duration,
    max_connections: usize,
    connections: Slab<Connection>,
    /// Scratch list of connection ids ready this iteration.
    ready: Vec<usize>,
}

impl SelectEngine {
    pub fn new(settings: &EngineSettings, token: ShutdownToken) -> Self {
        let max_connections = settings.max_connections.min(libc::FD_SETSIZE as usize);
        Self {
            token,
            poll_interval: settings.poll_interval,
            max_connections,
            connections: Slab::with_capacity(max_connections.min(1024)),
            ready: Vec::new(),
        }
    }

    pub fn init(&mut self, acceptor: &Acceptor) -> Result<(), EngineError> {
        match acceptor.raw_fd() {
            Some(fd) if FdSet::fits(fd) => {}
            Some(fd) => {
                return Err(EngineError::Init(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("listener descriptor {fd} exceeds FD_SETSIZE"),
                )))
            }
            None => {
                return Err(EngineError::Init(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "listener closed",
                )))
            }
        }

        info!(
            max_connections = self.max_connections,
            interval_ms = self.poll_interval.as_millis() as u64,
            "Select engine ready"
        );
        Ok(())
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Track a freshly accepted connection.
    pub fn add_client(&mut self, conn: Connection) -> Result<(), EngineError> {
        if self.connections.len() >= self.max_connections {
            warn!(peer = %conn.peer(), limit = self.max_connections, "Connection limit reached, closing");
            return Ok(());
        }

        let fd = conn.stream().as_raw_fd();
        if !FdSet::fits(fd) {
            warn!(peer = %conn.peer(), fd, "Descriptor exceeds FD_SETSIZE, closing");
            return Ok(());
        }

        if let Err(e) = conn.stream().set_nonblocking(true) {
            conn.log_close(usize::MAX, &e);
            return Ok(());
        }

        let id = self.connections.insert(conn);
        trace!(conn_id = id, fd, "Connection added");
        Ok(())
    }

    /// Accept/dispatch loop. Returns once the token is set or the listener
    /// is closed.
    pub fn run(&mut self, acceptor: &mut Acceptor) -> Result<(), EngineError> {
        loop {
            if self.token.is_shutdown() {
                debug!("Select loop observed shutdown");
                return Ok(());
            }
            let Some(listener_fd) = acceptor.raw_fd() else {
                return Ok(());
            };

            let mut read_set = FdSet::new();
            let mut write_set = FdSet::new();
            read_set.insert(listener_fd);
            let mut max_fd = listener_fd;
            for (_, conn) in self.connections.iter() {
                let fd = conn.stream().as_raw_fd();
                read_set.insert(fd);
                if conn.framer().wants_write() {
                    write_set.insert(fd);
                }
                max_fd = max_fd.max(fd);
            }

            let mut tv = timeval(self.poll_interval);
            // SAFETY: both sets and the timeval outlive the call; every
            // descriptor inserted is below FD_SETSIZE.
            let rc = unsafe {
                libc::select(
                    max_fd + 1,
                    read_set.as_mut_ptr(),
                    write_set.as_mut_ptr(),
                    std::ptr::null_mut(),
                    &mut tv,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(EngineError::Wait(err));
            }
            if rc == 0 {
                continue;
            }

            if read_set.contains(listener_fd) {
                self.accept_pending(acceptor)?;
            }

            let mut ready = mem::take(&mut self.ready);
            ready.clear();
            ready.extend(self.connections.iter().filter_map(|(id, conn)| {
                let fd = conn.stream().as_raw_fd();
                (read_set.contains(fd) || write_set.contains(fd)).then_some(id)
            }));
            for &id in &ready {
                self.dispatch(id);
            }
            self.ready = ready;
        }
    }

    /// Accept until the listener has nothing more pending.
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
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };

        match conn.drive() {
            Ok(Progress::Pending | Progress::Echoed) => {}
            Ok(Progress::Closed) => {
                let conn = self.connections.remove(id);
                conn.log_close(id, &"session ended");
            }
            Err(e) => {
                let conn = self.connections.remove(id);
                conn.log_close(id, &e);
            }
        }
    }

    /// Close every remaining connection.
    pub fn cleanup(&mut self) {
        let ids: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
        for &id in &ids {
            let conn = self.connections.remove(id);
            conn.log_close(id, &"shutdown");
        }
        info!(closed = ids.len(), "Select engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceptor::tests::{accept_within, local_acceptor};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;
    use std::time::Instant;

    fn settings() -> EngineSettings {
        EngineSettings {
            poll_interval: Duration::from_millis(20),
            ..EngineSettings::default()
        }
    }

    fn spawn_engine(
        max_message_len: usize,
        settings: EngineSettings,
    ) -> (
        std::net::SocketAddr,
        ShutdownToken,
        thread::JoinHandle<Result<(), EngineError>>,
    ) {
        let mut acceptor = local_acceptor(max_message_len);
        let addr = acceptor.local_addr();
        let token = ShutdownToken::new();
        let mut engine = SelectEngine::new(&settings, token.clone());
        engine.init(&acceptor).unwrap();

        let handle = thread::spawn(move || {
            let result = engine.run(&mut acceptor);
            engine.cleanup();
            result
        });
        (addr, token, handle)
    }

    fn client(addr: std::net::SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    #[test]
    fn test_fd_set_membership() {
        let mut set = FdSet::new();
        assert!(!set.contains(3));
        set.insert(3);
        assert!(set.contains(3));
        assert!(!set.contains(4));
        assert!(!FdSet::fits(-1));
        assert!(!FdSet::fits(libc::FD_SETSIZE as RawFd));
    }

    #[test]
    fn test_echoes_interleaved_clients() {
        let (addr, token, handle) = spawn_engine(1024, settings());

        let mut a = client(addr);
        let mut b = client(addr);

        // Split b's prefix so the engine sees a partial frame while serving a.
        b.write_all(&[0, 0]).unwrap();
        a.write_all(&3u32.to_be_bytes()).unwrap();
        a.write_all(b"abc").unwrap();
        b.write_all(&[0, 2]).unwrap();
        b.write_all(b"xy").unwrap();

        let mut buf = [0u8; 3];
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        let mut buf = [0u8; 2];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"xy");

        token.request_shutdown();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_oversized_prefix_closes_only_that_connection() {
        let (addr, token, handle) = spawn_engine(8, settings());

        let mut bad = client(addr);
        let mut good = client(addr);

        bad.write_all(&9u32.to_be_bytes()).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(bad.read(&mut buf).unwrap_or(0), 0);

        good.write_all(&2u32.to_be_bytes()).unwrap();
        good.write_all(b"ok").unwrap();
        let mut buf = [0u8; 2];
        good.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ok");

        token.request_shutdown();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_connection_limit_closes_extra_clients() {
        let (addr, token, handle) = spawn_engine(
            64,
            EngineSettings {
                max_connections: 1,
                ..settings()
            },
        );

        let mut first = client(addr);
        first.write_all(&1u32.to_be_bytes()).unwrap();
        first.write_all(b"1").unwrap();
        let mut buf = [0u8; 1];
        first.read_exact(&mut buf).unwrap();

        let mut second = client(addr);
        assert_eq!(second.read(&mut buf).unwrap_or(0), 0);

        token.request_shutdown();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_shutdown_closes_open_connections() {
        let (addr, token, handle) = spawn_engine(64, settings());

        let mut idle = client(addr);
        idle.write_all(&1u32.to_be_bytes()).unwrap();
        idle.write_all(b"z").unwrap();
        let mut buf = [0u8; 1];
        idle.read_exact(&mut buf).unwrap();

        token.request_shutdown();
        handle.join().unwrap().unwrap();
        assert_eq!(idle.read(&mut buf).unwrap_or(0), 0);
    }

    #[test]
    fn test_zero_prefix_releases_connection() {
        let mut acceptor = local_acceptor(64);
        let mut engine = SelectEngine::new(&settings(), ShutdownToken::new());
        engine.init(&acceptor).unwrap();

        let mut stream = client(acceptor.local_addr());
        let conn = accept_within(&mut acceptor);
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

    #[test]
    fn test_large_message_resumes_on_write_readiness() {
        let (addr, token, handle) = spawn_engine(16 << 20, settings());

        // Larger than the loopback send and receive buffers combined.
        let payload: Vec<u8> = (0..8 << 20).map(|i| (i % 241) as u8).collect();
        let mut stream = client(addr);
        stream.write_all(&(payload.len() as u32).to_be_bytes()).unwrap();
        stream.write_all(&payload).unwrap();

        // Nothing is read yet, so the echo stalls on a full send buffer and
        // can only finish through write readiness.
        thread::sleep(Duration::from_millis(100));

        let mut echo = vec![0u8; payload.len()];
        stream.read_exact(&mut echo).unwrap();
        assert!(echo == payload);

        token.request_shutdown();
        handle.join().unwrap().unwrap();
    }
}
