//! Server driver.
//!
//! Binds the listening socket, builds the configured engine and runs the
//! accept loop for engines that leave accepting to the driver. Every exit
//! path goes through the same teardown: token set, engine cleanup, listener
//! closed.

use crate::acceptor::{AcceptError, Acceptor};
use crate::config::{Config, ConfigError};
use crate::runtime::{AcceptMode, Engine, EngineError};
use crate::shutdown::ShutdownToken;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Startup and engine-fatal failures.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Resolve(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to listen: {0}")]
    Listen(#[source] io::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// What a finished run looked like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeSummary {
    /// Connections accepted over the server's lifetime.
    pub accepted: u64,
    /// True if the run ended because the shutdown token was set.
    pub signalled: bool,
}

/// Create a listening socket with address reuse enabled.
///
/// The socket is non-blocking so every accept loop can observe the
/// shutdown token.
pub fn create_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener, ServeError> {
    let domain = match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
        .map_err(ServeError::Listen)?;

    socket.set_reuse_address(true).map_err(ServeError::Listen)?;
    socket.set_nonblocking(true).map_err(ServeError::Listen)?;
    socket
        .bind(&addr.into())
        .map_err(|source| ServeError::Bind { addr, source })?;
    let backlog = backlog.min(i32::MAX as u32) as i32;
    socket.listen(backlog).map_err(ServeError::Listen)?;

    Ok(socket.into())
}

/// Bind the configured address and serve until shutdown.
pub fn serve(config: &Config, token: ShutdownToken) -> Result<ServeSummary, ServeError> {
    let addr = config.socket_addr()?;
    let listener = create_listener(addr, config.listen_backlog)?;
    serve_on(listener, config, token)
}

/// Serve on an already-bound listener until shutdown or an engine-fatal
/// error.
pub fn serve_on(
    listener: TcpListener,
    config: &Config,
    token: ShutdownToken,
) -> Result<ServeSummary, ServeError> {
    let mut acceptor =
        Acceptor::new(listener, config.max_message_len).map_err(ServeError::Listen)?;
    let settings = config.engine_settings();
    let mut engine = Engine::new(config.engine, &settings, token.clone());

    info!(
        addr = %acceptor.local_addr(),
        engine = ?engine.kind(),
        max_message_len = config.max_message_len,
        "Server listening"
    );

    let mode = match engine.init(&acceptor) {
        Ok(mode) => mode,
        Err(e) => {
            token.request_shutdown();
            engine.cleanup();
            acceptor.shutdown();
            return Err(e.into());
        }
    };

    let result = match mode {
        AcceptMode::Driver => accept_loop(&mut acceptor, &mut engine, &token, settings.poll_interval),
        AcceptMode::Engine => engine.run(&mut acceptor),
    };

    let signalled = token.is_shutdown();
    if result.is_err() {
        token.request_shutdown();
    }
    engine.cleanup();
    acceptor.shutdown();

    let summary = ServeSummary {
        accepted: acceptor.accepted(),
        signalled,
    };
    info!(
        accepted = summary.accepted,
        signalled = summary.signalled,
        "Server stopped"
    );

    result?;
    Ok(summary)
}

/// Accept loop for engines that take connections through `add_client`.
fn accept_loop(
    acceptor: &mut Acceptor,
    engine: &mut Engine,
    token: &ShutdownToken,
    interval: Duration,
) -> Result<(), EngineError> {
    while !token.is_shutdown() {
        if !acceptor.wait_ready(interval).map_err(EngineError::Wait)? {
            continue;
        }

        loop {
            match acceptor.accept_one() {
                Ok(conn) => {
                    debug!(peer = %conn.peer(), "Accepted connection");
                    engine.add_client(conn)?;
                }
                Err(AcceptError::Unavailable) => break,
                Err(AcceptError::Fatal(e)) => return Err(EngineError::Accept(e)),
            }
        }
    }
    debug!("Accept loop observed shutdown");
    Ok(())
}
