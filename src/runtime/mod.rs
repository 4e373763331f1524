//! Connection-handling engines.
//!
//! Three interchangeable concurrency models drive the same framing state
//! machine:
//! - `ThreadPool`: one reusable blocking worker thread per active connection
//! - `Select`: single thread, `select(2)` readiness polling
//! - `Epoll`: single thread, edge-triggered notification via mio
//!
//! All three share:
//! - `Framer`: incremental length-prefix decoder/echo encoder
//! - `Connection`: socket + peer + framing state
//! - `ShutdownToken`: checked at the top of every loop

mod backlog;
mod connection;
mod epoll;
pub mod framing;
mod registry;
mod select;
mod thread_pool;

pub use backlog::BoundedQueue;
pub use connection::Connection;
pub use epoll::EpollEngine;
pub use framing::{FrameError, FrameState, Framer, Progress};
pub use registry::GrowableArray;
pub use select::SelectEngine;
pub use thread_pool::ThreadPoolEngine;

use crate::acceptor::Acceptor;
use crate::shutdown::ShutdownToken;
use serde::Deserialize;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Concurrency model selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Reusable blocking worker threads
    Thread,
    /// select(2) readiness polling
    Select,
    /// Edge-triggered epoll (kqueue on macOS)
    Epoll,
}

/// What the thread pool does once `max_workers` is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Park the connection in the backlog queue; blocks the acceptor when
    /// the queue is full.
    Queue,
    /// Close the connection immediately.
    Reject,
}

/// Who runs the accept loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptMode {
    /// Driver accepts and calls `add_client`.
    Driver,
    /// Engine polls the listener itself; the driver calls `run`.
    Engine,
}

/// Engine tuning, resolved from configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Workers pre-spawned by the thread pool.
    pub workers: usize,
    /// Pool cap; `None` grows without bound.
    pub max_workers: Option<usize>,
    pub overflow: OverflowPolicy,
    pub backlog_capacity: usize,
    /// Connection cap for the single-threaded engines.
    pub max_connections: usize,
    /// Upper bound on any wait, and therefore on shutdown latency.
    pub poll_interval: Duration,
    /// Events drained per epoll wakeup.
    pub event_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: 200,
            max_workers: Some(10_000),
            overflow: OverflowPolicy::Queue,
            backlog_capacity: 100,
            max_connections: 10_000,
            poll_interval: Duration::from_millis(100),
            event_capacity: 1024,
        }
    }
}

/// Engine-fatal errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine initialization failed: {0}")]
    Init(#[source] io::Error),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("readiness wait failed: {0}")]
    Wait(#[source] io::Error),
    #[error("accept loop failed: {0}")]
    Accept(#[source] io::Error),
    #[error("event registration failed: {0}")]
    Register(#[source] io::Error),
}

/// The live engine. Built once at startup; never switches variant.
pub enum Engine {
    ThreadPool(ThreadPoolEngine),
    Select(SelectEngine),
    Epoll(EpollEngine),
}

impl Engine {
    pub fn new(kind: EngineKind, settings: &EngineSettings, token: ShutdownToken) -> Self {
        match kind {
            EngineKind::Thread => Engine::ThreadPool(ThreadPoolEngine::new(settings, token)),
            EngineKind::Select => Engine::Select(SelectEngine::new(settings, token)),
            EngineKind::Epoll => Engine::Epoll(EpollEngine::new(settings, token)),
        }
    }

    pub fn kind(&self) -> EngineKind {
        match self {
            Engine::ThreadPool(_) => EngineKind::Thread,
            Engine::Select(_) => EngineKind::Select,
            Engine::Epoll(_) => EngineKind::Epoll,
        }
    }

    /// Set up private state and report who owns the accept loop.
    pub fn init(&mut self, acceptor: &Acceptor) -> Result<AcceptMode, EngineError> {
        match self {
            Engine::ThreadPool(engine) => {
                engine.init()?;
                Ok(AcceptMode::Driver)
            }
            Engine::Select(engine) => {
                engine.init(acceptor)?;
                Ok(AcceptMode::Engine)
            }
            Engine::Epoll(engine) => {
                engine.init(acceptor)?;
                Ok(AcceptMode::Engine)
            }
        }
    }

    /// Take ownership of an accepted connection.
    pub fn add_client(&mut self, conn: Connection) -> Result<(), EngineError> {
        match self {
            Engine::ThreadPool(engine) => engine.add_client(conn),
            Engine::Select(engine) => engine.add_client(conn),
            Engine::Epoll(engine) => engine.add_client(conn),
        }
    }

    /// Run the engine's own accept/dispatch loop until shutdown.
    ///
    /// Engines that leave accepting to the driver return immediately.
    pub fn run(&mut self, acceptor: &mut Acceptor) -> Result<(), EngineError> {
        match self {
            Engine::ThreadPool(_) => Ok(()),
            Engine::Select(engine) => engine.run(acceptor),
            Engine::Epoll(engine) => engine.run(acceptor),
        }
    }

    /// Release every connection and engine resource.
    pub fn cleanup(&mut self) {
        match self {
            Engine::ThreadPool(engine) => engine.cleanup(),
            Engine::Select(engine) => engine.cleanup(),
            Engine::Epoll(engine) => engine.cleanup(),
        }
    }
}
