//! echo-harness: a length-prefixed echo server with interchangeable
//! concurrency engines, plus the client side of the wire protocol used to
//! load it.
//!
//! Engines:
//! - thread: reusable blocking worker threads, one per active connection
//! - select: single thread, select(2) readiness polling
//! - epoll: single thread, edge-triggered notification (mio)

pub mod acceptor;
pub mod client;
pub mod config;
pub mod runtime;
pub mod server;
pub mod shutdown;

pub use config::Config;
pub use runtime::{Engine, EngineKind};
pub use server::{serve, serve_on, ServeError, ServeSummary};
pub use shutdown::ShutdownToken;
