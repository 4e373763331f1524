//! Cooperative shutdown.
//!
//! A `ShutdownToken` is a shared flag that every accept loop, polling wait
//! and worker dispatch loop checks at the top of each iteration. Setting it
//! is idempotent. Signal handlers installed by [`install_signal_handlers`]
//! perform a single atomic store and nothing else.

use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide cancellation flag, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
}

impl ShutdownToken {
    /// Create a token in the "running" state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Safe to call any number of times.
    pub fn request_shutdown(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Non-blocking check.
    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Route SIGINT, SIGTERM and SIGQUIT to `token`.
///
/// Every blocking wait in the engines is bounded by the poll interval, so
/// the token is observed whether or not the interrupted call restarts.
pub fn install_signal_handlers(token: &ShutdownToken) -> io::Result<()> {
    for sig in [SIGINT, SIGTERM, SIGQUIT] {
        signal_hook::flag::register(sig, Arc::clone(&token.flag))?;
    }
    Ok(())
}
