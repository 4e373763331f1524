//! echo-harness server
//!
//! Accepts TCP connections and echoes length-prefixed messages using one of
//! three engines (thread, select, epoll). Runs until SIGINT, SIGTERM or
//! SIGQUIT.

use echo_harness::config::{Config, ConfigError};
use echo_harness::shutdown::{install_signal_handlers, ShutdownToken};
use echo_harness::server;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            let code = if e.is_informational() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            };
            match e {
                // clap renders help and version to stdout, usage errors to stderr.
                ConfigError::Cli(e) => {
                    let _ = e.print();
                }
                e => eprintln!("echo-harness: {e}"),
            }
            return code;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        engine = ?config.engine,
        "Starting echo-harness server"
    );

    let token = ShutdownToken::new();
    if let Err(e) = install_signal_handlers(&token) {
        error!(error = %e, "Failed to install signal handlers");
        return ExitCode::FAILURE;
    }

    match server::serve(&config, token) {
        Ok(summary) => {
            info!(
                accepted = summary.accepted,
                signalled = summary.signalled,
                "Shutdown complete"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}
