//! echo-client: load generator for echo-harness.
//!
//! Opens concurrent connections, sends deterministic payloads, verifies
//! every echo and reports totals.

use clap::Parser;
use echo_harness::client::{run_load, LoadConfig};
use std::net::{SocketAddr, ToSocketAddrs};
use std::process::ExitCode;
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the load generator
#[derive(Parser, Debug)]
#[command(name = "echo-client")]
#[command(version)]
#[command(about = "Load generator for length-prefixed echo servers", long_about = None)]
struct ClientArgs {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 8005)]
    port: u16,

    /// Concurrent connections
    #[arg(short, long, default_value_t = 10)]
    clients: usize,

    /// Messages per connection
    #[arg(short, long, default_value_t = 100)]
    requests: usize,

    /// Payload size in bytes
    #[arg(short, long, default_value_t = 64, value_parser = clap::value_parser!(u32).range(1..))]
    size: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn resolve(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "host resolved to no addresses")
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match ClientArgs::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    ExitCode::SUCCESS
                }
                _ => ExitCode::FAILURE,
            };
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let addr = match resolve(&args.host, args.port) {
        Ok(addr) => addr,
        Err(e) => {
            error!(host = %args.host, error = %e, "Failed to resolve server address");
            return ExitCode::FAILURE;
        }
    };

    info!(
        addr = %addr,
        clients = args.clients,
        requests = args.requests,
        size = args.size,
        "Starting load"
    );

    let started = Instant::now();
    let report = run_load(LoadConfig {
        addr,
        clients: args.clients,
        requests: args.requests,
        size: args.size as usize,
    })
    .await;
    let elapsed = started.elapsed();

    info!(
        succeeded = report.succeeded,
        failed = report.failed,
        requests = report.requests,
        bytes_received = report.bytes_received,
        mean_latency_us = report.mean_latency().map(|d| d.as_micros() as u64),
        elapsed_ms = elapsed.as_millis() as u64,
        "Load finished"
    );

    if report.failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
