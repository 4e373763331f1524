//! Configuration module for the echo harness server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over built-in defaults.

use crate::runtime::{EngineKind, EngineSettings, OverflowPolicy};
use clap::Parser;
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "echo-harness")]
#[command(version)]
#[command(about = "Length-prefixed echo server with pluggable concurrency engines", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Connection-handling engine
    #[arg(short, long, value_enum)]
    pub server: Option<EngineKind>,

    /// Worker threads pre-spawned by the thread engine
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Worker pool cap for the thread engine (0 = unbounded)
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// What the thread engine does once the pool cap is reached
    #[arg(long, value_enum)]
    pub overflow: Option<OverflowPolicy>,

    /// Connection cap for the select and epoll engines
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Largest accepted message payload in bytes
    #[arg(long)]
    pub max_message_len: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Engine selection
    pub kind: EngineKind,
    pub listen_backlog: u32,
    pub max_message_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8005,
            kind: EngineKind::Epoll,
            listen_backlog: 100,
            max_message_len: 16 * 1024 * 1024,
        }
    }
}

/// Engine tuning
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub workers: usize,
    /// 0 = unbounded
    pub max_workers: usize,
    pub overflow: OverflowPolicy,
    pub backlog_capacity: usize,
    pub max_connections: usize,
    pub poll_interval_ms: u64,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let settings = EngineSettings::default();
        Self {
            workers: settings.workers,
            max_workers: settings.max_workers.unwrap_or(0),
            overflow: settings.overflow,
            backlog_capacity: settings.backlog_capacity,
            max_connections: settings.max_connections,
            poll_interval_ms: settings.poll_interval.as_millis() as u64,
            event_capacity: settings.event_capacity,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub engine: EngineKind,
    pub listen_backlog: u32,
    pub max_message_len: usize,
    pub workers: usize,
    pub max_workers: usize,
    pub overflow: OverflowPolicy,
    pub backlog_capacity: usize,
    pub max_connections: usize,
    pub poll_interval: Duration,
    pub event_capacity: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::try_parse()?)
    }

    /// Resolve already-parsed CLI args against the file named by `--config`.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref path) => {
                let contents = std::fs::read_to_string(path)
                    .map_err(|source| ConfigError::FileRead {
                        path: path.clone(),
                        source,
                    })?;
                toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                    path: path.clone(),
                    source,
                })?
            }
            None => TomlConfig::default(),
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, file: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(file.server.host),
            port: cli.port.unwrap_or(file.server.port),
            engine: cli.server.unwrap_or(file.server.kind),
            listen_backlog: file.server.listen_backlog,
            max_message_len: cli.max_message_len.unwrap_or(file.server.max_message_len),
            workers: cli.workers.unwrap_or(file.engine.workers),
            max_workers: cli.max_workers.unwrap_or(file.engine.max_workers),
            overflow: cli.overflow.unwrap_or(file.engine.overflow),
            backlog_capacity: file.engine.backlog_capacity,
            max_connections: cli.max_connections.unwrap_or(file.engine.max_connections),
            poll_interval: Duration::from_millis(file.engine.poll_interval_ms),
            event_capacity: file.engine.event_capacity,
            log_level: cli.log_level.unwrap_or(file.logging.level),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("backlog_capacity", self.backlog_capacity as u64),
            ("max_message_len", self.max_message_len as u64),
            ("poll_interval_ms", self.poll_interval.as_millis() as u64),
            ("event_capacity", self.event_capacity as u64),
            ("max_connections", self.max_connections as u64),
            ("listen_backlog", self.listen_backlog as u64),
        ];
        for (key, value) in checks {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero",
                });
            }
        }
        if self.max_message_len > u32::MAX as usize {
            return Err(ConfigError::Invalid {
                key: "max_message_len",
                reason: "must fit in the 32-bit length prefix",
            });
        }
        if self.max_workers != 0 && self.workers > self.max_workers {
            return Err(ConfigError::Invalid {
                key: "workers",
                reason: "must not exceed max_workers",
            });
        }
        Ok(())
    }

    /// Engine-facing view of the configuration.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            workers: self.workers,
            max_workers: (self.max_workers != 0).then_some(self.max_workers),
            overflow: self.overflow,
            backlog_capacity: self.backlog_capacity,
            max_connections: self.max_connections,
            poll_interval: self.poll_interval,
            event_capacity: self.event_capacity,
        }
    }

    /// Resolve `host:port` to the first matching socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let resolve_error = |source| ConfigError::Resolve {
            host: self.host.clone(),
            source,
        };
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(resolve_error)?
            .next()
            .ok_or_else(|| {
                resolve_error(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no addresses",
                ))
            })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Bad arguments, or a `--help`/`--version` request.
    #[error(transparent)]
    Cli(#[from] clap::Error),
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid value for '{key}': {reason}")]
    Invalid {
        key: &'static str,
        reason: &'static str,
    },
    #[error("Failed to resolve host '{host}': {source}")]
    Resolve {
        host: String,
        source: std::io::Error,
    },
}

impl ConfigError {
    /// True for `--help` and `--version`, which are not failures.
    pub fn is_informational(&self) -> bool {
        match self {
            ConfigError::Cli(e) => matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ),
            _ => false,
        }
    }
}
