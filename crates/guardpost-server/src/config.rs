//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use guardpost_shared::constants::{
    DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_HEARTBEAT_TIMEOUT_SECS, DEFAULT_HTTP_PORT,
    DEFAULT_OUTBOUND_QUEUE, MAX_ATTACHMENT_SIZE,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `None`, meaning the platform data directory.
    pub database_path: Option<PathBuf>,

    /// Directory where attachment blobs are stored.
    /// Env: `ATTACHMENT_STORAGE_PATH`
    /// Default: `./attachments`
    pub attachment_storage_path: PathBuf,

    /// Maximum attachment size in bytes.
    /// Env: `MAX_ATTACHMENT_SIZE`
    /// Default: 25 MiB
    pub max_attachment_size: usize,

    /// JSON user directory used to authenticate callers.
    /// Env: `IDENTITY_FILE`
    /// Default: unset (nobody can authenticate).
    pub identity_file: Option<PathBuf>,

    /// Interval between server pings on realtime connections.
    /// Env: `HEARTBEAT_INTERVAL_SECS`
    pub heartbeat_interval: Duration,

    /// A connection with no inbound frame for this long is dropped.
    /// Env: `HEARTBEAT_TIMEOUT_SECS`
    pub heartbeat_timeout: Duration,

    /// Outbound events buffered per connection; a connection whose buffer
    /// is full counts as dead.
    /// Env: `OUTBOUND_QUEUE`
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: None,
            attachment_storage_path: PathBuf::from("./attachments"),
            max_attachment_size: MAX_ATTACHMENT_SIZE,
            identity_file: None,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(path) = lookup("DATABASE_PATH").filter(|p| !p.is_empty()) {
            config.database_path = Some(PathBuf::from(path));
        }

        if let Some(path) = lookup("ATTACHMENT_STORAGE_PATH").filter(|p| !p.is_empty()) {
            config.attachment_storage_path = PathBuf::from(path);
        }

        if let Some(path) = lookup("IDENTITY_FILE").filter(|p| !p.is_empty()) {
            config.identity_file = Some(PathBuf::from(path));
        }

        if let Some(n) = parse_positive(&lookup, "MAX_ATTACHMENT_SIZE") {
            config.max_attachment_size = n;
        }

        if let Some(secs) = parse_positive(&lookup, "HEARTBEAT_INTERVAL_SECS") {
            config.heartbeat_interval = Duration::from_secs(secs as u64);
        }

        if let Some(secs) = parse_positive(&lookup, "HEARTBEAT_TIMEOUT_SECS") {
            config.heartbeat_timeout = Duration::from_secs(secs as u64);
        }

        if let Some(n) = parse_positive(&lookup, "OUTBOUND_QUEUE") {
            config.outbound_queue = n;
        }

        if config.heartbeat_timeout <= config.heartbeat_interval {
            tracing::warn!(
                interval = ?config.heartbeat_interval,
                timeout = ?config.heartbeat_timeout,
                "Heartbeat timeout must exceed the ping interval, doubling the interval"
            );
            config.heartbeat_timeout = config.heartbeat_interval * 2;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    let raw = lookup(key)?;
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(key, value = %raw, "Invalid positive integer, using default");
            None
        }
    }
}
