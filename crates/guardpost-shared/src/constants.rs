/// Service name reported by the health endpoint and startup logs
pub const SERVICE_NAME: &str = "guardpost";

/// Maximum message text size in bytes (8 KiB)
pub const MAX_TEXT_LEN: usize = 8 * 1024;

/// Maximum attachment size in bytes (25 MiB)
pub const MAX_ATTACHMENT_SIZE: usize = 25 * 1024 * 1024;

/// Upper bound for a single history page
pub const MAX_HISTORY_PAGE: u32 = 500;

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Interval between server-initiated WebSocket pings
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 25;

/// A connection silent for this long is evicted
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 60;

/// Outbound events buffered per connection before it counts as dead
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;
