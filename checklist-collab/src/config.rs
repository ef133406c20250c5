//! Runtime configuration for the sync core and its listeners.

use std::path::PathBuf;
use std::time::Duration;

use crate::sync_state::RetryPolicy;

const HOUR_MS: u64 = 60 * 60 * 1000;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP API address
    pub http_addr: String,
    /// WebSocket event feed address
    pub feed_addr: String,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Session lifetime without a rejoin or heartbeat
    pub session_ttl: Duration,
    /// Event retention
    pub event_ttl: Duration,
    /// Operation retention
    pub operation_ttl: Duration,
    /// Compare-and-swap retries before a write reports a conflict
    pub max_conflict_retries: u32,
    /// Linear backoff step between retries
    pub retry_backoff: Duration,
    /// Outbound frames buffered per feed connection
    pub feed_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8080".to_string(),
            feed_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            session_ttl: Duration::from_millis(24 * HOUR_MS),
            event_ttl: Duration::from_millis(24 * HOUR_MS),
            operation_ttl: Duration::from_millis(7 * 24 * HOUR_MS),
            max_conflict_retries: 8,
            retry_backoff: Duration::from_millis(5),
            feed_buffer: 256,
        }
    }
}

impl ServerConfig {
    /// Ephemeral ports, in-memory store, fast retries.
    pub fn for_testing() -> Self {
        Self {
            http_addr: "127.0.0.1:0".to_string(),
            feed_addr: "127.0.0.1:0".to_string(),
            retry_backoff: Duration::from_millis(1),
            ..Self::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_conflict_retries,
            backoff: self.retry_backoff,
        }
    }
}

/// Milliseconds in `d`, saturating.
pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
