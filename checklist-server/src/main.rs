//! Checklist sync server binary.
//!
//! Usage:
//!   # In-memory store (ephemeral)
//!   cargo run -p checklist-server
//!
//!   # Persistent store, custom ports
//!   cargo run -p checklist-server -- --storage-path ./data --http-addr 0.0.0.0:8080
//!
//! Every flag can also be set through its `CHECKLIST_SYNC_*` variable.
//! Log verbosity follows `RUST_LOG` (default `info`).

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use checklist_collab::{http, EventFeed, LogAuditSink, ServerConfig, SyncCore};

const AUDIT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Collaborative sync core for checklists and templates.
#[derive(Parser, Debug)]
#[command(name = "checklist-server")]
#[command(about = "Presence, versioned edits and template history over HTTP")]
struct Args {
    /// HTTP API address
    #[arg(long, env = "CHECKLIST_SYNC_HTTP_ADDR", default_value = "127.0.0.1:8080")]
    http_addr: String,

    /// WebSocket event feed address
    #[arg(long, env = "CHECKLIST_SYNC_FEED_ADDR", default_value = "127.0.0.1:9090")]
    feed_addr: String,

    /// RocksDB directory; in-memory when omitted
    #[arg(long, env = "CHECKLIST_SYNC_STORAGE_PATH")]
    storage_path: Option<PathBuf>,

    /// Session lifetime in seconds
    #[arg(long, env = "CHECKLIST_SYNC_SESSION_TTL_SECS", default_value_t = 86_400)]
    session_ttl_secs: u64,

    /// Event retention in seconds
    #[arg(long, env = "CHECKLIST_SYNC_EVENT_TTL_SECS", default_value_t = 86_400)]
    event_ttl_secs: u64,

    /// Operation retention in seconds
    #[arg(long, env = "CHECKLIST_SYNC_OPERATION_TTL_SECS", default_value_t = 604_800)]
    operation_ttl_secs: u64,

    /// Compare-and-swap retries before reporting a conflict
    #[arg(long, env = "CHECKLIST_SYNC_MAX_CONFLICT_RETRIES", default_value_t = 8)]
    max_conflict_retries: u32,

    /// Backoff step between retries, in milliseconds
    #[arg(long, env = "CHECKLIST_SYNC_RETRY_BACKOFF_MS", default_value_t = 5)]
    retry_backoff_ms: u64,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            http_addr: self.http_addr,
            feed_addr: self.feed_addr,
            storage_path: self.storage_path,
            session_ttl: Duration::from_secs(self.session_ttl_secs),
            event_ttl: Duration::from_secs(self.event_ttl_secs),
            operation_ttl: Duration::from_secs(self.operation_ttl_secs),
            max_conflict_retries: self.max_conflict_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    let core = Arc::new(SyncCore::open(config.clone(), Arc::new(LogAuditSink))?);

    let feed = EventFeed::new(core.events.clone(), config.feed_buffer);
    let feed_listener = TcpListener::bind(&config.feed_addr).await?;
    let feed_task = tokio::spawn(async move {
        if let Err(e) = feed.serve(feed_listener).await {
            log::error!("Event feed stopped: {e}");
        }
    });

    let listener = TcpListener::bind(&config.http_addr).await?;
    log::info!("HTTP API listening on {}", listener.local_addr()?);

    axum::serve(listener, http::router(core.clone()))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {e}");
            }
            log::info!("Shutting down");
        })
        .await?;

    feed_task.abort();
    match Arc::try_unwrap(core) {
        Ok(core) => {
            core.shutdown(AUDIT_DRAIN_GRACE).await;
        }
        Err(_) => log::warn!("Sync core still shared at exit; skipping audit drain"),
    }
    Ok(())
}
