//! # checklist-collab - Collaborative synchronization core
//!
//! Presence tracking, serialized versioned edits, an event log with room
//! fan-out, and snapshot-based template history with safe revert.
//!
//! ## Architecture
//!
//! ```text
//!  HTTP (axum)                       WebSocket feed
//!      │                                   ▲
//!      ▼                                   │
//! ┌────────────────┐  ┌──────────────────┐ │
//! │SessionRegistry │  │ OperationApplier │ │
//! └───────┬────────┘  └────────┬─────────┘ │
//!         │        CAS bump    ▼           │
//!         │          ┌──────────────────┐  │
//!         │          │ SyncStateTracker │  │
//!         │          └────────┬─────────┘  │
//!         ▼                   ▼            │
//!       ┌───────────────────────────────┐  │
//!       │ EventLog (persist + listeners)├──┘
//!       └───────────────┬───────────────┘
//!                       ▼
//!  ┌──────────────┐  ┌─────────────────┐    ┌────────────┐
//!  │TemplateService├─►│VersionManager   │    │ AuditLog   ├─► AuditSink
//!  └──────────────┘  └─────────────────┘    └────────────┘
//!                       │
//!                       ▼
//!            dyn Store (MemoryStore | RocksStore)
//! ```
//!
//! ## Modules
//!
//! - [`storage`]: conditional batch store with TTL (memory and RocksDB)
//! - [`sessions`]: who is present on which entity
//! - [`sync_state`]: per-entity version record and the CAS retry loop
//! - [`operations`]: versioned edits
//! - [`events`]: event log and room listeners
//! - [`versions`] / [`templates`]: template history, diff and revert
//! - [`http`] / [`feed`]: external surfaces
//! - [`service`]: wiring

pub mod audit;
pub mod config;
pub mod error;
pub mod events;
pub mod feed;
pub mod http;
pub mod model;
pub mod operations;
pub mod service;
pub mod sessions;
pub mod storage;
pub mod sync_state;
pub mod templates;
pub mod versions;

// Re-exports for convenience
pub use audit::{AuditEntry, AuditLog, AuditSink, LogAuditSink};
pub use config::ServerConfig;
pub use error::SyncError;
pub use events::{EventLog, EventLogStats, Listener, Subscription};
pub use feed::{EventFeed, FeedStats};
pub use model::{
    Actor, EntityRef, EntityType, Event, NewEvent, Operation, OperationKind, OperationRequest,
    Role, Section, SemVer, Session, SyncState, Template, TemplateItem, TemplateVersion,
};
pub use operations::{AppliedOperation, ApplyResult, OperationApplier};
pub use service::SyncCore;
pub use sessions::SessionRegistry;
pub use storage::{
    Batch, Collection, Condition, ItemKey, MemoryStore, RocksStore, Store, StoreConfig,
    StoreError, StoredItem,
};
pub use sync_state::{chain_checksum, RetryPolicy, SyncStateTracker};
pub use templates::TemplateService;
pub use versions::{diff, SaveMode, SectionChange, SectionDiff, TemplateVersionManager, VersionDiff};
