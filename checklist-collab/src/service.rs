//! Component wiring.
//!
//! [`SyncCore`] is constructed once at process start and shared by
//! reference with every surface (HTTP handlers, the event feed, tests).
//! Several cores may share one store; each keeps its own listener table.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::audit::{AuditLog, AuditSink};
use crate::config::{millis, ServerConfig};
use crate::error::SyncError;
use crate::events::EventLog;
use crate::operations::OperationApplier;
use crate::sessions::SessionRegistry;
use crate::storage::{MemoryStore, RocksStore, Store, StoreConfig};
use crate::sync_state::SyncStateTracker;
use crate::templates::TemplateService;
use crate::versions::TemplateVersionManager;

pub struct SyncCore {
    config: ServerConfig,
    store: Arc<dyn Store>,
    pub sync_state: Arc<SyncStateTracker>,
    pub events: Arc<EventLog>,
    pub sessions: Arc<SessionRegistry>,
    pub operations: Arc<OperationApplier>,
    pub versions: Arc<TemplateVersionManager>,
    pub templates: Arc<TemplateService>,
    audit: AuditLog,
    audit_task: JoinHandle<()>,
}

impl SyncCore {
    /// Open the configured store (RocksDB when `storage_path` is set) and
    /// wire every component. Must be called inside a tokio runtime.
    pub fn open(config: ServerConfig, sink: Arc<dyn AuditSink>) -> Result<Self, SyncError> {
        let store: Arc<dyn Store> = match &config.storage_path {
            Some(path) => {
                let store = RocksStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                log::info!("Opened RocksDB store at {}", path.display());
                Arc::new(store)
            }
            None => {
                log::info!("Using in-memory store (nothing survives a restart)");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_store(config, store, sink))
    }

    /// Wire every component over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn Store>, sink: Arc<dyn AuditSink>) -> Self {
        let retry = config.retry_policy();
        let (audit, audit_task) = AuditLog::spawn(sink);

        let sync_state = Arc::new(SyncStateTracker::new(store.clone()));
        let events = Arc::new(EventLog::new(
            store.clone(),
            sync_state.clone(),
            millis(config.event_ttl),
        ));
        let sessions = Arc::new(SessionRegistry::new(
            store.clone(),
            events.clone(),
            audit.clone(),
            retry,
            millis(config.session_ttl),
        ));
        let operations = Arc::new(OperationApplier::new(
            store.clone(),
            sync_state.clone(),
            events.clone(),
            audit.clone(),
            retry,
            millis(config.operation_ttl),
        ));
        let versions = Arc::new(TemplateVersionManager::new(
            store.clone(),
            events.clone(),
            audit.clone(),
            retry,
        ));
        let templates = Arc::new(TemplateService::new(
            store.clone(),
            versions.clone(),
            events.clone(),
            audit.clone(),
        ));

        Self {
            config,
            store,
            sync_state,
            events,
            sessions,
            operations,
            versions,
            templates,
            audit,
            audit_task,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Whether the audit drain task is still running.
    pub fn audit_running(&self) -> bool {
        !self.audit_task.is_finished()
    }

    /// Release every component and wait up to `grace` for queued audit
    /// entries to reach the sink. Returns whether the drain finished.
    ///
    /// The drain only ends once every component holding the audit channel
    /// is gone, so call this after the surfaces sharing the core stopped.
    pub async fn shutdown(self, grace: Duration) -> bool {
        let Self {
            config: _,
            store,
            sync_state,
            events,
            sessions,
            operations,
            versions,
            templates,
            audit,
            audit_task,
        } = self;
        drop((templates, versions, operations, sessions, events, sync_state, store, audit));

        match tokio::time::timeout(grace, audit_task).await {
            Ok(Ok(())) => {
                log::info!("Audit channel drained");
                true
            }
            Ok(Err(e)) => {
                log::error!("Audit drain task failed: {e}");
                false
            }
            Err(_) => {
                log::warn!("Audit drain still busy after {grace:?}; pending entries may be lost");
                false
            }
        }
    }
}
