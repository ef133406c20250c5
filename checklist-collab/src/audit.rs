//! Best-effort audit side channel.
//!
//! Components hand entries to [`AuditLog::record`], which is a one-way send
//! on an unbounded channel. A background task drains the channel into an
//! [`AuditSink`]; sink failures are logged and dropped.
//!
//! ```text
//! SessionRegistry ─┐
//! OperationApplier ├── mpsc (unbounded) ──► drain task ──► AuditSink
//! TemplateService ─┘
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::model::{now_millis, EntityRef, EntityType};

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub action: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_values: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_values: Option<Value>,
    pub timestamp: u64,
}

impl AuditEntry {
    pub fn new(action: impl Into<String>, entity: &EntityRef, user_id: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            entity_type: entity.entity_type,
            entity_id: entity.entity_id.clone(),
            user_id: user_id.into(),
            old_values: None,
            new_values: None,
            timestamp: now_millis(),
        }
    }

    pub fn with_old(mut self, values: Value) -> Self {
        self.old_values = Some(values);
        self
    }

    pub fn with_new(mut self, values: Value) -> Self {
        self.new_values = Some(values);
        self
    }
}

/// Destination for audit entries (the external audit-log writer).
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Writes entries to the `audit` log target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, entry: &AuditEntry) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let line = serde_json::to_string(entry)?;
        log::info!(target: "audit", "{line}");
        Ok(())
    }
}

/// Sending half of the audit channel. Cheap to clone.
#[derive(Clone)]
pub struct AuditLog {
    sender: mpsc::UnboundedSender<AuditEntry>,
}

impl AuditLog {
    /// Start the drain task. Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn AuditSink>) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<AuditEntry>();
        let handle = tokio::spawn(async move {
            while let Some(entry) = receiver.recv().await {
                if let Err(e) = sink.record(&entry) {
                    log::warn!(
                        "Audit sink rejected {} on {}:{}: {e}",
                        entry.action,
                        entry.entity_type,
                        entry.entity_id
                    );
                }
            }
            log::debug!("Audit channel closed");
        });
        (Self { sender }, handle)
    }

    /// Queue an entry. Never blocks and never fails the caller.
    pub fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.sender.send(entry) {
            log::warn!("Audit channel closed, dropping {}", e.0.action);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{wait_for, RecordingSink};
    use super::*;

    #[tokio::test]
    async fn test_entries_reach_sink() {
        let sink = Arc::new(RecordingSink::default());
        let (audit, _handle) = AuditLog::spawn(sink.clone());

        let entity = EntityRef::new(EntityType::Checklist, "E1");
        audit.record(AuditEntry::new("session.joined", &entity, "u1"));
        audit.record(
            AuditEntry::new("operation.applied", &entity, "u1")
                .with_old(serde_json::json!({"value": false}))
                .with_new(serde_json::json!({"value": true})),
        );

        let entries = wait_for(&sink, 2).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].new_values, Some(serde_json::json!({"value": true})));
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_stop_drain() {
        let sink = Arc::new(RecordingSink {
            failing: true,
            ..Default::default()
        });
        let (audit, handle) = AuditLog::spawn(sink);
        let entity = EntityRef::new(EntityType::Template, "T1");
        audit.record(AuditEntry::new("template.reverted", &entity, "u1"));
        audit.record(AuditEntry::new("template.reverted", &entity, "u1"));

        drop(audit);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_record_after_drain_stops_is_silent() {
        let (audit, handle) = AuditLog::spawn(Arc::new(LogAuditSink));
        handle.abort();
        let _ = handle.await;
        audit.record(AuditEntry::new(
            "session.left",
            &EntityRef::new(EntityType::Checklist, "E1"),
            "u1",
        ));
    }
}
