//! Serialized, versioned edits.
//!
//! Applying an operation bumps the entity's sync version with
//! compare-and-swap: the new [`SyncState`] and the [`Operation`] row are
//! committed in one conditional batch, so two writers can never both claim
//! the same version. The loser re-reads and tries again.
//!
//! ```text
//! OperationRequest ─► validate ─► read SyncState (rev r)
//!                                   │
//!                                   ▼
//!                      Batch { SyncState @ Revision(r),
//!                              Operation v+1 @ Absent }
//!                                   │ conflict ─► backoff, re-read
//!                                   ▼
//!                      event (entity.updated / entity.item.changed)
//!                      audit (operation.applied)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLog};
use crate::error::{require, SyncError};
use crate::events::EventLog;
use crate::model::{
    now_millis, EntityRef, EntityType, NewEvent, Operation, OperationRequest, SyncState,
};
use crate::storage::{encode, expiry_after, Batch, Collection, Condition, ItemKey, Store};
use crate::sync_state::{chain_checksum, RetryPolicy, SyncStateTracker};

/// Outcome reported to callers that only distinguish success and failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApplyResult {
    pub fn applied(operation: &Operation) -> Self {
        Self {
            success: true,
            operation_id: Some(operation.operation_id),
            version: Some(operation.version),
            error: None,
        }
    }

    pub fn failed(error: &SyncError) -> Self {
        Self {
            success: false,
            operation_id: None,
            version: None,
            error: Some(error.to_string()),
        }
    }
}

/// A committed operation together with the state it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedOperation {
    pub operation: Operation,
    pub state: SyncState,
}

pub struct OperationApplier {
    store: Arc<dyn Store>,
    sync_state: Arc<SyncStateTracker>,
    events: Arc<EventLog>,
    audit: AuditLog,
    retry: RetryPolicy,
    operation_ttl_ms: u64,
}

impl OperationApplier {
    pub fn new(
        store: Arc<dyn Store>,
        sync_state: Arc<SyncStateTracker>,
        events: Arc<EventLog>,
        audit: AuditLog,
        retry: RetryPolicy,
        operation_ttl_ms: u64,
    ) -> Self {
        Self {
            store,
            sync_state,
            events,
            audit,
            retry,
            operation_ttl_ms,
        }
    }

    /// Operation rows sort by zero-padded version.
    fn operation_key(entity: &EntityRef, version: u64) -> ItemKey {
        ItemKey::new(entity.room_id(), format!("{version:020}"))
    }

    /// Apply an edit. Every failure is folded into the result.
    pub async fn apply_operation(&self, request: &OperationRequest) -> ApplyResult {
        match self.try_apply_operation(request).await {
            Ok(applied) => ApplyResult::applied(&applied.operation),
            Err(e) => {
                log::warn!(
                    "Operation {} on {}:{} rejected ({}): {e}",
                    request.kind.as_str(),
                    request.entity_type,
                    request.entity_id,
                    e.kind()
                );
                ApplyResult::failed(&e)
            }
        }
    }

    /// Apply an edit, returning the committed operation or a typed error.
    pub async fn try_apply_operation(
        &self,
        request: &OperationRequest,
    ) -> Result<AppliedOperation, SyncError> {
        require("userId", &request.user_id)?;
        require("entityId", &request.entity_id)?;
        require("path", &request.path)?;
        let entity = EntityRef::new(request.entity_type, request.entity_id.clone());

        let applied = self
            .retry
            .run("apply_operation", || self.commit(request, &entity))
            .await?;
        let operation = &applied.operation;
        log::debug!(
            "Applied {} {} on {} at version {}",
            operation.kind.as_str(),
            operation.path,
            entity,
            operation.version
        );

        let event = NewEvent::new(
            operation.kind.event_type(),
            operation.user_id.clone(),
            entity.clone(),
            json!({
                "operationId": operation.operation_id,
                "type": operation.kind,
                "path": operation.path,
                "oldValue": operation.old_value,
                "newValue": operation.new_value,
                "version": operation.version,
            }),
        );
        if let Err(e) = self.events.create_event(event) {
            log::warn!("Operation v{} on {entity} committed but its event failed: {e}", operation.version);
        }
        self.audit.record(
            AuditEntry::new("operation.applied", &entity, operation.user_id.clone())
                .with_old(json!({
                    "value": operation.old_value,
                    "version": operation.version - 1,
                }))
                .with_new(json!({
                    "value": operation.new_value,
                    "version": operation.version,
                })),
        );
        Ok(applied)
    }

    /// One read-compute-commit attempt.
    fn commit(&self, request: &OperationRequest, entity: &EntityRef) -> Result<AppliedOperation, SyncError> {
        let read = self.sync_state.read(entity)?;
        let version = read.version() + 1;
        let now = now_millis();

        let operation = Operation {
            operation_id: Uuid::new_v4(),
            user_id: request.user_id.clone(),
            entity_id: entity.entity_id.clone(),
            entity_type: entity.entity_type,
            kind: request.kind,
            path: request.path.clone(),
            old_value: request.old_value.clone(),
            new_value: request.new_value.clone(),
            timestamp: now,
            version,
        };
        let payload = json!({
            "type": operation.kind,
            "path": operation.path,
            "newValue": operation.new_value,
            "version": version,
            "userId": operation.user_id,
        });
        let state = SyncState {
            entity_id: entity.entity_id.clone(),
            entity_type: entity.entity_type,
            version,
            last_modified: now,
            modified_by: operation.user_id.clone(),
            checksum: chain_checksum(read.checksum(), &payload),
            operation_count: read.operation_count() + 1,
        };

        let batch = Batch::new()
            .put(
                Collection::SyncState,
                SyncStateTracker::key(entity),
                encode(&state)?,
                None,
                read.condition,
            )
            .put(
                Collection::Operations,
                Self::operation_key(entity, version),
                encode(&operation)?,
                Some(expiry_after(self.operation_ttl_ms)),
                Condition::Absent,
            );
        self.store.write(batch)?;
        Ok(AppliedOperation { operation, state })
    }

    /// Bump the version without an operation, telling clients to reload.
    pub async fn force_sync(
        &self,
        entity_id: &str,
        entity_type: EntityType,
        user_id: &str,
    ) -> Result<SyncState, SyncError> {
        require("entityId", entity_id)?;
        require("userId", user_id)?;
        let entity = EntityRef::new(entity_type, entity_id);

        let (previous, state) = self
            .retry
            .run("force_sync", || {
                let read = self.sync_state.read(&entity)?;
                let version = read.version() + 1;
                let state = SyncState {
                    entity_id: entity.entity_id.clone(),
                    entity_type,
                    version,
                    last_modified: now_millis(),
                    modified_by: user_id.to_string(),
                    checksum: chain_checksum(
                        read.checksum(),
                        &json!({ "resync": version, "userId": user_id }),
                    ),
                    operation_count: read.operation_count(),
                };
                self.store.put(
                    Collection::SyncState,
                    SyncStateTracker::key(&entity),
                    encode(&state)?,
                    None,
                    read.condition,
                )?;
                Ok((read.version(), state))
            })
            .await?;

        log::info!("{user_id} forced resync of {entity} to version {}", state.version);
        let event = NewEvent::new(
            "sync.forced",
            user_id,
            entity.clone(),
            json!({ "version": state.version, "checksum": state.checksum }),
        );
        if let Err(e) = self.events.create_event(event) {
            log::warn!("Resync of {entity} committed but its event failed: {e}");
        }
        self.audit.record(
            AuditEntry::new("sync.forced", &entity, user_id)
                .with_old(json!({ "version": previous }))
                .with_new(json!({ "version": state.version })),
        );
        Ok(state)
    }

    pub fn get_sync_state(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<Option<SyncState>, SyncError> {
        self.sync_state
            .get_sync_state(&EntityRef::new(entity_type, entity_id))
    }

    /// Retained operations with `version > after_version`, in version order.
    pub fn operations_since(
        &self,
        entity: &EntityRef,
        after_version: u64,
    ) -> Result<Vec<Operation>, SyncError> {
        let mut operations = Vec::new();
        for (_, item) in self.store.query(Collection::Operations, &entity.room_id(), "")? {
            let operation: Operation = item.decode()?;
            if operation.version > after_version {
                operations.push(operation);
            }
        }
        Ok(operations)
    }
}
