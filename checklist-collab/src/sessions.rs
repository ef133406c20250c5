//! Presence tracking.
//!
//! One session row per `(entity, user)`, partitioned by room id and sorted
//! by user id, so joining twice refreshes the existing row instead of
//! creating a duplicate. A second row in `session_index` maps the session
//! id back to its entity for `leave_session`. Both rows expire together.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLog};
use crate::error::{require, SyncError};
use crate::events::EventLog;
use crate::model::{now_millis, EntityRef, EntityType, NewEvent, Session};
use crate::storage::{encode, Batch, Collection, Condition, ItemKey, Store};
use crate::sync_state::RetryPolicy;

const INDEX_SORT: &str = "session";

/// Reverse lookup row: session id to the entity it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionIndexEntry {
    entity_type: EntityType,
    entity_id: String,
    user_id: String,
}

/// Session registry over the shared store.
pub struct SessionRegistry {
    store: Arc<dyn Store>,
    events: Arc<EventLog>,
    audit: AuditLog,
    retry: RetryPolicy,
    session_ttl_ms: u64,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<EventLog>,
        audit: AuditLog,
        retry: RetryPolicy,
        session_ttl_ms: u64,
    ) -> Self {
        Self {
            store,
            events,
            audit,
            retry,
            session_ttl_ms,
        }
    }

    fn session_key(entity: &EntityRef, user_id: &str) -> ItemKey {
        ItemKey::new(entity.room_id(), user_id)
    }

    fn index_key(session_id: &str) -> ItemKey {
        ItemKey::new(session_id, INDEX_SORT)
    }

    /// Register `user_id` as present on the entity, or refresh the session
    /// they already hold there.
    pub async fn join_session(
        &self,
        user_id: &str,
        user_name: &str,
        entity_id: &str,
        entity_type: EntityType,
        connection_ref: Option<String>,
    ) -> Result<Session, SyncError> {
        require("userId", user_id)?;
        require("userName", user_name)?;
        require("entityId", entity_id)?;
        let entity = EntityRef::new(entity_type, entity_id);

        let session = self
            .retry
            .run("join_session", || {
                self.upsert(user_id, user_name, &entity, connection_ref.clone())
            })
            .await?;

        log::info!("{} ({}) joined {}", session.user_name, session.user_id, entity);
        self.emit(NewEvent::new(
            "member.joined",
            user_id,
            entity.clone(),
            json!({
                "sessionId": session.session_id,
                "userName": session.user_name,
            }),
        ));
        self.audit.record(
            AuditEntry::new("session.joined", &entity, user_id)
                .with_new(json!({ "sessionId": session.session_id })),
        );
        Ok(session)
    }

    fn upsert(
        &self,
        user_id: &str,
        user_name: &str,
        entity: &EntityRef,
        connection_ref: Option<String>,
    ) -> Result<Session, SyncError> {
        let key = Self::session_key(entity, user_id);
        let current = self.store.get(Collection::Sessions, &key)?;
        let condition = Condition::matching(current.as_ref());
        let existing = current.map(|item| item.decode::<Session>()).transpose()?;

        let now = now_millis();
        let expires_at = now.saturating_add(self.session_ttl_ms);
        let session = match existing {
            Some(mut session) => {
                session.user_name = user_name.to_string();
                session.last_activity = now;
                session.is_active = true;
                session.connection_ref = connection_ref;
                session.expires_at = expires_at;
                session
            }
            None => Session {
                session_id: Uuid::new_v4(),
                user_id: user_id.to_string(),
                user_name: user_name.to_string(),
                entity_id: entity.entity_id.clone(),
                entity_type: entity.entity_type,
                joined_at: now,
                last_activity: now,
                is_active: true,
                cursor: None,
                selection: None,
                connection_ref,
                expires_at,
            },
        };

        let index = SessionIndexEntry {
            entity_type: entity.entity_type,
            entity_id: entity.entity_id.clone(),
            user_id: user_id.to_string(),
        };
        let batch = Batch::new()
            .put(
                Collection::Sessions,
                key,
                encode(&session)?,
                Some(expires_at),
                condition,
            )
            .put(
                Collection::SessionIndex,
                Self::index_key(&session.session_id.to_string()),
                encode(&index)?,
                Some(expires_at),
                Condition::Always,
            );
        self.store.write(batch)?;
        Ok(session)
    }

    /// End a session. Unknown ids and sessions owned by someone else are
    /// ignored, so repeated or concurrent leaves emit a single event.
    ///
    /// Returns the removed session when this call removed it.
    pub async fn leave_session(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<Session>, SyncError> {
        require("sessionId", session_id)?;
        require("userId", user_id)?;

        let removed = self
            .retry
            .run("leave_session", || self.remove(session_id, user_id))
            .await?;
        let Some(session) = removed else {
            log::debug!("leave_session: {session_id} not held by {user_id}, ignoring");
            return Ok(None);
        };

        let entity = session.entity();
        let duration_ms = session.duration_ms(now_millis());
        log::info!("{} ({}) left {} after {duration_ms}ms", session.user_name, user_id, entity);
        self.emit(NewEvent::new(
            "member.left",
            user_id,
            entity.clone(),
            json!({
                "sessionId": session.session_id,
                "userName": session.user_name,
                "durationMs": duration_ms,
            }),
        ));
        self.audit.record(
            AuditEntry::new("session.left", &entity, user_id)
                .with_old(json!({ "sessionId": session.session_id, "durationMs": duration_ms })),
        );
        Ok(Some(session))
    }

    fn remove(&self, session_id: &str, user_id: &str) -> Result<Option<Session>, SyncError> {
        let index_key = Self::index_key(session_id);
        let Some(index_item) = self.store.get(Collection::SessionIndex, &index_key)? else {
            return Ok(None);
        };
        let index: SessionIndexEntry = index_item.decode()?;
        if index.user_id != user_id {
            return Ok(None);
        }

        let entity = EntityRef::new(index.entity_type, index.entity_id);
        let key = Self::session_key(&entity, user_id);
        let current = self.store.get(Collection::Sessions, &key)?;
        let session = match current.as_ref().map(|i| i.decode::<Session>()).transpose()? {
            Some(session) if session.session_id.to_string() == session_id => session,
            // Index outlived its session (or the user rejoined elsewhere).
            _ => {
                self.store
                    .delete(Collection::SessionIndex, index_key, Condition::Present)?;
                return Ok(None);
            }
        };

        let batch = Batch::new()
            .delete(
                Collection::Sessions,
                key,
                Condition::matching(current.as_ref()),
            )
            .delete(Collection::SessionIndex, index_key, Condition::Present);
        self.store.write(batch)?;
        Ok(Some(session))
    }

    /// Record the user's cursor position. `NotFound` when they hold no
    /// session on the entity.
    pub async fn update_cursor(
        &self,
        user_id: &str,
        entity_id: &str,
        entity_type: EntityType,
        cursor: Value,
    ) -> Result<Session, SyncError> {
        require("userId", user_id)?;
        require("entityId", entity_id)?;
        let entity = EntityRef::new(entity_type, entity_id);

        let session = self
            .retry
            .run("update_cursor", || {
                self.modify(user_id, &entity, |s| s.cursor = Some(cursor.clone()))
            })
            .await?;
        log::trace!("{user_id} moved cursor on {entity}");
        self.emit(NewEvent::new(
            "cursor.moved",
            user_id,
            entity,
            json!({ "userName": session.user_name, "cursor": cursor }),
        ));
        Ok(session)
    }

    /// Record the user's selection. Same contract as [`Self::update_cursor`].
    pub async fn update_selection(
        &self,
        user_id: &str,
        entity_id: &str,
        entity_type: EntityType,
        selection: Value,
    ) -> Result<Session, SyncError> {
        require("userId", user_id)?;
        require("entityId", entity_id)?;
        let entity = EntityRef::new(entity_type, entity_id);

        let session = self
            .retry
            .run("update_selection", || {
                self.modify(user_id, &entity, |s| s.selection = Some(selection.clone()))
            })
            .await?;
        log::trace!("{user_id} changed selection on {entity}");
        self.emit(NewEvent::new(
            "selection.changed",
            user_id,
            entity,
            json!({ "userName": session.user_name, "selection": selection }),
        ));
        Ok(session)
    }

    /// Keep a session alive without broadcasting anything.
    pub async fn heartbeat(
        &self,
        user_id: &str,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<Session, SyncError> {
        require("userId", user_id)?;
        require("entityId", entity_id)?;
        let entity = EntityRef::new(entity_type, entity_id);
        let ttl = self.session_ttl_ms;

        let session = self
            .retry
            .run("heartbeat", || {
                self.modify(user_id, &entity, |s| {
                    s.expires_at = s.last_activity.saturating_add(ttl)
                })
            })
            .await?;
        // Keep the reverse index alive as long as the session.
        let index = SessionIndexEntry {
            entity_type,
            entity_id: entity_id.to_string(),
            user_id: user_id.to_string(),
        };
        self.store.put(
            Collection::SessionIndex,
            Self::index_key(&session.session_id.to_string()),
            encode(&index)?,
            Some(session.expires_at),
            Condition::Always,
        )?;
        Ok(session)
    }

    /// Read-modify-write of one session row, conditioned on its revision.
    /// `last_activity` is refreshed before `change` runs.
    fn modify<F>(&self, user_id: &str, entity: &EntityRef, change: F) -> Result<Session, SyncError>
    where
        F: FnOnce(&mut Session),
    {
        let key = Self::session_key(entity, user_id);
        let Some(item) = self.store.get(Collection::Sessions, &key)? else {
            return Err(SyncError::NotFound(format!(
                "no active session for {user_id} on {entity}"
            )));
        };
        let mut session: Session = item.decode()?;
        session.last_activity = now_millis();
        change(&mut session);
        self.store.put(
            Collection::Sessions,
            key,
            encode(&session)?,
            Some(session.expires_at),
            Condition::Revision(item.revision),
        )?;
        Ok(session)
    }

    /// Live sessions on an entity, oldest join first. With no type given,
    /// every entity type is searched.
    pub fn get_active_sessions(
        &self,
        entity_id: &str,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<Session>, SyncError> {
        require("entityId", entity_id)?;
        let types: Vec<EntityType> = match entity_type {
            Some(t) => vec![t],
            None => EntityType::ALL.to_vec(),
        };

        let mut sessions = Vec::new();
        for t in types {
            let room = EntityRef::new(t, entity_id).room_id();
            for (_, item) in self.store.query(Collection::Sessions, &room, "")? {
                let session: Session = item.decode()?;
                if session.is_active {
                    sessions.push(session);
                }
            }
        }
        sessions.sort_by_key(|s| s.joined_at);
        Ok(sessions)
    }

    /// Broadcast after a committed write; failures stay in the log.
    fn emit(&self, event: NewEvent) {
        let event_type = event.event_type.clone();
        if let Err(e) = self.events.create_event(event) {
            log::warn!("Presence change committed but {event_type} event failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::testing::{wait_for, RecordingSink};
    use crate::storage::MemoryStore;
    use crate::sync_state::SyncStateTracker;
    use std::time::Duration;

    struct Fixture {
        registry: SessionRegistry,
        events: Arc<EventLog>,
        sink: Arc<RecordingSink>,
    }

    fn fixture() -> Fixture {
        fixture_with_ttl(60_000)
    }

    fn fixture_with_ttl(session_ttl_ms: u64) -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let tracker = Arc::new(SyncStateTracker::new(store.clone()));
        let events = Arc::new(EventLog::new(store.clone(), tracker, 60_000));
        let sink = Arc::new(RecordingSink::default());
        let (audit, _handle) = AuditLog::spawn(sink.clone());
        let retry = RetryPolicy {
            max_retries: 8,
            backoff: Duration::from_millis(1),
        };
        let registry = SessionRegistry::new(store, events.clone(), audit, retry, session_ttl_ms);
        Fixture {
            registry,
            events,
            sink,
        }
    }

    fn e1() -> EntityRef {
        EntityRef::new(EntityType::Checklist, "E1")
    }

    #[tokio::test]
    async fn test_join_creates_session_and_event() {
        let f = fixture();
        let session = f
            .registry
            .join_session("u1", "Alice", "E1", EntityType::Checklist, Some("conn-1".into()))
            .await
            .unwrap();
        assert!(session.is_active);
        assert_eq!(session.connection_ref.as_deref(), Some("conn-1"));

        let active = f.registry.get_active_sessions("E1", Some(EntityType::Checklist)).unwrap();
        assert_eq!(active, vec![session]);

        let events = f.events.events_since(&e1(), 0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "member.joined");
        assert_eq!(events[0].data["userName"], "Alice");

        assert_eq!(wait_for(&f.sink, 1).await[0].action, "session.joined");
    }

    #[tokio::test]
    async fn test_join_validates_identifiers() {
        let f = fixture();
        for (user, name, entity) in [("", "Alice", "E1"), ("u1", " ", "E1"), ("u1", "Alice", "")] {
            let err = f
                .registry
                .join_session(user, name, entity, EntityType::Checklist, None)
                .await
                .unwrap_err();
            assert!(matches!(err, SyncError::Validation(_)));
        }
        assert!(f.events.events_since(&e1(), 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejoin_keeps_single_session() {
        let f = fixture();
        let first = f
            .registry
            .join_session("u1", "Alice", "E1", EntityType::Checklist, None)
            .await
            .unwrap();
        let second = f
            .registry
            .join_session("u1", "Alice B.", "E1", EntityType::Checklist, Some("conn-2".into()))
            .await
            .unwrap();

        assert_eq!(first.session_id, second.session_id);
        assert_eq!(first.joined_at, second.joined_at);
        assert_eq!(second.user_name, "Alice B.");
        assert_eq!(f.registry.get_active_sessions("E1", None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let f = fixture();
        let session = f
            .registry
            .join_session("u1", "Alice", "E1", EntityType::Checklist, None)
            .await
            .unwrap();
        let id = session.session_id.to_string();

        let removed = f.registry.leave_session(&id, "u1").await.unwrap();
        assert_eq!(removed.map(|s| s.session_id), Some(session.session_id));
        assert!(f.registry.leave_session(&id, "u1").await.unwrap().is_none());

        let left: Vec<_> = f
            .events
            .events_since(&e1(), 0)
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == "member.left")
            .collect();
        assert_eq!(left.len(), 1);
        assert!(left[0].data["durationMs"].is_u64());
        assert!(f.registry.get_active_sessions("E1", None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_leave_ignores_foreign_and_unknown_sessions() {
        let f = fixture();
        let session = f
            .registry
            .join_session("u1", "Alice", "E1", EntityType::Checklist, None)
            .await
            .unwrap();

        let foreign = f
            .registry
            .leave_session(&session.session_id.to_string(), "u2")
            .await
            .unwrap();
        assert!(foreign.is_none());
        assert!(f.registry.leave_session("no-such-session", "u1").await.unwrap().is_none());
        assert_eq!(f.registry.get_active_sessions("E1", None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_cursor_requires_session() {
        let f = fixture();
        let err = f
            .registry
            .update_cursor("u1", "E1", EntityType::Checklist, json!({"x": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));

        f.registry
            .join_session("u1", "Alice", "E1", EntityType::Checklist, None)
            .await
            .unwrap();
        let session = f
            .registry
            .update_cursor("u1", "E1", EntityType::Checklist, json!({"x": 4, "y": 2}))
            .await
            .unwrap();
        assert_eq!(session.cursor, Some(json!({"x": 4, "y": 2})));

        let events = f.events.events_since(&e1(), 0).unwrap();
        assert_eq!(events.last().unwrap().event_type, "cursor.moved");
    }

    #[tokio::test]
    async fn test_selection_and_heartbeat() {
        let f = fixture();
        let joined = f
            .registry
            .join_session("u1", "Alice", "E1", EntityType::Checklist, None)
            .await
            .unwrap();

        let selected = f
            .registry
            .update_selection("u1", "E1", EntityType::Checklist, json!(["item.1"]))
            .await
            .unwrap();
        assert_eq!(selected.selection, Some(json!(["item.1"])));

        let before = f.events.events_since(&e1(), 0).unwrap().len();
        let beat = f.registry.heartbeat("u1", "E1", EntityType::Checklist).await.unwrap();
        assert!(beat.expires_at >= joined.expires_at);
        assert_eq!(f.events.events_since(&e1(), 0).unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_active_sessions_scan_all_types_when_untyped() {
        let f = fixture();
        f.registry
            .join_session("u1", "Alice", "X", EntityType::Checklist, None)
            .await
            .unwrap();
        f.registry
            .join_session("u2", "Bob", "X", EntityType::Template, None)
            .await
            .unwrap();

        assert_eq!(f.registry.get_active_sessions("X", None).unwrap().len(), 2);
        let templates = f.registry.get_active_sessions("X", Some(EntityType::Template)).unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].user_id, "u2");
    }

    #[tokio::test]
    async fn test_session_vanishes_after_ttl() {
        let f = fixture_with_ttl(20);
        let first = f
            .registry
            .join_session("u1", "Alice", "E1", EntityType::Checklist, None)
            .await
            .unwrap();
        assert_eq!(f.registry.get_active_sessions("E1", None).unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(f.registry.get_active_sessions("E1", None).unwrap().is_empty());
        let err = f
            .registry
            .update_cursor("u1", "E1", EntityType::Checklist, serde_json::json!({"x": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));

        let second = f
            .registry
            .join_session("u1", "Alice", "E1", EntityType::Checklist, None)
            .await
            .unwrap();
        assert_ne!(second.session_id, first.session_id);
        assert!(second.joined_at >= first.expires_at);
    }
}
