//! Event log with room-based in-process fan-out.
//!
//! Every state change becomes an immutable [`Event`], persisted with bounded
//! retention and then handed synchronously to each listener subscribed to
//! its room (`entity_type:entity_id`). The listener table is owned by one
//! [`EventLog`] instance shared by reference; it reaches listeners in this
//! process only; other instances attach through the WebSocket feed.
//!
//! ```text
//! create_event ──► stamp version ──► persist (events CF) ──► listeners[room]
//!                                                            ├─► feed socket
//!                                                            └─► ...
//! ```

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use uuid::Uuid;

use crate::error::SyncError;
use crate::model::{now_millis, EntityRef, Event, NewEvent};
use crate::storage::{encode, Collection, Condition, ItemKey, Store};
use crate::sync_state::SyncStateTracker;

/// Callback invoked for each event of a subscribed room.
pub type Listener =
    Arc<dyn Fn(&Event) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

struct Registration {
    id: u64,
    listener: Listener,
}

type ListenerTable = Mutex<HashMap<String, Vec<Registration>>>;

/// Statistics for monitoring event log health.
#[derive(Debug, Clone, Default)]
pub struct EventLogStats {
    pub events_written: u64,
    pub persist_failures: u64,
    pub listener_failures: u64,
    pub active_rooms: usize,
}

/// Lock-free counters, read via [`EventLog::stats`].
#[derive(Default)]
struct AtomicEventStats {
    events_written: AtomicU64,
    persist_failures: AtomicU64,
    listener_failures: AtomicU64,
}

/// Handle for one listener registration.
pub struct Subscription {
    room_id: String,
    id: u64,
    table: Weak<ListenerTable>,
}

impl Subscription {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Remove exactly this registration. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(table) = self.table.upgrade() else {
            return false;
        };
        let Ok(mut rooms) = table.lock() else {
            return false;
        };
        let Some(registrations) = rooms.get_mut(&self.room_id) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|r| r.id != self.id);
        let removed = registrations.len() < before;
        if registrations.is_empty() {
            rooms.remove(&self.room_id);
        }
        removed
    }
}

/// Append-only event store plus listener registry.
pub struct EventLog {
    store: Arc<dyn Store>,
    sync_state: Arc<SyncStateTracker>,
    retention_ms: u64,
    listeners: Arc<ListenerTable>,
    next_listener_id: AtomicU64,
    stats: AtomicEventStats,
}

impl EventLog {
    pub fn new(store: Arc<dyn Store>, sync_state: Arc<SyncStateTracker>, retention_ms: u64) -> Self {
        Self {
            store,
            sync_state,
            retention_ms,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener_id: AtomicU64::new(1),
            stats: AtomicEventStats::default(),
        }
    }

    /// Sort key: zero-padded timestamp then event id, so partition scans
    /// come back in `(timestamp, event_id)` order.
    fn sort_key(event: &Event) -> String {
        format!("{:020}#{}", event.timestamp, event.event_id)
    }

    /// Stamp, persist and fan out a new event.
    ///
    /// The event carries the entity's current sync version; it does not bump
    /// it. Listeners run even when persistence fails, in which case the
    /// storage error is returned afterwards.
    pub fn create_event(&self, new: NewEvent) -> Result<Event, SyncError> {
        let version = self.sync_state.current_version(&new.entity)?;
        let timestamp = now_millis();
        let event = Event {
            event_id: Uuid::new_v4(),
            event_type: new.event_type,
            user_id: new.user_id,
            entity_type: new.entity.entity_type,
            entity_id: new.entity.entity_id.clone(),
            data: new.data,
            timestamp,
            room_id: new.entity.room_id(),
            version,
            expires_at: timestamp.saturating_add(self.retention_ms),
        };

        let persisted = encode(&event).and_then(|bytes| {
            self.store.put(
                Collection::Events,
                ItemKey::new(event.room_id.clone(), Self::sort_key(&event)),
                bytes,
                Some(event.expires_at),
                Condition::Absent,
            )
        });
        match &persisted {
            Ok(()) => {
                self.stats.events_written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to persist {} event for {}: {e}", event.event_type, event.room_id);
            }
        }

        self.dispatch(&event);
        persisted?;
        Ok(event)
    }

    /// Invoke every listener of the event's room. Failures are isolated.
    fn dispatch(&self, event: &Event) {
        // Clone the registrations so callbacks run without the table lock.
        let listeners: Vec<Listener> = match self.listeners.lock() {
            Ok(rooms) => rooms
                .get(&event.room_id)
                .map(|regs| regs.iter().map(|r| r.listener.clone()).collect())
                .unwrap_or_default(),
            Err(_) => {
                log::error!("Listener table poisoned, skipping fan-out for {}", event.room_id);
                return;
            }
        };

        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.stats.listener_failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Listener for {} failed on {}: {e}", event.room_id, event.event_type);
                }
                Err(_) => {
                    self.stats.listener_failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Listener for {} panicked on {}", event.room_id, event.event_type);
                }
            }
        }
    }

    /// Register `callback` for events of `room_id`.
    pub fn subscribe<F>(&self, room_id: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync + 'static,
    {
        let room_id = room_id.into();
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let registration = Registration {
            id,
            listener: Arc::new(callback),
        };
        match self.listeners.lock() {
            Ok(mut rooms) => rooms.entry(room_id.clone()).or_default().push(registration),
            Err(_) => log::error!("Listener table poisoned, subscription to {room_id} dropped"),
        }
        log::debug!("Listener {id} subscribed to {room_id}");
        Subscription {
            room_id,
            id,
            table: Arc::downgrade(&self.listeners),
        }
    }

    /// Number of listeners currently registered for a room.
    pub fn listener_count(&self, room_id: &str) -> usize {
        self.listeners
            .lock()
            .map(|rooms| rooms.get(room_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Retained events of an entity with `timestamp >= since`, oldest first.
    pub fn events_since(&self, entity: &EntityRef, since: u64) -> Result<Vec<Event>, SyncError> {
        let rows = self.store.query(Collection::Events, &entity.room_id(), "")?;
        let mut events = Vec::with_capacity(rows.len());
        for (_, item) in rows {
            let event: Event = item.decode()?;
            if event.timestamp >= since {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Lock-free snapshot of counters.
    pub fn stats(&self) -> EventLogStats {
        EventLogStats {
            events_written: self.stats.events_written.load(Ordering::Relaxed),
            persist_failures: self.stats.persist_failures.load(Ordering::Relaxed),
            listener_failures: self.stats.listener_failures.load(Ordering::Relaxed),
            active_rooms: self.listeners.lock().map(|rooms| rooms.len()).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityType;
    use crate::storage::{Batch, MemoryStore, StoreError, StoredItem};
    use serde_json::json;

    fn event_log() -> (Arc<MemoryStore>, EventLog) {
        let store = Arc::new(MemoryStore::new());
        let tracker = Arc::new(SyncStateTracker::new(store.clone()));
        let log = EventLog::new(store.clone(), tracker, 60_000);
        (store, log)
    }

    fn entity() -> EntityRef {
        EntityRef::new(EntityType::Checklist, "E1")
    }

    #[test]
    fn test_create_event_persists_and_stamps() {
        let (_store, log) = event_log();
        let event = log
            .create_event(NewEvent::new("member.joined", "u1", entity(), json!({"userName": "Alice"})))
            .unwrap();

        assert_eq!(event.room_id, "checklist:E1");
        assert_eq!(event.version, 0);
        assert!(event.expires_at > event.timestamp);

        let replay = log.events_since(&entity(), 0).unwrap();
        assert_eq!(replay, vec![event]);
        assert_eq!(log.stats().events_written, 1);
    }

    #[test]
    fn test_listeners_receive_room_events_only() {
        let (_store, log) = event_log();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = log.subscribe("checklist:E1", move |e| {
            sink.lock().unwrap().push(e.event_type.clone());
            Ok(())
        });

        log.create_event(NewEvent::new("cursor.moved", "u1", entity(), json!({}))).unwrap();
        log.create_event(NewEvent::new(
            "cursor.moved",
            "u1",
            EntityRef::new(EntityType::Checklist, "E2"),
            json!({}),
        ))
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["cursor.moved".to_string()]);
    }

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let (_store, log) = event_log();
        let hits = Arc::new(AtomicU64::new(0));

        let _bad = log.subscribe("checklist:E1", |_| Err("boom".into()));
        let _panicky = log.subscribe("checklist:E1", |_| panic!("listener bug"));
        let counter = hits.clone();
        let _good = log.subscribe("checklist:E1", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        log.create_event(NewEvent::new("entity.updated", "u1", entity(), json!({}))).unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(log.stats().listener_failures, 2);
        assert_eq!(log.events_since(&entity(), 0).unwrap().len(), 1);
    }

    #[test]
    fn test_unsubscribe_removes_exactly_one_registration() {
        let (_store, log) = event_log();
        let first = log.subscribe("checklist:E1", |_| Ok(()));
        let _second = log.subscribe("checklist:E1", |_| Ok(()));
        assert_eq!(log.listener_count("checklist:E1"), 2);

        assert!(first.unsubscribe());
        assert_eq!(log.listener_count("checklist:E1"), 1);
        assert_eq!(log.stats().active_rooms, 1);
    }

    #[test]
    fn test_last_unsubscribe_drops_room() {
        let (_store, log) = event_log();
        let sub = log.subscribe("template:T1", |_| Ok(()));
        assert_eq!(sub.room_id(), "template:T1");
        assert!(sub.unsubscribe());
        assert_eq!(log.listener_count("template:T1"), 0);
        assert_eq!(log.stats().active_rooms, 0);
    }

    #[test]
    fn test_events_since_filters_and_orders() {
        let (_store, log) = event_log();
        let first = log.create_event(NewEvent::new("a", "u1", entity(), json!({}))).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(3));
        let second = log.create_event(NewEvent::new("b", "u1", entity(), json!({}))).unwrap();

        let all = log.events_since(&entity(), 0).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].event_id, first.event_id);

        let recent = log.events_since(&entity(), second.timestamp).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event_id, second.event_id);
    }

    /// Store whose writes always fail, for the persistence-error path.
    struct ReadOnlyStore(MemoryStore);

    impl Store for ReadOnlyStore {
        fn get(&self, c: Collection, k: &ItemKey) -> Result<Option<StoredItem>, StoreError> {
            self.0.get(c, k)
        }
        fn query(&self, c: Collection, p: &str, s: &str) -> Result<Vec<(String, StoredItem)>, StoreError> {
            self.0.query(c, p, s)
        }
        fn write(&self, _batch: Batch) -> Result<(), StoreError> {
            Err(StoreError::DatabaseError("read-only".into()))
        }
        fn purge_expired(&self) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[test]
    fn test_listeners_run_when_persistence_fails() {
        let store: Arc<dyn Store> = Arc::new(ReadOnlyStore(MemoryStore::new()));
        let tracker = Arc::new(SyncStateTracker::new(store.clone()));
        let log = EventLog::new(store, tracker, 1_000);

        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        let _sub = log.subscribe("checklist:E1", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let result = log.create_event(NewEvent::new("entity.updated", "u1", entity(), json!({})));
        assert!(matches!(result, Err(SyncError::Storage(_))));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(log.stats().persist_failures, 1);
    }
}
