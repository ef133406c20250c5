//! End-to-end behaviour of the sync core over the in-memory store.
//!
//! Covers presence lifecycle, version serialization under concurrency,
//! template history and the listener fan-out seen by a second instance.

use checklist_collab::{
    Actor, EntityRef, EntityType, Event, LogAuditSink, MemoryStore, OperationKind,
    OperationRequest, Role, Section, ServerConfig, Store, SyncCore, SyncError, SyncState,
    Template, TemplateItem,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn core() -> SyncCore {
    SyncCore::open(ServerConfig::for_testing(), Arc::new(LogAuditSink)).unwrap()
}

fn shared_core(store: Arc<dyn Store>, max_conflict_retries: u32) -> SyncCore {
    let config = ServerConfig {
        max_conflict_retries,
        ..ServerConfig::for_testing()
    };
    SyncCore::with_store(config, store, Arc::new(LogAuditSink))
}

fn update(entity_id: &str, path: &str, old: Value, new: Value) -> OperationRequest {
    OperationRequest {
        user_id: "u1".into(),
        kind: OperationKind::Update,
        path: path.into(),
        old_value: old,
        new_value: new,
        entity_id: entity_id.into(),
        entity_type: EntityType::Checklist,
    }
}

fn template(item_title: &str) -> Template {
    Template {
        id: "T".into(),
        name: "Quarterly inspection".into(),
        description: "HVAC".into(),
        category: Some("maintenance".into()),
        sections: vec![Section {
            id: "s1".into(),
            title: "Safety".into(),
            items: vec![TemplateItem {
                id: "i1".into(),
                title: item_title.into(),
                kind: "checkbox".into(),
                required: true,
            }],
        }],
    }
}

// ─── Presence ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_join_then_leave_scenario() {
    let core = core();
    let session = core
        .sessions
        .join_session("u1", "Alice", "E1", EntityType::Checklist, None)
        .await
        .unwrap();

    let active = core.sessions.get_active_sessions("E1", None).unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].user_name, "Alice");

    core.sessions
        .leave_session(&session.session_id.to_string(), "u1")
        .await
        .unwrap();
    assert!(core.sessions.get_active_sessions("E1", None).unwrap().is_empty());
}

#[tokio::test]
async fn test_leave_twice_emits_one_event() {
    let core = core();
    let session = core
        .sessions
        .join_session("u1", "Alice", "E1", EntityType::Checklist, None)
        .await
        .unwrap();
    let id = session.session_id.to_string();

    core.sessions.leave_session(&id, "u1").await.unwrap();
    core.sessions.leave_session(&id, "u1").await.unwrap();

    let entity = EntityRef::new(EntityType::Checklist, "E1");
    let left = core
        .events
        .events_since(&entity, 0)
        .unwrap()
        .iter()
        .filter(|e| e.event_type == "member.left")
        .count();
    assert_eq!(left, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_leave_emits_one_event() {
    let core = Arc::new(core());
    let session = core
        .sessions
        .join_session("u1", "Alice", "E1", EntityType::Checklist, None)
        .await
        .unwrap();
    let id = session.session_id.to_string();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let core = core.clone();
            let id = id.clone();
            tokio::spawn(async move { core.sessions.leave_session(&id, "u1").await })
        })
        .collect();
    let mut removed = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().is_some() {
            removed += 1;
        }
    }
    assert_eq!(removed, 1);

    let entity = EntityRef::new(EntityType::Checklist, "E1");
    let left = core
        .events
        .events_since(&entity, 0)
        .unwrap()
        .iter()
        .filter(|e| e.event_type == "member.left")
        .count();
    assert_eq!(left, 1);
}

// ─── Operations ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sequential_operations_version_n() {
    let core = core();
    let n = 12u64;
    for i in 0..n {
        let result = core
            .operations
            .apply_operation(&update("E1", &format!("item.{i}.completed"), json!(false), json!(true)))
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.version, Some(i + 1));
    }

    let state = core
        .operations
        .get_sync_state("E1", EntityType::Checklist)
        .unwrap()
        .unwrap();
    assert_eq!(state.version, n);

    let entity = EntityRef::new(EntityType::Checklist, "E1");
    let versions: Vec<u64> = core
        .operations
        .operations_since(&entity, 0)
        .unwrap()
        .iter()
        .map(|o| o.version)
        .collect();
    assert_eq!(versions, (1..=n).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_version_five_to_six_scenario() {
    let core = core();
    for i in 0..5 {
        core.operations
            .apply_operation(&update("E1", &format!("item.{i}.completed"), json!(false), json!(true)))
            .await;
    }
    assert_eq!(
        core.operations
            .get_sync_state("E1", EntityType::Checklist)
            .unwrap()
            .map(|s| s.version),
        Some(5)
    );

    let result = core
        .operations
        .apply_operation(&update("E1", "item.3.completed", json!(false), json!(true)))
        .await;
    assert!(result.success);
    assert_eq!(result.version, Some(6));
    let state: SyncState = core
        .operations
        .get_sync_state("E1", EntityType::Checklist)
        .unwrap()
        .unwrap();
    assert_eq!(state.version, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_operations_never_share_a_version() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let core = Arc::new(shared_core(store, 64));

    let tasks = 16;
    let handles: Vec<_> = (0..tasks)
        .map(|i| {
            let core = core.clone();
            tokio::spawn(async move {
                core.operations
                    .try_apply_operation(&update("E1", &format!("item.{i}"), Value::Null, json!(i)))
                    .await
            })
        })
        .collect();

    let mut versions = HashSet::new();
    for handle in handles {
        let applied = handle.await.unwrap().unwrap();
        assert!(versions.insert(applied.operation.version), "duplicate version");
    }
    assert_eq!(versions, (1..=tasks as u64).collect::<HashSet<_>>());

    let state = core
        .operations
        .get_sync_state("E1", EntityType::Checklist)
        .unwrap()
        .unwrap();
    assert_eq!(state.version, tasks as u64);
    assert_eq!(state.operation_count, tasks as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_conflict_surfaces_without_retries() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let core = Arc::new(shared_core(store, 0));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let core = core.clone();
            tokio::spawn(async move {
                core.operations
                    .try_apply_operation(&update("E1", &format!("item.{i}"), Value::Null, json!(i)))
                    .await
            })
        })
        .collect();

    let mut versions = HashSet::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(applied) => assert!(versions.insert(applied.operation.version)),
            Err(e) => assert!(matches!(e, SyncError::Conflict(_)), "unexpected {e}"),
        }
    }
    let state = core
        .operations
        .get_sync_state("E1", EntityType::Checklist)
        .unwrap()
        .unwrap();
    assert_eq!(state.version as usize, versions.len());
}

#[tokio::test]
async fn test_two_instances_share_versions_not_listeners() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let a = shared_core(store.clone(), 8);
    let b = shared_core(store, 8);

    let seen: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _sub = b.events.subscribe("checklist:E1", move |event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    });

    a.operations
        .apply_operation(&update("E1", "item.1", json!(false), json!(true)))
        .await;
    let second = b
        .operations
        .apply_operation(&update("E1", "item.2", json!(false), json!(true)))
        .await;
    assert_eq!(second.version, Some(2));

    // In-process fan-out only reaches listeners of the writing instance.
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].version, 2);
}

// ─── Templates ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_template_history_scenario() {
    let core = core();
    let editor = Actor::new("u1", Role::Editor);

    let v1 = core
        .templates
        .create_template(&template("Check extinguisher"), &editor)
        .await
        .unwrap();
    assert_eq!(v1.version.to_string(), "1.0.0");
    assert!(v1.is_active);

    let v2 = core
        .templates
        .update_template(&template("Check extinguisher pressure"), "item title", &editor)
        .await
        .unwrap();
    assert_eq!(v2.version.to_string(), "1.0.1");
    let history = core.versions.get_template_versions("T").unwrap();
    assert!(!history[0].is_active);
    assert!(history[1].is_active);

    core.templates
        .revert_to_version("T", "1.0.0", &editor)
        .await
        .unwrap();
    let active = core.versions.get_active_version("T").unwrap().unwrap();
    assert_eq!(active.version.to_string(), "1.0.2");
    assert_eq!(active.snapshot, v1.snapshot);
}

#[tokio::test]
async fn test_revert_appends_exactly_one_version() {
    let core = core();
    let editor = Actor::new("u1", Role::Admin);
    let v1 = core
        .templates
        .create_template(&template("A"), &editor)
        .await
        .unwrap();
    for title in ["B", "C", "D"] {
        core.templates
            .update_template(&template(title), "edit", &editor)
            .await
            .unwrap();
    }

    let before = core.versions.get_template_versions("T").unwrap().len();
    core.templates
        .revert_to_version("T", &v1.version_id.to_string(), &editor)
        .await
        .unwrap();
    let after = core.versions.get_template_versions("T").unwrap();

    assert_eq!(after.len(), before + 1);
    assert_eq!(after.iter().filter(|v| v.is_active).count(), 1);
    let active = core.versions.get_active_version("T").unwrap().unwrap();
    assert_eq!(active.snapshot, v1.snapshot);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_saves_keep_one_active_version() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let core = Arc::new(shared_core(store, 64));
    let editor = Actor::new("u1", Role::Editor);
    core.templates
        .create_template(&template("start"), &editor)
        .await
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let core = core.clone();
            let editor = editor.clone();
            tokio::spawn(async move {
                core.versions
                    .create_version(&template(&format!("edit {i}")), "edit", &editor.user_id)
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let history = core.versions.get_template_versions("T").unwrap();
    assert_eq!(history.len(), 9);
    assert_eq!(history.iter().filter(|v| v.is_active).count(), 1);
    let labels: HashSet<String> = history.iter().map(|v| v.version.to_string()).collect();
    assert_eq!(labels.len(), 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_keep_current_row_on_active_version() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let core = Arc::new(shared_core(store, 64));
    let editor = Actor::new("u1", Role::Editor);
    core.templates
        .create_template(&template("start"), &editor)
        .await
        .unwrap();

    for round in 0..25 {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let core = core.clone();
                let editor = editor.clone();
                tokio::spawn(async move {
                    core.templates
                        .update_template(&template(&format!("round {round} edit {i}")), "edit", &editor)
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let current = core.templates.get_template("T").unwrap().unwrap();
        let active = core.versions.get_active_version("T").unwrap().unwrap();
        assert_eq!(current, active.snapshot, "round {round}");
    }

    let history = core.versions.get_template_versions("T").unwrap();
    assert_eq!(history.len(), 1 + 25 * 8);
    assert_eq!(history.iter().filter(|v| v.is_active).count(), 1);
}

#[tokio::test]
async fn test_crashed_client_presence_expires() {
    let config = ServerConfig {
        session_ttl: std::time::Duration::from_millis(25),
        ..ServerConfig::for_testing()
    };
    let core = SyncCore::open(config, Arc::new(LogAuditSink)).unwrap();
    let first = core
        .sessions
        .join_session("u1", "Alice", "E1", EntityType::Checklist, None)
        .await
        .unwrap();
    core.sessions
        .join_session("u2", "Bob", "E1", EntityType::Checklist, None)
        .await
        .unwrap();
    assert_eq!(core.sessions.get_active_sessions("E1", None).unwrap().len(), 2);

    // Nobody leaves; the rows simply age out.
    tokio::time::sleep(std::time::Duration::from_millis(75)).await;
    assert!(core.sessions.get_active_sessions("E1", None).unwrap().is_empty());

    let err = core
        .sessions
        .update_cursor("u1", "E1", EntityType::Checklist, json!({"x": 3, "y": 4}))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));

    let again = core
        .sessions
        .join_session("u1", "Alice", "E1", EntityType::Checklist, None)
        .await
        .unwrap();
    assert_ne!(again.session_id, first.session_id);
    assert_eq!(core.sessions.get_active_sessions("E1", None).unwrap(), vec![again]);
}
