//! Records shared by the sync core: presence sessions, events, operations,
//! per-entity sync state, and template version snapshots.
//!
//! All timestamps are milliseconds since the Unix epoch. Field names
//! serialize as camelCase because the same records travel to the UI.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use uuid::Uuid;

use crate::error::SyncError;

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ───────────────────────────────────────────────────────────────────
// Entity identity
// ───────────────────────────────────────────────────────────────────

/// Kind of document being collaboratively viewed or edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Checklist,
    Template,
}

impl EntityType {
    pub const ALL: [EntityType; 2] = [EntityType::Checklist, EntityType::Template];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Checklist => "checklist",
            EntityType::Template => "template",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "checklist" => Ok(EntityType::Checklist),
            "template" => Ok(EntityType::Template),
            other => Err(SyncError::Validation(format!("unknown entity type '{other}'"))),
        }
    }
}

/// `(entity_type, entity_id)` pair identifying one collaborative document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }

    /// Broadcast topic for this entity: `entity_type:entity_id`.
    pub fn room_id(&self) -> String {
        format!("{}:{}", self.entity_type, self.entity_id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence
// ───────────────────────────────────────────────────────────────────

/// A user's presence on an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: String,
    pub user_name: String,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub joined_at: u64,
    pub last_activity: u64,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_ref: Option<String>,
    pub expires_at: u64,
}

impl Session {
    pub fn entity(&self) -> EntityRef {
        EntityRef::new(self.entity_type, self.entity_id.clone())
    }

    /// Milliseconds between joining and `now`.
    pub fn duration_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.joined_at)
    }
}

// ───────────────────────────────────────────────────────────────────
// Events
// ───────────────────────────────────────────────────────────────────

/// Immutable notification of a state change on an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: Uuid,
    pub event_type: String,
    pub user_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub data: Value,
    pub timestamp: u64,
    pub room_id: String,
    /// Sync-state version of the entity when the event was written.
    pub version: u64,
    pub expires_at: u64,
}

/// Event payload before it is stamped and persisted.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub user_id: String,
    pub entity: EntityRef,
    pub data: Value,
}

impl NewEvent {
    pub fn new(
        event_type: impl Into<String>,
        user_id: impl Into<String>,
        entity: EntityRef,
        data: Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            user_id: user_id.into(),
            entity,
            data,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Operations & sync state
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Delete,
    Update,
    Move,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Delete => "delete",
            OperationKind::Update => "update",
            OperationKind::Move => "move",
        }
    }

    /// Event type broadcast after an operation of this kind commits.
    pub fn event_type(&self) -> &'static str {
        match self {
            OperationKind::Update => "entity.item.changed",
            OperationKind::Insert | OperationKind::Delete | OperationKind::Move => "entity.updated",
        }
    }
}

/// One atomic, versioned edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub operation_id: Uuid,
    pub user_id: String,
    pub entity_id: String,
    pub entity_type: EntityType,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub path: String,
    #[serde(default)]
    pub old_value: Value,
    #[serde(default)]
    pub new_value: Value,
    pub timestamp: u64,
    /// Sync-state version after this operation was applied.
    pub version: u64,
}

/// Edit submitted by a caller, not yet versioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub old_value: Value,
    #[serde(default)]
    pub new_value: Value,
    #[serde(default)]
    pub entity_id: String,
    pub entity_type: EntityType,
}

/// Authoritative version record for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub version: u64,
    pub last_modified: u64,
    pub modified_by: String,
    pub checksum: String,
    pub operation_count: u64,
}

// ───────────────────────────────────────────────────────────────────
// Templates
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub items: Vec<TemplateItem>,
}

/// Template content. The semantic version lives on [`TemplateVersion`],
/// so two snapshots of identical content compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub sections: Vec<Section>,
}

/// `major.minor.patch` version label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemVer {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SemVer {
    pub const INITIAL: SemVer = SemVer { major: 1, minor: 0, patch: 0 };

    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    pub fn bump_patch(&self) -> Self {
        Self {
            patch: self.patch + 1,
            ..*self
        }
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for SemVer {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SyncError::Validation(format!("invalid semantic version '{s}'"));
        let mut parts = s.trim().split('.');
        let mut next = || -> Result<u32, SyncError> {
            parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())
        };
        let version = SemVer::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

impl Serialize for SemVer {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SemVer {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Immutable snapshot of a template plus history metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateVersion {
    pub version_id: Uuid,
    pub template_id: String,
    pub version: SemVer,
    pub description: String,
    pub created_by: String,
    pub created_at: u64,
    pub is_active: bool,
    pub is_published: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_version_id: Option<Uuid>,
    pub snapshot: Template,
}

// ───────────────────────────────────────────────────────────────────
// Callers
// ───────────────────────────────────────────────────────────────────

/// Role granted by the auth collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Editor,
    Admin,
}

/// Authenticated caller of a role-gated action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub user_id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }

    pub fn allows(&self, required: Role) -> bool {
        self.role >= required
    }
}
