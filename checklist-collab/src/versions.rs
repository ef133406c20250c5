//! Snapshot-based template history.
//!
//! Each template partition holds a head row plus one row per version:
//!
//! ```text
//! template_versions / {template_id} / head           VersionHead (JSON)
//!                                   / v:0000000001   TemplateVersion (LZ4 JSON)
//!                                   / v:0000000002   ...
//! ```
//!
//! The template's current content lives beside it in `templates / {id} /
//! current`. Creating a version commits the head (conditioned on its
//! revision), the deactivated previous version, the new version and the
//! current row in one batch, so exactly one version is active and the
//! current row matches it at every commit point.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLog};
use crate::error::{require, SyncError};
use crate::events::EventLog;
use crate::model::{now_millis, EntityRef, EntityType, NewEvent, SemVer, Template, TemplateVersion};
use crate::storage::{encode, Batch, Collection, Condition, ItemKey, Store, StoreError, StoredItem};
use crate::sync_state::RetryPolicy;

const HEAD_SORT: &str = "head";
const VERSION_PREFIX: &str = "v:";
const CURRENT_SORT: &str = "current";

/// What a save requires of the current template row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    /// The template must not exist yet
    Create,
    /// The template must already exist
    Update,
    /// Either way
    Upsert,
}

/// Per-template pointer to the active and latest versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionHead {
    active_version_id: Uuid,
    active_seq: u64,
    latest: SemVer,
    next_seq: u64,
}

fn head_key(template_id: &str) -> ItemKey {
    ItemKey::new(template_id, HEAD_SORT)
}

/// Key of the row holding a template's current content.
pub(crate) fn current_key(template_id: &str) -> ItemKey {
    ItemKey::new(template_id, CURRENT_SORT)
}

fn version_key(template_id: &str, seq: u64) -> ItemKey {
    ItemKey::new(template_id, format!("{VERSION_PREFIX}{seq:010}"))
}

fn compress_version(version: &TemplateVersion) -> Result<Vec<u8>, StoreError> {
    Ok(lz4_flex::compress_prepend_size(&encode(version)?))
}

fn decompress_version(item: &StoredItem) -> Result<TemplateVersion, StoreError> {
    let json = lz4_flex::decompress_size_prepended(&item.value)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| StoreError::DeserializationError(e.to_string()))
}

// ───────────────────────────────────────────────────────────────────
// Structural diff
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionChange {
    Added,
    Removed,
    Modified,
    Unchanged,
}

/// Classification of one section between two versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionDiff {
    pub section_id: String,
    pub title: String,
    pub change: SectionChange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_item_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_item_count: Option<usize>,
    /// New item count minus old item count
    pub item_delta: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionDiff {
    pub template_id: String,
    pub from_version: SemVer,
    pub to_version: SemVer,
    pub sections: Vec<SectionDiff>,
}

impl VersionDiff {
    pub fn count(&self, change: SectionChange) -> usize {
        self.sections.iter().filter(|s| s.change == change).count()
    }

    pub fn has_changes(&self) -> bool {
        self.sections.iter().any(|s| s.change != SectionChange::Unchanged)
    }
}

/// Compare two snapshots section by section, matching on section id.
/// Sections of `from` come first in their order, then sections only in `to`.
pub fn diff(from: &TemplateVersion, to: &TemplateVersion) -> VersionDiff {
    let new_sections: HashMap<&str, _> = to
        .snapshot
        .sections
        .iter()
        .map(|s| (s.id.as_str(), s))
        .collect();
    let mut sections = Vec::new();

    for old in &from.snapshot.sections {
        let old_count = old.items.len();
        let entry = match new_sections.get(old.id.as_str()) {
            None => SectionDiff {
                section_id: old.id.clone(),
                title: old.title.clone(),
                change: SectionChange::Removed,
                old_item_count: Some(old_count),
                new_item_count: None,
                item_delta: -(old_count as i64),
            },
            Some(new) => {
                let new_count = new.items.len();
                let change = if *new == old {
                    SectionChange::Unchanged
                } else {
                    SectionChange::Modified
                };
                SectionDiff {
                    section_id: old.id.clone(),
                    title: new.title.clone(),
                    change,
                    old_item_count: Some(old_count),
                    new_item_count: Some(new_count),
                    item_delta: new_count as i64 - old_count as i64,
                }
            }
        };
        sections.push(entry);
    }

    for new in &to.snapshot.sections {
        if !from.snapshot.sections.iter().any(|s| s.id == new.id) {
            sections.push(SectionDiff {
                section_id: new.id.clone(),
                title: new.title.clone(),
                change: SectionChange::Added,
                old_item_count: None,
                new_item_count: Some(new.items.len()),
                item_delta: new.items.len() as i64,
            });
        }
    }

    VersionDiff {
        template_id: to.template_id.clone(),
        from_version: from.version,
        to_version: to.version,
        sections,
    }
}

// ───────────────────────────────────────────────────────────────────
// Manager
// ───────────────────────────────────────────────────────────────────

pub struct TemplateVersionManager {
    store: Arc<dyn Store>,
    events: Arc<EventLog>,
    audit: AuditLog,
    retry: RetryPolicy,
}

impl TemplateVersionManager {
    pub fn new(store: Arc<dyn Store>, events: Arc<EventLog>, audit: AuditLog, retry: RetryPolicy) -> Self {
        Self {
            store,
            events,
            audit,
            retry,
        }
    }

    /// Record `template` as the new active version and make it the current
    /// content. The first version is 1.0.0; later ones bump the patch of
    /// the latest.
    pub async fn create_version(
        &self,
        template: &Template,
        description: &str,
        created_by: &str,
    ) -> Result<TemplateVersion, SyncError> {
        self.save(template, description, created_by, SaveMode::Upsert)
            .await
    }

    /// [`create_version`](Self::create_version) with a requirement on
    /// whether the template already exists, checked inside each attempt.
    pub async fn save(
        &self,
        template: &Template,
        description: &str,
        created_by: &str,
        mode: SaveMode,
    ) -> Result<TemplateVersion, SyncError> {
        require("templateId", &template.id)?;
        require("createdBy", created_by)?;

        let version = self
            .retry
            .run("create_version", || self.append(template, description, created_by, mode))
            .await?;

        log::info!(
            "Template {} now at version {} ({})",
            version.template_id,
            version.version,
            version.version_id
        );
        let entity = EntityRef::new(EntityType::Template, version.template_id.clone());
        let event = NewEvent::new(
            "template.version.created",
            created_by,
            entity.clone(),
            json!({
                "versionId": version.version_id,
                "version": version.version,
                "description": version.description,
                "parentVersionId": version.parent_version_id,
            }),
        );
        if let Err(e) = self.events.create_event(event) {
            log::warn!("Version {} committed but its event failed: {e}", version.version);
        }
        self.audit.record(
            AuditEntry::new("template.version.created", &entity, created_by).with_new(json!({
                "versionId": version.version_id,
                "version": version.version,
            })),
        );
        Ok(version)
    }

    fn append(
        &self,
        template: &Template,
        description: &str,
        created_by: &str,
        mode: SaveMode,
    ) -> Result<TemplateVersion, SyncError> {
        let tid = template.id.as_str();
        let current = self.store.get(Collection::Templates, &current_key(tid))?;
        match (mode, current.is_some()) {
            (SaveMode::Create, true) => {
                return Err(SyncError::Validation(format!("template {tid} already exists")));
            }
            (SaveMode::Update, false) => {
                return Err(SyncError::NotFound(format!("template {tid}")));
            }
            _ => {}
        }

        let head_item = self.store.get(Collection::TemplateVersions, &head_key(tid))?;
        let head: Option<VersionHead> = head_item.as_ref().map(|i| i.decode()).transpose()?;

        let mut batch = Batch::new();
        let (number, seq, parent) = match &head {
            Some(head) => {
                let key = version_key(tid, head.active_seq);
                let item = self
                    .store
                    .get(Collection::TemplateVersions, &key)?
                    .ok_or_else(|| {
                        SyncError::Storage(format!("active version row missing for template {tid}"))
                    })?;
                let mut previous = decompress_version(&item)?;
                previous.is_active = false;
                batch = batch.put(
                    Collection::TemplateVersions,
                    key,
                    compress_version(&previous)?,
                    None,
                    Condition::Revision(item.revision),
                );
                (head.latest.bump_patch(), head.next_seq, Some(head.active_version_id))
            }
            None => (SemVer::INITIAL, 1, None),
        };

        let version = TemplateVersion {
            version_id: Uuid::new_v4(),
            template_id: tid.to_string(),
            version: number,
            description: description.to_string(),
            created_by: created_by.to_string(),
            created_at: now_millis(),
            is_active: true,
            is_published: false,
            parent_version_id: parent,
            snapshot: template.clone(),
        };
        let new_head = VersionHead {
            active_version_id: version.version_id,
            active_seq: seq,
            latest: number,
            next_seq: seq + 1,
        };

        let batch = batch
            .put(
                Collection::TemplateVersions,
                head_key(tid),
                encode(&new_head)?,
                None,
                Condition::matching(head_item.as_ref()),
            )
            .put(
                Collection::TemplateVersions,
                version_key(tid, seq),
                compress_version(&version)?,
                None,
                Condition::Absent,
            )
            .put(
                Collection::Templates,
                current_key(tid),
                encode(template)?,
                None,
                Condition::matching(current.as_ref()),
            );
        self.store.write(batch)?;
        Ok(version)
    }

    /// Every version of a template, oldest first.
    pub fn get_template_versions(&self, template_id: &str) -> Result<Vec<TemplateVersion>, SyncError> {
        self.rows(template_id)?
            .into_iter()
            .map(|(_, _, v)| Ok(v))
            .collect()
    }

    fn rows(&self, template_id: &str) -> Result<Vec<(ItemKey, StoredItem, TemplateVersion)>, SyncError> {
        let mut rows = Vec::new();
        for (sort, item) in self
            .store
            .query(Collection::TemplateVersions, template_id, VERSION_PREFIX)?
        {
            let version = decompress_version(&item)?;
            rows.push((ItemKey::new(template_id, sort), item, version));
        }
        Ok(rows)
    }

    pub fn get_active_version(&self, template_id: &str) -> Result<Option<TemplateVersion>, SyncError> {
        let Some(head) = self.store.get(Collection::TemplateVersions, &head_key(template_id))? else {
            return Ok(None);
        };
        let head: VersionHead = head.decode()?;
        let item = self
            .store
            .get(Collection::TemplateVersions, &version_key(template_id, head.active_seq))?;
        Ok(item.map(|i| decompress_version(&i)).transpose()?)
    }

    pub fn get_version(
        &self,
        template_id: &str,
        version_id: Uuid,
    ) -> Result<Option<TemplateVersion>, SyncError> {
        Ok(self
            .rows(template_id)?
            .into_iter()
            .map(|(_, _, v)| v)
            .find(|v| v.version_id == version_id))
    }

    /// Look a version up by id or by its `major.minor.patch` label.
    pub fn get_version_by_ref(
        &self,
        template_id: &str,
        reference: &str,
    ) -> Result<Option<TemplateVersion>, SyncError> {
        if let Ok(id) = Uuid::parse_str(reference) {
            return self.get_version(template_id, id);
        }
        let Ok(label) = reference.parse::<SemVer>() else {
            return Err(SyncError::Validation(format!(
                "{reference:?} is neither a version id nor a version number"
            )));
        };
        // Labels are unique since every version bumps the latest.
        Ok(self
            .rows(template_id)?
            .into_iter()
            .map(|(_, _, v)| v)
            .find(|v| v.version == label))
    }

    /// Mark a version as published. Publishing twice is harmless.
    pub async fn publish_version(
        &self,
        template_id: &str,
        version_id: Uuid,
    ) -> Result<TemplateVersion, SyncError> {
        self.retry
            .run("publish_version", || {
                let Some((key, item, mut version)) = self
                    .rows(template_id)?
                    .into_iter()
                    .find(|(_, _, v)| v.version_id == version_id)
                else {
                    return Err(SyncError::NotFound(format!(
                        "version {version_id} of template {template_id}"
                    )));
                };
                if version.is_published {
                    return Ok(version);
                }
                version.is_published = true;
                self.store.put(
                    Collection::TemplateVersions,
                    key,
                    compress_version(&version)?,
                    None,
                    Condition::Revision(item.revision),
                )?;
                log::info!("Published template {template_id} version {}", version.version);
                Ok(version)
            })
            .await
    }

    /// Load two versions by reference and diff them.
    pub fn diff_versions(
        &self,
        template_id: &str,
        from: &str,
        to: &str,
    ) -> Result<VersionDiff, SyncError> {
        let load = |reference: &str| {
            self.get_version_by_ref(template_id, reference)?.ok_or_else(|| {
                SyncError::NotFound(format!("version {reference} of template {template_id}"))
            })
        };
        Ok(diff(&load(from)?, &load(to)?))
    }
}
