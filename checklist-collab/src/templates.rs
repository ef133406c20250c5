//! Current template content plus the save path every edit goes through.
//!
//! Saving records a new version and rewrites the `templates/{id}/current`
//! row in the same commit; a revert is simply a save of an old snapshot.

use serde_json::json;
use std::sync::Arc;

use crate::audit::{AuditEntry, AuditLog};
use crate::error::{require, SyncError};
use crate::events::EventLog;
use crate::model::{Actor, EntityRef, EntityType, NewEvent, Role, Template, TemplateVersion};
use crate::storage::{Collection, Store};
use crate::versions::{current_key, SaveMode, TemplateVersionManager};

pub struct TemplateService {
    store: Arc<dyn Store>,
    versions: Arc<TemplateVersionManager>,
    events: Arc<EventLog>,
    audit: AuditLog,
}

impl TemplateService {
    pub fn new(
        store: Arc<dyn Store>,
        versions: Arc<TemplateVersionManager>,
        events: Arc<EventLog>,
        audit: AuditLog,
    ) -> Self {
        Self {
            store,
            versions,
            events,
            audit,
        }
    }

    fn authorize(actor: &Actor, action: &str) -> Result<(), SyncError> {
        require("userId", &actor.user_id)?;
        if !actor.allows(Role::Editor) {
            return Err(SyncError::Permission(format!(
                "{} may not {action} templates",
                actor.user_id
            )));
        }
        Ok(())
    }

    /// Store a new template and record its first version.
    pub async fn create_template(
        &self,
        template: &Template,
        actor: &Actor,
    ) -> Result<TemplateVersion, SyncError> {
        require("id", &template.id)?;
        require("name", &template.name)?;
        Self::authorize(actor, "create")?;

        let version = self
            .versions
            .save(template, "Initial version", &actor.user_id, SaveMode::Create)
            .await?;
        log::info!("{} created template {}", actor.user_id, template.id);
        Ok(version)
    }

    /// Overwrite an existing template and record the new version.
    pub async fn update_template(
        &self,
        template: &Template,
        description: &str,
        actor: &Actor,
    ) -> Result<TemplateVersion, SyncError> {
        require("id", &template.id)?;
        require("name", &template.name)?;
        Self::authorize(actor, "update")?;

        self.versions
            .save(template, description, &actor.user_id, SaveMode::Update)
            .await
    }

    pub fn get_template(&self, template_id: &str) -> Result<Option<Template>, SyncError> {
        Ok(self
            .store
            .get(Collection::Templates, &current_key(template_id))?
            .map(|item| item.decode())
            .transpose()?)
    }

    /// Make an old snapshot current again by saving it as a new version.
    /// `reference` is a version id or a version number such as `1.0.0`.
    pub async fn revert_to_version(
        &self,
        template_id: &str,
        reference: &str,
        actor: &Actor,
    ) -> Result<Template, SyncError> {
        require("templateId", template_id)?;
        require("versionId", reference)?;
        Self::authorize(actor, "revert")?;

        let target = self
            .versions
            .get_version_by_ref(template_id, reference)?
            .ok_or_else(|| {
                SyncError::NotFound(format!("version {reference} of template {template_id}"))
            })?;

        let description = format!("Reverted to version {}", target.version);
        let created = self
            .update_template(&target.snapshot, &description, actor)
            .await?;
        log::info!(
            "{} reverted template {template_id} to {} as {}",
            actor.user_id,
            target.version,
            created.version
        );

        let entity = EntityRef::new(EntityType::Template, template_id);
        let event = NewEvent::new(
            "template.reverted",
            actor.user_id.clone(),
            entity.clone(),
            json!({
                "revertedTo": target.version,
                "revertedToVersionId": target.version_id,
                "versionId": created.version_id,
                "version": created.version,
            }),
        );
        if let Err(e) = self.events.create_event(event) {
            log::warn!("Revert of {template_id} committed but its event failed: {e}");
        }
        self.audit.record(
            AuditEntry::new("template.reverted", &entity, actor.user_id.clone())
                .with_old(json!({ "versionId": target.version_id, "version": target.version }))
                .with_new(json!({ "versionId": created.version_id, "version": created.version })),
        );
        Ok(target.snapshot)
    }
}
