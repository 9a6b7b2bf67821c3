//! Tag intents: tag CRUD and task-tag associations.

use std::collections::HashMap;

use tracing::warn;

use super::{Intent, SyncOrchestrator};
use crate::activity::ActivityDraft;
use crate::error::{Error, Result};
use crate::model::{is_temp_id, Tag, TagScope};

impl SyncOrchestrator {
    /// Refetch-merge `scopes`; a failed refetch still bumps the version.
    async fn refresh_scopes(&self, scopes: &[TagScope]) {
        if let Err(err) = self.tags.invalidate(self.adapter.as_ref(), scopes).await {
            warn!(error = %err, "tag cache refetch failed");
            self.tags.touch();
        }
    }

    async fn lookup_tag(&self, tag_id: &str) -> Result<Tag> {
        if let Some(tag) = self.tags.find(tag_id) {
            return Ok(tag);
        }
        self.tags
            .list_every_tag(self.adapter.as_ref())
            .await?
            .into_iter()
            .find(|tag| tag.id == tag_id)
            .ok_or_else(|| Error::NotFound(format!("tag {tag_id}")))
    }

    /// Create a tag; names are unique per scope, ignoring case.
    pub async fn create_tag(&self, name: &str, scope: TagScope) -> Result<Tag> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("tag name cannot be empty".to_string()));
        }
        let existing = self
            .tags
            .tags_for_scope(self.adapter.as_ref(), &scope)
            .await?;
        if existing.iter().any(|tag| tag.name.eq_ignore_ascii_case(name)) {
            return Err(Error::Validation(format!("tag '{name}' already exists")));
        }

        let tag = self
            .adapter
            .create_tag(name, &scope)
            .await
            .inspect_err(|err| self.report(Intent::CreateTag, None, err))?;
        self.tags.upsert(&tag);
        self.refresh_scopes(&[scope]).await;
        Ok(tag)
    }

    /// Rename a tag; the new name must be free in the tag's scope.
    pub async fn rename_tag(&self, tag_id: &str, name: &str) -> Result<Tag> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("tag name cannot be empty".to_string()));
        }
        let current = self.lookup_tag(tag_id).await?;
        let siblings = self
            .tags
            .tags_for_scope(self.adapter.as_ref(), &current.scope())
            .await?;
        if siblings
            .iter()
            .any(|tag| tag.id != tag_id && tag.name.eq_ignore_ascii_case(name))
        {
            return Err(Error::Validation(format!("tag '{name}' already exists")));
        }

        let tag = self
            .adapter
            .rename_tag(tag_id, name)
            .await
            .inspect_err(|err| self.report(Intent::RenameTag, Some(tag_id), err))?;
        self.tags.upsert(&tag);
        self.store.retag(tag_id, Some(&tag));
        self.refresh_scopes(&[tag.scope()]).await;
        Ok(tag)
    }

    /// Delete a tag and its associations. Already-deleted tags are fine.
    pub async fn delete_tag(&self, tag_id: &str) -> Result<()> {
        let dropped = self.store.drop_tag(tag_id);

        match self.adapter.delete_tag(tag_id).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                for (task_id, idx, tag) in dropped.into_iter().rev() {
                    self.store.restore_tag_link(&task_id, idx, tag);
                }
                self.report(Intent::DeleteTag, Some(tag_id), &err);
                return Err(err);
            }
        }
        let scopes: Vec<TagScope> = self.tags.evict(tag_id).into_iter().collect();
        self.refresh_scopes(&scopes).await;
        Ok(())
    }

    /// Move a tag to another scope; both scopes are refreshed.
    pub async fn reassign_tag_scope(&self, tag_id: &str, scope: TagScope) -> Result<Tag> {
        let previous = self.tags.find(tag_id).map(|tag| tag.scope());
        let tag = self
            .adapter
            .reassign_tag_scope(tag_id, &scope)
            .await
            .inspect_err(|err| self.report(Intent::ReassignTagScope, Some(tag_id), err))?;
        self.tags.upsert(&tag);
        self.store.retag(tag_id, Some(&tag));

        let mut scopes: Vec<TagScope> = previous.into_iter().collect();
        scopes.push(scope);
        self.refresh_scopes(&scopes).await;
        Ok(tag)
    }

    pub async fn attach_tag(&self, task_id: &str, tag_id: &str) -> Result<()> {
        if is_temp_id(task_id) {
            return Err(Error::Validation(format!("task {task_id} is not saved yet")));
        }
        if !self.store.contains(task_id) {
            return Err(Error::NotFound(format!("task {task_id}")));
        }
        let tag = self.lookup_tag(tag_id).await?;
        if self.store.tags_for(task_id).iter().any(|t| t.id == tag.id) {
            return Ok(());
        }

        self.store.attach_tag(task_id, tag.clone());
        if let Err(err) = self.adapter.attach_tag(task_id, tag_id).await {
            self.store.detach_tag(task_id, tag_id);
            self.report(Intent::AttachTag, Some(task_id), &err);
            return Err(err);
        }
        self.activity
            .record(vec![ActivityDraft::tag_added(task_id, &tag)]);
        self.tags.touch();
        Ok(())
    }

    pub async fn detach_tag(&self, task_id: &str, tag_id: &str) -> Result<()> {
        if is_temp_id(task_id) {
            return Err(Error::Validation(format!("task {task_id} is not saved yet")));
        }
        let removed = self.store.detach_tag(task_id, tag_id);

        match self.adapter.detach_tag(task_id, tag_id).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                if let Some((idx, tag)) = removed {
                    self.store.restore_tag_link(task_id, idx, tag);
                }
                self.report(Intent::DetachTag, Some(task_id), &err);
                return Err(err);
            }
        }
        if let Some((_, tag)) = removed {
            self.activity
                .record(vec![ActivityDraft::tag_removed(task_id, &tag)]);
        }
        self.tags.touch();
        Ok(())
    }

    /// Tags visible from `project_id` (its own plus global ones).
    pub async fn list_tags(&self, project_id: Option<&str>) -> Result<Vec<Tag>> {
        self.tags
            .list_all_tags(self.adapter.as_ref(), project_id)
            .await
    }

    /// Open-task usage per tag id, computed on demand.
    pub fn tag_usage(&self) -> HashMap<String, usize> {
        self.tags.usage_counts(&self.store)
    }
}
