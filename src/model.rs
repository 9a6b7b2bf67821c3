//! Records shared by the store, the sync pipeline and both storage backends.
//!
//! Every record serialises to the flat snake_case row shape used by the
//! remote service, the SQLite tables and the backup archive.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Prefix of locally generated ids that the backend has not confirmed yet.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Cache key of the global tag scope.
pub const GLOBAL_SCOPE: &str = "global";

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// File attached to a task. Immutable once uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub url: String,
    pub filename: String,
    pub original_name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub content_type: String,
    pub uploaded_at: DateTime<Utc>,
}

impl Attachment {
    /// Identity used when diffing attachment lists.
    pub fn identity(&self) -> (&str, &str, &str) {
        (&self.id, &self.url, &self.filename)
    }
}

/// Which of the three mutually exclusive collections a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Active,
    Trashed,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Owner id, or the anonymous session id when unauthenticated.
    pub user_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub sort_order: f64,
    #[serde(default)]
    pub flagged: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub abandoned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abandoned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn partition(&self) -> Partition {
        if self.deleted {
            Partition::Trashed
        } else if self.abandoned {
            Partition::Abandoned
        } else {
            Partition::Active
        }
    }

    /// Trashed and abandoned are exclusive soft states over one record.
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::Validation("task title cannot be empty".to_string()));
        }
        if self.deleted && self.abandoned {
            return Err(Error::Validation(format!(
                "task {} cannot be both trashed and abandoned",
                self.id
            )));
        }
        if !self.sort_order.is_finite() {
            return Err(Error::Validation(format!(
                "task {} has a non-finite sort order",
                self.id
            )));
        }
        Ok(())
    }

    /// Counts toward tag usage: visible, open and not given up.
    pub fn is_open(&self) -> bool {
        !self.deleted && !self.abandoned && !self.completed
    }
}

/// Input for creating a task; the backend assigns id, owner and timestamps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub sort_order: f64,
    #[serde(default)]
    pub flagged: bool,
}

impl NewTask {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::Validation("task title cannot be empty".to_string()));
        }
        if !self.sort_order.is_finite() {
            return Err(Error::Validation("sort order must be finite".to_string()));
        }
        Ok(())
    }

    /// Materialise the record with the given identity.
    pub fn into_task(self, id: String, user_id: String, now: DateTime<Utc>) -> Task {
        Task {
            id,
            user_id,
            title: self.title,
            description: self.description,
            completed: false,
            completed_at: None,
            date: self.date,
            project_id: self.project_id,
            attachments: self.attachments,
            sort_order: self.sort_order,
            flagged: self.flagged,
            deleted: false,
            deleted_at: None,
            abandoned: false,
            abandoned_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update. Outer `None` means "not part of the update";
/// `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub completed: Option<bool>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub date: Option<Option<NaiveDate>>,
    pub project_id: Option<Option<String>>,
    pub attachments: Option<Vec<Attachment>>,
    pub sort_order: Option<f64>,
    pub flagged: Option<bool>,
    pub deleted: Option<bool>,
    pub deleted_at: Option<Option<DateTime<Utc>>>,
    pub abandoned: Option<bool>,
    pub abandoned_at: Option<Option<DateTime<Utc>>>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        *self == TaskPatch::default()
    }

    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn completed(completed: bool) -> Self {
        Self {
            completed: Some(completed),
            ..Self::default()
        }
    }

    pub fn sort_order(sort_order: f64) -> Self {
        Self {
            sort_order: Some(sort_order),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(title) = &self.title {
            if title.trim().is_empty() {
                return Err(Error::Validation("task title cannot be empty".to_string()));
            }
        }
        if let Some(order) = self.sort_order {
            if !order.is_finite() {
                return Err(Error::Validation("sort order must be finite".to_string()));
            }
        }
        if self.deleted == Some(true) && self.abandoned == Some(true) {
            return Err(Error::Validation(
                "a task cannot be trashed and abandoned at once".to_string(),
            ));
        }
        Ok(())
    }

    /// Write every field present in the patch onto `task`.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(title) = &self.title {
            task.title = title.clone();
        }
        if let Some(description) = &self.description {
            task.description = description.clone();
        }
        if let Some(completed) = self.completed {
            task.completed = completed;
        }
        if let Some(completed_at) = self.completed_at {
            task.completed_at = completed_at;
        }
        if let Some(date) = self.date {
            task.date = date;
        }
        if let Some(project_id) = &self.project_id {
            task.project_id = project_id.clone();
        }
        if let Some(attachments) = &self.attachments {
            task.attachments = attachments.clone();
        }
        if let Some(sort_order) = self.sort_order {
            task.sort_order = sort_order;
        }
        if let Some(flagged) = self.flagged {
            task.flagged = flagged;
        }
        if let Some(deleted) = self.deleted {
            task.deleted = deleted;
        }
        if let Some(deleted_at) = self.deleted_at {
            task.deleted_at = deleted_at;
        }
        if let Some(abandoned) = self.abandoned {
            task.abandoned = abandoned;
        }
        if let Some(abandoned_at) = self.abandoned_at {
            task.abandoned_at = abandoned_at;
        }
    }

    /// Copy the fields named by this patch from `source` onto `target`,
    /// skipping any field whose local value no longer matches `expected`
    /// (a newer local edit landed while the save was in flight).
    pub fn merge_confirmed(&self, expected: &Task, source: &Task, target: &mut Task) {
        macro_rules! adopt {
            ($field:ident) => {
                if self.$field.is_some() && target.$field == expected.$field {
                    target.$field = source.$field.clone();
                }
            };
        }
        adopt!(title);
        adopt!(description);
        adopt!(completed);
        adopt!(completed_at);
        adopt!(date);
        adopt!(project_id);
        adopt!(attachments);
        adopt!(sort_order);
        adopt!(flagged);
        adopt!(deleted);
        adopt!(deleted_at);
        adopt!(abandoned);
        adopt!(abandoned_at);
        target.updated_at = source.updated_at;
    }

    /// Row patch in the remote service's column shape.
    pub fn to_row(&self) -> Result<Map<String, Value>> {
        let mut row = Map::new();
        fn put<T: Serialize>(row: &mut Map<String, Value>, key: &str, value: &T) -> Result<()> {
            row.insert(key.to_string(), serde_json::to_value(value)?);
            Ok(())
        }
        if let Some(title) = &self.title {
            put(&mut row, "title", title)?;
        }
        if let Some(description) = &self.description {
            put(&mut row, "description", description)?;
        }
        if let Some(completed) = &self.completed {
            put(&mut row, "completed", completed)?;
        }
        if let Some(completed_at) = &self.completed_at {
            put(&mut row, "completed_at", completed_at)?;
        }
        if let Some(date) = &self.date {
            put(&mut row, "date", date)?;
        }
        if let Some(project_id) = &self.project_id {
            put(&mut row, "project_id", project_id)?;
        }
        if let Some(attachments) = &self.attachments {
            put(&mut row, "attachments", attachments)?;
        }
        if let Some(sort_order) = &self.sort_order {
            put(&mut row, "sort_order", sort_order)?;
        }
        if let Some(flagged) = &self.flagged {
            put(&mut row, "flagged", flagged)?;
        }
        if let Some(deleted) = &self.deleted {
            put(&mut row, "deleted", deleted)?;
        }
        if let Some(deleted_at) = &self.deleted_at {
            put(&mut row, "deleted_at", deleted_at)?;
        }
        if let Some(abandoned) = &self.abandoned {
            put(&mut row, "abandoned", abandoned)?;
        }
        if let Some(abandoned_at) = &self.abandoned_at {
            put(&mut row, "abandoned_at", abandoned_at)?;
        }
        Ok(row)
    }
}

/// Tag visibility scope: every list, or a single project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagScope {
    Global,
    Project(String),
}

impl TagScope {
    pub fn from_project(project_id: Option<&str>) -> Self {
        match project_id {
            Some(id) => TagScope::Project(id.to_string()),
            None => TagScope::Global,
        }
    }

    pub fn project_id(&self) -> Option<&str> {
        match self {
            TagScope::Global => None,
            TagScope::Project(id) => Some(id),
        }
    }

    pub fn cache_key(&self) -> &str {
        match self {
            TagScope::Global => GLOBAL_SCOPE,
            TagScope::Project(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub user_id: String,
    pub name: String,
    /// `None` is the global scope.
    pub project_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Tag {
    pub fn scope(&self) -> TagScope {
        TagScope::from_project(self.project_id.as_deref())
    }
}

/// Many-to-many association between tasks and tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskTagLink {
    pub task_id: String,
    pub tag_id: String,
}

/// A task list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub sort_order: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub sort_order: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<i64>,
}

impl ProjectPatch {
    pub fn apply_to(&self, project: &mut Project) {
        if let Some(name) = &self.name {
            project.name = name.clone();
        }
        if let Some(icon) = &self.icon {
            project.icon = icon.clone();
        }
        if let Some(color) = &self.color {
            project.color = color.clone();
        }
        if let Some(sort_order) = self.sort_order {
            project.sort_order = sort_order;
        }
    }
}

/// A project shared with another user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectShare {
    pub project_id: String,
    pub user_id: String,
    #[serde(default)]
    pub can_edit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    Created,
    TitleChanged,
    DescriptionChanged,
    StatusChanged,
    DueDateChanged,
    ProjectChanged,
    TagAdded,
    TagRemoved,
    AttachmentsUpdated,
    MovedToTrash,
    Restored,
    Abandoned,
    Reactivated,
}

impl ActivityAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityAction::Created => "created",
            ActivityAction::TitleChanged => "title_changed",
            ActivityAction::DescriptionChanged => "description_changed",
            ActivityAction::StatusChanged => "status_changed",
            ActivityAction::DueDateChanged => "due_date_changed",
            ActivityAction::ProjectChanged => "project_changed",
            ActivityAction::TagAdded => "tag_added",
            ActivityAction::TagRemoved => "tag_removed",
            ActivityAction::AttachmentsUpdated => "attachments_updated",
            ActivityAction::MovedToTrash => "moved_to_trash",
            ActivityAction::Restored => "restored",
            ActivityAction::Abandoned => "abandoned",
            ActivityAction::Reactivated => "reactivated",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let action = match raw {
            "created" => ActivityAction::Created,
            "title_changed" => ActivityAction::TitleChanged,
            "description_changed" => ActivityAction::DescriptionChanged,
            "status_changed" => ActivityAction::StatusChanged,
            "due_date_changed" => ActivityAction::DueDateChanged,
            "project_changed" => ActivityAction::ProjectChanged,
            "tag_added" => ActivityAction::TagAdded,
            "tag_removed" => ActivityAction::TagRemoved,
            "attachments_updated" => ActivityAction::AttachmentsUpdated,
            "moved_to_trash" => ActivityAction::MovedToTrash,
            "restored" => ActivityAction::Restored,
            "abandoned" => ActivityAction::Abandoned,
            "reactivated" => ActivityAction::Reactivated,
            _ => return None,
        };
        Some(action)
    }
}

/// Append-only change record. Never mutated or deleted by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: String,
    pub task_id: String,
    pub user_id: String,
    pub action: ActivityAction,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}
