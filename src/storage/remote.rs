//! Remote backend over a row-level relational service.
//!
//! The service itself is an external collaborator reached through
//! [`RemoteService`]: plain row CRUD plus per-table change feeds. Ownership
//! and sharing rules are enforced here, before any row is written:
//!
//! - rows owned by the session user are fully writable
//! - rows in a project shared with the user are readable, and writable when
//!   the share carries `can_edit`
//! - project metadata and membership stay with the project owner

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{ChangeNotification, StorageAdapter, SubscriptionHandle, Table, TaskFilter};
use crate::config::StorageMode;
use crate::error::{Error, Result};
use crate::model::{
    ActivityRecord, NewProject, NewTask, Project, ProjectPatch, ProjectShare, Tag, TagScope, Task,
    TaskPatch, TaskTagLink,
};
use crate::reorder::compare_orders;

/// Prefix of the session id used when nobody is signed in.
pub const ANONYMOUS_PREFIX: &str = "anon-";

/// Owner-scoped feeds opened by every subscription (tasks, projects, tags).
pub const OWNER_FEEDS: usize = 3;

/// A row in the service's column shape.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
}

/// Conjunction of column conditions. Missing columns read as `null`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowFilter {
    pub conditions: Vec<Condition>,
}

impl RowFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push(Condition::Eq(column.to_string(), value.into()));
        self
    }

    pub fn in_list<I, V>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.conditions.push(Condition::In(
            column.to_string(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn is_null(mut self, column: &str) -> Self {
        self.conditions.push(Condition::IsNull(column.to_string()));
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Eq(column, value) => row.get(column).unwrap_or(&Value::Null) == value,
            Condition::In(column, values) => {
                values.contains(row.get(column).unwrap_or(&Value::Null))
            }
            Condition::IsNull(column) => row.get(column).map_or(true, Value::is_null),
        })
    }
}

/// Row-level contract of the hosted backend.
///
/// `insert` assigns an `id` on tables that have one when the row lacks it.
/// Every call may fail with [`Error::Transient`].
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn select(&self, table: Table, filter: &RowFilter) -> Result<Vec<Row>>;

    async fn insert(&self, table: Table, row: Row) -> Result<Row>;

    async fn upsert(&self, table: Table, row: Row) -> Result<Row>;

    /// Merge `patch` into every matching row; returns the updated rows.
    async fn update(&self, table: Table, filter: &RowFilter, patch: Row) -> Result<Vec<Row>>;

    async fn delete(&self, table: Table, filter: &RowFilter) -> Result<usize>;

    async fn subscribe(
        &self,
        table: Table,
        filter: RowFilter,
    ) -> Result<mpsc::UnboundedReceiver<ChangeNotification>>;
}

fn to_row<T: Serialize>(value: &T) -> Result<Row> {
    match serde_json::to_value(value)? {
        Value::Object(row) => Ok(row),
        other => Err(Error::Validation(format!("expected a record, got {other}"))),
    }
}

fn from_row<T: DeserializeOwned>(row: Row) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(row))?)
}

fn from_rows<T: DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<T>> {
    rows.into_iter().map(from_row).collect()
}

fn by_id(id: &str) -> RowFilter {
    RowFilter::new().eq("id", id)
}

fn dedupe_rows(rows: impl IntoIterator<Item = Row>) -> Vec<Row> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|row| match row.get("id").and_then(Value::as_str) {
            Some(id) => seen.insert(id.to_string()),
            None => true,
        })
        .collect()
}

fn validate_tag_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::Validation("tag name cannot be empty".to_string()));
    }
    Ok(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Access {
    None,
    Viewer,
    Editor,
    Owner,
}

impl Access {
    fn can_read(self) -> bool {
        self >= Access::Viewer
    }

    fn can_write(self) -> bool {
        self >= Access::Editor
    }
}

fn spawn_forwarder(
    mut upstream: mpsc::UnboundedReceiver<ChangeNotification>,
    downstream: mpsc::UnboundedSender<ChangeNotification>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = upstream.recv().await {
            if downstream.send(notification).is_err() {
                break;
            }
        }
    })
}

/// [`StorageAdapter`] over a [`RemoteService`] session.
pub struct RemoteAdapter {
    service: Arc<dyn RemoteService>,
    user_id: String,
    anonymous: bool,
    chunk_size: usize,
}

impl RemoteAdapter {
    /// `user_id` of `None` starts an anonymous session with a fresh id.
    pub fn new(service: Arc<dyn RemoteService>, user_id: Option<String>, chunk_size: usize) -> Self {
        let (user_id, anonymous) = match user_id {
            Some(user_id) => (user_id, false),
            None => (format!("{ANONYMOUS_PREFIX}{}", Uuid::new_v4()), true),
        };
        Self {
            service,
            user_id,
            anonymous,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    async fn my_shares(&self) -> Result<Vec<ProjectShare>> {
        let rows = self
            .service
            .select(
                Table::ProjectShares,
                &RowFilter::new().eq("user_id", self.user_id.as_str()),
            )
            .await?;
        from_rows(rows)
    }

    async fn shared_project_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .my_shares()
            .await?
            .into_iter()
            .map(|share| share.project_id)
            .collect())
    }

    async fn find_project(&self, id: &str) -> Result<Option<Project>> {
        let mut rows = self.service.select(Table::Projects, &by_id(id)).await?;
        rows.pop().map(from_row).transpose()
    }

    async fn find_task(&self, id: &str) -> Result<Option<Task>> {
        let mut rows = self.service.select(Table::Tasks, &by_id(id)).await?;
        rows.pop().map(from_row).transpose()
    }

    async fn find_tag(&self, id: &str) -> Result<Option<Tag>> {
        let mut rows = self.service.select(Table::Tags, &by_id(id)).await?;
        rows.pop().map(from_row).transpose()
    }

    async fn project_access(&self, project_id: &str) -> Result<Access> {
        let Some(project) = self.find_project(project_id).await? else {
            return Ok(Access::None);
        };
        if project.user_id == self.user_id {
            return Ok(Access::Owner);
        }
        let shares = self
            .service
            .select(
                Table::ProjectShares,
                &RowFilter::new()
                    .eq("project_id", project_id)
                    .eq("user_id", self.user_id.as_str()),
            )
            .await?;
        let access = match from_rows::<ProjectShare>(shares)?.first() {
            Some(share) if share.can_edit => Access::Editor,
            Some(_) => Access::Viewer,
            None => Access::None,
        };
        Ok(access)
    }

    async fn require_project_write(&self, project_id: &str) -> Result<()> {
        match self.project_access(project_id).await? {
            access if access.can_write() => Ok(()),
            Access::Viewer => Err(Error::Permission(format!(
                "project {project_id} is shared read-only"
            ))),
            _ => Err(Error::Permission(format!(
                "no access to project {project_id}"
            ))),
        }
    }

    async fn require_project_owner(&self, project: &Project) -> Result<()> {
        if project.user_id == self.user_id {
            Ok(())
        } else {
            Err(Error::Permission(format!(
                "only the owner can change project {}",
                project.id
            )))
        }
    }

    /// Owned rows are fully writable; other rows inherit their project's share.
    async fn row_access(&self, owner: &str, project_id: Option<&str>) -> Result<Access> {
        if owner == self.user_id {
            return Ok(Access::Owner);
        }
        match project_id {
            Some(project_id) => Ok(self.project_access(project_id).await?.min(Access::Editor)),
            None => Ok(Access::None),
        }
    }

    async fn require_task_write(&self, task: &Task) -> Result<()> {
        let access = self
            .row_access(&task.user_id, task.project_id.as_deref())
            .await?;
        if access.can_write() {
            Ok(())
        } else {
            Err(Error::Permission(format!("cannot modify task {}", task.id)))
        }
    }

    async fn require_task_read(&self, task: &Task) -> Result<()> {
        let access = self
            .row_access(&task.user_id, task.project_id.as_deref())
            .await?;
        if access.can_read() {
            Ok(())
        } else {
            Err(Error::Permission(format!("no access to task {}", task.id)))
        }
    }

    async fn require_tag_read(&self, tag: &Tag) -> Result<()> {
        let access = self
            .row_access(&tag.user_id, tag.project_id.as_deref())
            .await?;
        if access.can_read() {
            Ok(())
        } else {
            Err(Error::Permission(format!("no access to tag {}", tag.id)))
        }
    }

    async fn require_tag_write(&self, tag: &Tag) -> Result<()> {
        let access = self
            .row_access(&tag.user_id, tag.project_id.as_deref())
            .await?;
        if access.can_write() {
            Ok(())
        } else {
            Err(Error::Permission(format!("cannot modify tag {}", tag.id)))
        }
    }

    async fn require_scope_write(&self, scope: &TagScope) -> Result<()> {
        match scope {
            TagScope::Global => Ok(()),
            TagScope::Project(project_id) => self.require_project_write(project_id).await,
        }
    }

    /// Select `base` for the user's own rows plus rows in shared projects.
    async fn select_visible(
        &self,
        table: Table,
        base: RowFilter,
        shared_column: &str,
    ) -> Result<Vec<Row>> {
        let mut rows = self
            .service
            .select(table, &base.clone().eq("user_id", self.user_id.as_str()))
            .await?;
        let shared = self.shared_project_ids().await?;
        for chunk in shared.chunks(self.chunk_size) {
            let filter = base.clone().in_list(shared_column, chunk.iter().cloned());
            rows.extend(self.service.select(table, &filter).await?);
        }
        Ok(dedupe_rows(rows))
    }

    async fn select_in_chunks(
        &self,
        table: Table,
        column: &str,
        values: &[String],
    ) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        for chunk in values.chunks(self.chunk_size) {
            let filter = RowFilter::new().in_list(column, chunk.iter().cloned());
            rows.extend(self.service.select(table, &filter).await?);
        }
        Ok(rows)
    }
}

#[async_trait]
impl StorageAdapter for RemoteAdapter {
    fn mode(&self) -> StorageMode {
        StorageMode::Remote
    }

    fn owner_id(&self) -> &str {
        &self.user_id
    }

    async fn create_task(&self, task: NewTask) -> Result<Task> {
        task.validate()?;
        if let Some(project_id) = &task.project_id {
            self.require_project_write(project_id).await?;
        }
        let task = task.into_task(String::new(), self.user_id.clone(), Utc::now());
        let mut row = to_row(&task)?;
        row.remove("id");
        from_row(self.service.insert(Table::Tasks, row).await?)
    }

    async fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<Task> {
        patch.validate()?;
        let current = self
            .find_task(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        self.require_task_write(&current).await?;
        if let Some(Some(project_id)) = &patch.project_id {
            if current.project_id.as_deref() != Some(project_id.as_str()) {
                self.require_project_write(project_id).await?;
            }
        }

        let mut preview = current;
        patch.apply_to(&mut preview);
        preview.validate()?;

        let mut row = patch.to_row()?;
        row.insert("updated_at".to_string(), serde_json::to_value(Utc::now())?);
        let mut updated = self.service.update(Table::Tasks, &by_id(id), row).await?;
        match updated.pop() {
            Some(row) => from_row(row),
            None => Err(Error::NotFound(format!("task {id}"))),
        }
    }

    async fn delete_task(&self, id: &str) -> Result<bool> {
        let Some(task) = self.find_task(id).await? else {
            return Ok(false);
        };
        self.require_task_write(&task).await?;
        self.service
            .delete(Table::TaskTags, &RowFilter::new().eq("task_id", id))
            .await?;
        Ok(self.service.delete(Table::Tasks, &by_id(id)).await? > 0)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut base = RowFilter::new();
        if let Some(deleted) = filter.deleted {
            base = base.eq("deleted", deleted);
        }
        if let Some(abandoned) = filter.abandoned {
            base = base.eq("abandoned", abandoned);
        }
        if let Some(scope) = &filter.scope {
            base = base.eq("project_id", scope.as_str());
        }
        let rows = self.select_visible(Table::Tasks, base, "project_id").await?;
        let mut tasks: Vec<Task> = from_rows(rows)?;
        tasks.sort_by(|a, b| {
            compare_orders(a.sort_order, b.sort_order).then(a.created_at.cmp(&b.created_at))
        });
        Ok(tasks)
    }

    async fn put_task(&self, task: &Task) -> Result<()> {
        task.validate()?;
        if let Some(existing) = self.find_task(&task.id).await? {
            self.require_task_write(&existing).await?;
            if existing.user_id != task.user_id {
                return Err(Error::Permission(format!(
                    "task {} belongs to {}",
                    task.id, existing.user_id
                )));
            }
        }
        self.require_task_write(task).await?;
        self.service.upsert(Table::Tasks, to_row(task)?).await?;
        Ok(())
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = self
            .select_visible(Table::Projects, RowFilter::new(), "id")
            .await?;
        let mut projects: Vec<Project> = from_rows(rows)?;
        projects.sort_by(|a, b| {
            a.sort_order
                .cmp(&b.sort_order)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(projects)
    }

    async fn create_project(&self, project: NewProject) -> Result<Project> {
        let name = project.name.trim();
        if name.is_empty() {
            return Err(Error::Validation("project name cannot be empty".to_string()));
        }
        let now = Utc::now();
        let project = Project {
            id: String::new(),
            user_id: self.user_id.clone(),
            name: name.to_string(),
            icon: project.icon,
            color: project.color,
            sort_order: project.sort_order,
            created_at: now,
            updated_at: now,
        };
        let mut row = to_row(&project)?;
        row.remove("id");
        from_row(self.service.insert(Table::Projects, row).await?)
    }

    async fn update_project(&self, id: &str, patch: &ProjectPatch) -> Result<Project> {
        let project = self
            .find_project(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("project {id}")))?;
        self.require_project_owner(&project).await?;
        if let Some(name) = &patch.name {
            if name.trim().is_empty() {
                return Err(Error::Validation("project name cannot be empty".to_string()));
            }
        }
        let mut row = to_row(patch)?;
        row.insert("updated_at".to_string(), serde_json::to_value(Utc::now())?);
        let mut updated = self.service.update(Table::Projects, &by_id(id), row).await?;
        match updated.pop() {
            Some(row) => from_row(row),
            None => Err(Error::NotFound(format!("project {id}"))),
        }
    }

    async fn delete_project(&self, id: &str) -> Result<bool> {
        let Some(project) = self.find_project(id).await? else {
            return Ok(false);
        };
        self.require_project_owner(&project).await?;

        let scoped_tags: Vec<Tag> = from_rows(
            self.service
                .select(Table::Tags, &RowFilter::new().eq("project_id", id))
                .await?,
        )?;
        let tag_ids: Vec<String> = scoped_tags.into_iter().map(|tag| tag.id).collect();
        for chunk in tag_ids.chunks(self.chunk_size) {
            self.service
                .delete(
                    Table::TaskTags,
                    &RowFilter::new().in_list("tag_id", chunk.iter().cloned()),
                )
                .await?;
        }
        self.service
            .delete(Table::Tags, &RowFilter::new().eq("project_id", id))
            .await?;

        let mut unscope = Row::new();
        unscope.insert("project_id".to_string(), Value::Null);
        unscope.insert("updated_at".to_string(), serde_json::to_value(Utc::now())?);
        self.service
            .update(Table::Tasks, &RowFilter::new().eq("project_id", id), unscope)
            .await?;
        self.service
            .delete(Table::ProjectShares, &RowFilter::new().eq("project_id", id))
            .await?;
        Ok(self.service.delete(Table::Projects, &by_id(id)).await? > 0)
    }

    async fn put_project(&self, project: &Project) -> Result<()> {
        if let Some(existing) = self.find_project(&project.id).await? {
            self.require_project_owner(&existing).await?;
        }
        if project.user_id != self.user_id {
            return Err(Error::Permission(format!(
                "project {} belongs to another user",
                project.id
            )));
        }
        self.service.upsert(Table::Projects, to_row(project)?).await?;
        Ok(())
    }

    async fn share_project(&self, share: &ProjectShare) -> Result<()> {
        if self.anonymous {
            return Err(Error::Validation(
                "sharing requires a signed-in session".to_string(),
            ));
        }
        let project = self
            .find_project(&share.project_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("project {}", share.project_id)))?;
        self.require_project_owner(&project).await?;
        if share.user_id == self.user_id {
            return Err(Error::Validation(
                "cannot share a project with its owner".to_string(),
            ));
        }
        self.service
            .upsert(Table::ProjectShares, to_row(share)?)
            .await?;
        Ok(())
    }

    async fn unshare_project(&self, project_id: &str, user_id: &str) -> Result<bool> {
        if self.anonymous {
            return Err(Error::Validation(
                "sharing requires a signed-in session".to_string(),
            ));
        }
        let Some(project) = self.find_project(project_id).await? else {
            return Ok(false);
        };
        self.require_project_owner(&project).await?;
        let removed = self
            .service
            .delete(
                Table::ProjectShares,
                &RowFilter::new()
                    .eq("project_id", project_id)
                    .eq("user_id", user_id),
            )
            .await?;
        Ok(removed > 0)
    }

    async fn list_tags(&self, scope: Option<&TagScope>) -> Result<Vec<Tag>> {
        let rows = match scope {
            None => {
                self.select_visible(Table::Tags, RowFilter::new(), "project_id")
                    .await?
            }
            Some(TagScope::Global) => {
                self.service
                    .select(
                        Table::Tags,
                        &RowFilter::new()
                            .is_null("project_id")
                            .eq("user_id", self.user_id.as_str()),
                    )
                    .await?
            }
            Some(TagScope::Project(project_id)) => {
                if !self.project_access(project_id).await?.can_read() {
                    return Err(Error::Permission(format!(
                        "no access to project {project_id}"
                    )));
                }
                self.service
                    .select(
                        Table::Tags,
                        &RowFilter::new().eq("project_id", project_id.as_str()),
                    )
                    .await?
            }
        };
        let mut tags: Vec<Tag> = from_rows(rows)?;
        tags.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tags)
    }

    async fn create_tag(&self, name: &str, scope: &TagScope) -> Result<Tag> {
        let name = validate_tag_name(name)?;
        self.require_scope_write(scope).await?;
        let tag = Tag {
            id: String::new(),
            user_id: self.user_id.clone(),
            name: name.to_string(),
            project_id: scope.project_id().map(str::to_string),
            created_at: Utc::now(),
        };
        let mut row = to_row(&tag)?;
        row.remove("id");
        from_row(self.service.insert(Table::Tags, row).await?)
    }

    async fn rename_tag(&self, id: &str, name: &str) -> Result<Tag> {
        let name = validate_tag_name(name)?;
        let tag = self
            .find_tag(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("tag {id}")))?;
        self.require_tag_write(&tag).await?;
        let mut row = Row::new();
        row.insert("name".to_string(), Value::from(name));
        let mut updated = self.service.update(Table::Tags, &by_id(id), row).await?;
        match updated.pop() {
            Some(row) => from_row(row),
            None => Err(Error::NotFound(format!("tag {id}"))),
        }
    }

    async fn delete_tag(&self, id: &str) -> Result<bool> {
        let Some(tag) = self.find_tag(id).await? else {
            return Ok(false);
        };
        self.require_tag_write(&tag).await?;
        self.service
            .delete(Table::TaskTags, &RowFilter::new().eq("tag_id", id))
            .await?;
        Ok(self.service.delete(Table::Tags, &by_id(id)).await? > 0)
    }

    async fn reassign_tag_scope(&self, id: &str, scope: &TagScope) -> Result<Tag> {
        let tag = self
            .find_tag(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("tag {id}")))?;
        self.require_tag_write(&tag).await?;
        self.require_scope_write(scope).await?;
        let mut row = Row::new();
        row.insert(
            "project_id".to_string(),
            scope.project_id().map_or(Value::Null, Value::from),
        );
        let mut updated = self.service.update(Table::Tags, &by_id(id), row).await?;
        match updated.pop() {
            Some(row) => from_row(row),
            None => Err(Error::NotFound(format!("tag {id}"))),
        }
    }

    async fn put_tag(&self, tag: &Tag) -> Result<()> {
        validate_tag_name(&tag.name)?;
        if let Some(existing) = self.find_tag(&tag.id).await? {
            self.require_tag_write(&existing).await?;
            if existing.user_id != tag.user_id {
                return Err(Error::Permission(format!(
                    "tag {} belongs to {}",
                    tag.id, existing.user_id
                )));
            }
        }
        self.require_tag_write(tag).await?;
        self.service.upsert(Table::Tags, to_row(tag)?).await?;
        Ok(())
    }

    async fn tags_for_tasks(&self, ids: &[String]) -> Result<HashMap<String, Vec<Tag>>> {
        let mut by_task: HashMap<String, Vec<Tag>> = HashMap::new();
        if ids.is_empty() {
            return Ok(by_task);
        }
        let links: Vec<TaskTagLink> =
            from_rows(self.select_in_chunks(Table::TaskTags, "task_id", ids).await?)?;
        let tag_ids: Vec<String> = links
            .iter()
            .map(|link| link.tag_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let tags: HashMap<String, Tag> =
            from_rows::<Tag>(self.select_in_chunks(Table::Tags, "id", &tag_ids).await?)?
                .into_iter()
                .map(|tag| (tag.id.clone(), tag))
                .collect();

        for link in links {
            if let Some(tag) = tags.get(&link.tag_id) {
                by_task.entry(link.task_id).or_default().push(tag.clone());
            }
        }
        for tags in by_task.values_mut() {
            tags.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        }
        Ok(by_task)
    }

    async fn attach_tag(&self, task_id: &str, tag_id: &str) -> Result<()> {
        let task = self
            .find_task(task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
        self.require_task_write(&task).await?;
        let tag = self
            .find_tag(tag_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("tag {tag_id}")))?;
        self.require_tag_read(&tag).await?;
        let link = TaskTagLink {
            task_id: task_id.to_string(),
            tag_id: tag_id.to_string(),
        };
        self.service.upsert(Table::TaskTags, to_row(&link)?).await?;
        Ok(())
    }

    async fn detach_tag(&self, task_id: &str, tag_id: &str) -> Result<bool> {
        let Some(task) = self.find_task(task_id).await? else {
            return Ok(false);
        };
        self.require_task_write(&task).await?;
        let removed = self
            .service
            .delete(
                Table::TaskTags,
                &RowFilter::new().eq("task_id", task_id).eq("tag_id", tag_id),
            )
            .await?;
        Ok(removed > 0)
    }

    async fn list_task_tags(&self) -> Result<Vec<TaskTagLink>> {
        let task_ids: Vec<String> = self
            .list_tasks(&TaskFilter::all())
            .await?
            .into_iter()
            .map(|task| task.id)
            .collect();
        from_rows(self.select_in_chunks(Table::TaskTags, "task_id", &task_ids).await?)
    }

    async fn record_activity(&self, record: &ActivityRecord) -> Result<()> {
        let task = self
            .find_task(&record.task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {}", record.task_id)))?;
        self.require_task_write(&task).await?;
        self.service.insert(Table::Activity, to_row(record)?).await?;
        Ok(())
    }

    /// History of a task that no longer exists reads as empty.
    async fn list_activity(&self, task_id: &str) -> Result<Vec<ActivityRecord>> {
        let Some(task) = self.find_task(task_id).await? else {
            return Ok(Vec::new());
        };
        self.require_task_read(&task).await?;
        let rows = self
            .service
            .select(Table::Activity, &RowFilter::new().eq("task_id", task_id))
            .await?;
        let mut records: Vec<ActivityRecord> = from_rows(rows)?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(records)
    }

    async fn subscribe_to_changes(
        &self,
        owner_id: &str,
        project_ids: &[String],
    ) -> Result<SubscriptionHandle> {
        let mut feeds = vec![
            (Table::Tasks, RowFilter::new().eq("user_id", owner_id)),
            (Table::Projects, RowFilter::new().eq("user_id", owner_id)),
            (Table::Tags, RowFilter::new().eq("user_id", owner_id)),
        ];
        for chunk in project_ids.chunks(self.chunk_size) {
            feeds.push((
                Table::Tasks,
                RowFilter::new().in_list("project_id", chunk.iter().cloned()),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut forwarders = Vec::with_capacity(feeds.len());
        for (table, filter) in feeds {
            match self.service.subscribe(table, filter).await {
                Ok(upstream) => forwarders.push(spawn_forwarder(upstream, tx.clone())),
                Err(err) => {
                    for forwarder in &forwarders {
                        forwarder.abort();
                    }
                    return Err(err);
                }
            }
        }
        tracing::debug!(
            owner = owner_id,
            feeds = forwarders.len(),
            "subscribed to remote changes"
        );
        Ok(SubscriptionHandle::new(rx, forwarders))
    }
}
