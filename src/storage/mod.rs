//! Storage backends for snail
//!
//! [`StorageAdapter`] is the single CRUD surface over tasks, projects, tags,
//! task-tag links and activity records. Two implementations exist:
//!
//! - [`local::LocalAdapter`]: SQLite file, single implicit local owner, no
//!   permission layer
//! - [`remote::RemoteAdapter`]: a row-level remote service with ownership and
//!   sharing checks plus change notifications
//!
//! The implementation is picked once per session from
//! [`crate::config::StorageMode`]; callers only ever hold an
//! `Arc<dyn StorageAdapter>`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{Config, StorageMode};
use crate::error::{Error, Result};
use crate::model::{
    ActivityRecord, NewProject, NewTask, Project, ProjectPatch, ProjectShare, Tag, TagScope, Task,
    TaskPatch, TaskTagLink,
};

pub mod local;
pub mod memory;
pub mod remote;

pub use local::LocalAdapter;
pub use memory::MemoryService;
pub use remote::{RemoteAdapter, RemoteService};

/// Filter for [`StorageAdapter::list_tasks`]. `None` fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub deleted: Option<bool>,
    pub abandoned: Option<bool>,
    /// Restrict to one project.
    pub scope: Option<String>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn active() -> Self {
        Self {
            deleted: Some(false),
            abandoned: Some(false),
            scope: None,
        }
    }

    pub fn trashed() -> Self {
        Self {
            deleted: Some(true),
            abandoned: None,
            scope: None,
        }
    }

    pub fn abandoned() -> Self {
        Self {
            deleted: Some(false),
            abandoned: Some(true),
            scope: None,
        }
    }

    pub fn in_project(mut self, project_id: impl Into<String>) -> Self {
        self.scope = Some(project_id.into());
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.deleted.map_or(true, |deleted| task.deleted == deleted)
            && self.abandoned.map_or(true, |abandoned| task.abandoned == abandoned)
            && self
                .scope
                .as_deref()
                .map_or(true, |scope| task.project_id.as_deref() == Some(scope))
    }
}

/// Tables of the remote relational backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Tasks,
    Projects,
    ProjectShares,
    Tags,
    TaskTags,
    Activity,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Tasks => "tasks",
            Table::Projects => "projects",
            Table::ProjectShares => "project_shares",
            Table::Tags => "tags",
            Table::TaskTags => "task_tags",
            Table::Activity => "task_activities",
        }
    }

    /// Tables keyed by a generated `id` column.
    pub fn has_id(&self) -> bool {
        !matches!(self, Table::ProjectShares | Table::TaskTags)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-change notification. Consumers treat it as "refetch", never as data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub table: Table,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<serde_json::Value>,
}

/// Live change feed. Dropping or cancelling it stops every forwarder.
#[derive(Debug)]
pub struct SubscriptionHandle {
    receiver: Option<mpsc::UnboundedReceiver<ChangeNotification>>,
    forwarders: Vec<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<ChangeNotification>,
        forwarders: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            receiver: Some(receiver),
            forwarders,
        }
    }

    /// A handle that never yields (local mode).
    pub fn inert() -> Self {
        Self {
            receiver: None,
            forwarders: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.receiver.is_some()
    }

    /// Number of upstream feeds merged into this handle.
    pub fn feed_count(&self) -> usize {
        self.forwarders.len()
    }

    /// Next notification, or `None` once cancelled or inert.
    pub async fn next(&mut self) -> Option<ChangeNotification> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => None,
        }
    }

    pub fn cancel(&mut self) {
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
        self.receiver = None;
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Uniform CRUD contract over both backends.
///
/// Errors follow [`crate::error::ErrorKind`]: `Validation` for malformed
/// input, `Permission` for rows the session may not touch, `NotFound` for
/// missing targets and `Transient` for availability failures.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    fn mode(&self) -> StorageMode;

    /// Owner id stamped on new rows.
    fn owner_id(&self) -> &str;

    // ========== Tasks ==========

    async fn create_task(&self, task: NewTask) -> Result<Task>;

    /// Apply only the fields present in `patch`; returns the stored record.
    async fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<Task>;

    /// Hard delete. `Ok(false)` when nothing was deleted.
    async fn delete_task(&self, id: &str) -> Result<bool>;

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    /// Insert or overwrite a full record, keeping its id (backup import).
    async fn put_task(&self, task: &Task) -> Result<()>;

    // ========== Projects ==========

    /// Ordered by `sort_order`, then `created_at`.
    async fn list_projects(&self) -> Result<Vec<Project>>;

    async fn create_project(&self, project: NewProject) -> Result<Project>;

    async fn update_project(&self, id: &str, patch: &ProjectPatch) -> Result<Project>;

    /// Deletes the project and its scoped tags; its tasks become unscoped.
    async fn delete_project(&self, id: &str) -> Result<bool>;

    async fn put_project(&self, project: &Project) -> Result<()>;

    async fn share_project(&self, share: &ProjectShare) -> Result<()>;

    async fn unshare_project(&self, project_id: &str, user_id: &str) -> Result<bool>;

    // ========== Tags ==========

    /// `None` lists every visible tag regardless of scope.
    async fn list_tags(&self, scope: Option<&TagScope>) -> Result<Vec<Tag>>;

    async fn create_tag(&self, name: &str, scope: &TagScope) -> Result<Tag>;

    async fn rename_tag(&self, id: &str, name: &str) -> Result<Tag>;

    async fn delete_tag(&self, id: &str) -> Result<bool>;

    async fn reassign_tag_scope(&self, id: &str, scope: &TagScope) -> Result<Tag>;

    async fn put_tag(&self, tag: &Tag) -> Result<()>;

    // ========== Task-tag links ==========

    async fn tags_for_tasks(&self, ids: &[String]) -> Result<HashMap<String, Vec<Tag>>>;

    async fn attach_tag(&self, task_id: &str, tag_id: &str) -> Result<()>;

    async fn detach_tag(&self, task_id: &str, tag_id: &str) -> Result<bool>;

    async fn list_task_tags(&self) -> Result<Vec<TaskTagLink>>;

    // ========== Activity ==========

    async fn record_activity(&self, record: &ActivityRecord) -> Result<()>;

    /// Newest first.
    async fn list_activity(&self, task_id: &str) -> Result<Vec<ActivityRecord>>;

    // ========== Notifications ==========

    /// Row-change feed for `owner_id` and the given projects.
    async fn subscribe_to_changes(
        &self,
        owner_id: &str,
        project_ids: &[String],
    ) -> Result<SubscriptionHandle>;
}

pub type SharedAdapter = Arc<dyn StorageAdapter>;

/// Open the local adapter named by `config`.
///
/// Remote mode needs a [`RemoteService`] supplied by the embedding
/// application; use [`RemoteAdapter::new`] for that.
pub fn open_from_config(config: &Config) -> Result<SharedAdapter> {
    match config.mode {
        StorageMode::Local => {
            let adapter = LocalAdapter::open(&config.db_path())?;
            Ok(Arc::new(adapter))
        }
        StorageMode::Remote => Err(Error::InvalidConfig(
            "remote mode requires a remote service connection".to_string(),
        )),
    }
}

/// Build the adapter for an explicit mode, given an optional remote service.
pub fn open_with_service(
    config: &Config,
    service: Option<Arc<dyn RemoteService>>,
) -> Result<SharedAdapter> {
    match (config.mode, service) {
        (StorageMode::Remote, Some(service)) => Ok(Arc::new(RemoteAdapter::new(
            service,
            config.remote.user_id.clone(),
            config.remote.subscription_chunk_size,
        ))),
        _ => open_from_config(config),
    }
}
