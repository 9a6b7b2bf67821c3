#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use snail::config::StorageMode;
use snail::error::{Error, ErrorKind, Result};
use snail::model::{
    ActivityRecord, NewProject, NewTask, Project, ProjectPatch, ProjectShare, Tag, TagScope, Task,
    TaskPatch, TaskTagLink,
};
use snail::storage::{
    LocalAdapter, SharedAdapter, StorageAdapter, SubscriptionHandle, TaskFilter,
};
use snail::sync::SyncOrchestrator;

/// Pauses the first call of one operation until released.
#[derive(Default)]
pub struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    /// Wait until the gated call is parked.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// SQLite adapter with scripted failures, gates and fixed ids.
pub struct FlakyAdapter {
    inner: LocalAdapter,
    script: Mutex<HashMap<&'static str, VecDeque<Option<ErrorKind>>>>,
    gates: Mutex<HashMap<&'static str, Arc<Gate>>>,
    next_ids: Mutex<VecDeque<String>>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl FlakyAdapter {
    pub fn new() -> Self {
        Self {
            inner: LocalAdapter::in_memory().expect("in-memory db"),
            script: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            next_ids: Mutex::new(VecDeque::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// The next `op` call fails with `kind`.
    pub fn fail_next(&self, op: &'static str, kind: ErrorKind) {
        self.script
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(Some(kind));
    }

    /// The next `op` call goes through; queue before `fail_next` to fail a later call.
    pub fn pass_next(&self, op: &'static str) {
        self.script.lock().unwrap().entry(op).or_default().push_back(None);
    }

    pub fn gate(&self, op: &'static str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.gates.lock().unwrap().insert(op, Arc::clone(&gate));
        gate
    }

    /// Id the backend assigns to the next created task.
    pub fn assign_next_id(&self, id: &str) {
        self.next_ids.lock().unwrap().push_back(id.to_string());
    }

    pub fn calls(&self, op: &'static str) -> usize {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    async fn enter(&self, op: &'static str) -> Result<()> {
        *self.calls.lock().unwrap().entry(op).or_default() += 1;
        let gate = self.gates.lock().unwrap().remove(op);
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(op)
            .and_then(VecDeque::pop_front);
        match scripted.flatten() {
            None => Ok(()),
            Some(kind) => Err(injected(op, kind)),
        }
    }
}

fn injected(op: &str, kind: ErrorKind) -> Error {
    let message = format!("injected {op} failure");
    match kind {
        ErrorKind::Validation => Error::Validation(message),
        ErrorKind::Permission => Error::Permission(message),
        ErrorKind::NotFound => Error::NotFound(message),
        ErrorKind::Transient => Error::Transient(message),
    }
}

#[async_trait]
impl StorageAdapter for FlakyAdapter {
    fn mode(&self) -> StorageMode {
        self.inner.mode()
    }

    fn owner_id(&self) -> &str {
        self.inner.owner_id()
    }

    async fn create_task(&self, task: NewTask) -> Result<Task> {
        self.enter("create_task").await?;
        let fixed = self.next_ids.lock().unwrap().pop_front();
        match fixed {
            Some(id) => {
                let task = task.into_task(id, self.owner_id().to_string(), Utc::now());
                self.inner.put_task(&task).await?;
                Ok(task)
            }
            None => self.inner.create_task(task).await,
        }
    }

    async fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<Task> {
        self.enter("update_task").await?;
        self.inner.update_task(id, patch).await
    }

    async fn delete_task(&self, id: &str) -> Result<bool> {
        self.enter("delete_task").await?;
        self.inner.delete_task(id).await
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.enter("list_tasks").await?;
        self.inner.list_tasks(filter).await
    }

    async fn put_task(&self, task: &Task) -> Result<()> {
        self.enter("put_task").await?;
        self.inner.put_task(task).await
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        self.enter("list_projects").await?;
        self.inner.list_projects().await
    }

    async fn create_project(&self, project: NewProject) -> Result<Project> {
        self.enter("create_project").await?;
        self.inner.create_project(project).await
    }

    async fn update_project(&self, id: &str, patch: &ProjectPatch) -> Result<Project> {
        self.enter("update_project").await?;
        self.inner.update_project(id, patch).await
    }

    async fn delete_project(&self, id: &str) -> Result<bool> {
        self.enter("delete_project").await?;
        self.inner.delete_project(id).await
    }

    async fn put_project(&self, project: &Project) -> Result<()> {
        self.enter("put_project").await?;
        self.inner.put_project(project).await
    }

    async fn share_project(&self, share: &ProjectShare) -> Result<()> {
        self.enter("share_project").await?;
        self.inner.share_project(share).await
    }

    async fn unshare_project(&self, project_id: &str, user_id: &str) -> Result<bool> {
        self.enter("unshare_project").await?;
        self.inner.unshare_project(project_id, user_id).await
    }

    async fn list_tags(&self, scope: Option<&TagScope>) -> Result<Vec<Tag>> {
        self.enter("list_tags").await?;
        self.inner.list_tags(scope).await
    }

    async fn create_tag(&self, name: &str, scope: &TagScope) -> Result<Tag> {
        self.enter("create_tag").await?;
        self.inner.create_tag(name, scope).await
    }

    async fn rename_tag(&self, id: &str, name: &str) -> Result<Tag> {
        self.enter("rename_tag").await?;
        self.inner.rename_tag(id, name).await
    }

    async fn delete_tag(&self, id: &str) -> Result<bool> {
        self.enter("delete_tag").await?;
        self.inner.delete_tag(id).await
    }

    async fn reassign_tag_scope(&self, id: &str, scope: &TagScope) -> Result<Tag> {
        self.enter("reassign_tag_scope").await?;
        self.inner.reassign_tag_scope(id, scope).await
    }

    async fn put_tag(&self, tag: &Tag) -> Result<()> {
        self.enter("put_tag").await?;
        self.inner.put_tag(tag).await
    }

    async fn tags_for_tasks(&self, ids: &[String]) -> Result<HashMap<String, Vec<Tag>>> {
        self.enter("tags_for_tasks").await?;
        self.inner.tags_for_tasks(ids).await
    }

    async fn attach_tag(&self, task_id: &str, tag_id: &str) -> Result<()> {
        self.enter("attach_tag").await?;
        self.inner.attach_tag(task_id, tag_id).await
    }

    async fn detach_tag(&self, task_id: &str, tag_id: &str) -> Result<bool> {
        self.enter("detach_tag").await?;
        self.inner.detach_tag(task_id, tag_id).await
    }

    async fn list_task_tags(&self) -> Result<Vec<TaskTagLink>> {
        self.enter("list_task_tags").await?;
        self.inner.list_task_tags().await
    }

    async fn record_activity(&self, record: &ActivityRecord) -> Result<()> {
        self.enter("record_activity").await?;
        self.inner.record_activity(record).await
    }

    async fn list_activity(&self, task_id: &str) -> Result<Vec<ActivityRecord>> {
        self.enter("list_activity").await?;
        self.inner.list_activity(task_id).await
    }

    async fn subscribe_to_changes(
        &self,
        owner_id: &str,
        project_ids: &[String],
    ) -> Result<SubscriptionHandle> {
        self.inner.subscribe_to_changes(owner_id, project_ids).await
    }
}

/// An orchestrator over a fresh flaky adapter.
pub fn flaky_sync() -> (Arc<FlakyAdapter>, SyncOrchestrator) {
    let flaky = Arc::new(FlakyAdapter::new());
    let adapter: SharedAdapter = flaky.clone();
    (flaky, SyncOrchestrator::new(adapter))
}

/// Add `titles` so that they list in the given order.
pub async fn seed(sync: &SyncOrchestrator, titles: &[&str]) -> Vec<Task> {
    let mut added = Vec::new();
    for title in titles.iter().rev() {
        added.push(sync.add_task(NewTask::titled(*title)).await.expect("seed task"));
    }
    added.reverse();
    added
}

pub fn titles(tasks: &[Task]) -> Vec<String> {
    tasks.iter().map(|task| task.title.clone()).collect()
}
