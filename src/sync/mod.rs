//! Optimistic mutation pipeline.
//!
//! Every task intent runs the same phases:
//!
//! 1. snapshot the records the intent touches in the [`TaskStore`]
//! 2. apply the change speculatively, before any await
//! 3. call the [`StorageAdapter`](crate::storage::StorageAdapter)
//! 4. confirm with a field-level merge of the stored record, then log
//!    activity in the background; or put those records back and publish a
//!    [`Notice`]
//!
//! A revert only touches records that still hold the optimistic value, so a
//! change confirmed in the meantime survives an unrelated rollback.
//!
//! Nothing retries automatically. Reordering lives in [`reorder`], tag
//! intents in [`tags`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::activity::{diff_task, ActivityDraft, ActivityLogger};
use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::model::{is_temp_id, NewTask, Partition, Task, TaskPatch, TEMP_ID_PREFIX};
use crate::reorder::{prepend_key, DEFAULT_STEP};
use crate::storage::{SharedAdapter, TaskFilter};
use crate::store::{TaskSnapshot, TaskStore};
use crate::tag_cache::TagCache;

pub mod reorder;
pub mod tags;

pub use reorder::ReorderOutcome;

const NOTICE_CAPACITY: usize = 64;

/// The user action a notice refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Add,
    Update,
    ToggleComplete,
    ToggleFlag,
    Trash,
    Restore,
    Abandon,
    Reactivate,
    Delete,
    EmptyTrash,
    Reorder,
    CreateTag,
    RenameTag,
    DeleteTag,
    ReassignTagScope,
    AttachTag,
    DetachTag,
    DeleteProject,
}

/// User-facing failure signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum Notice {
    MutationFailed {
        intent: Intent,
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        kind: ErrorKind,
        message: String,
    },
    SortNotSaved {
        #[serde(skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
        message: String,
    },
}

/// Coordinates the store, the tag cache, the activity log and the adapter.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncOrchestrator {
    adapter: SharedAdapter,
    store: Arc<TaskStore>,
    tags: Arc<TagCache>,
    activity: Arc<ActivityLogger>,
    notices: broadcast::Sender<Notice>,
    reorder_slots: Arc<Mutex<HashMap<reorder::PartitionKey, reorder::ReorderSlot>>>,
    step: f64,
}

impl SyncOrchestrator {
    pub fn new(adapter: SharedAdapter) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            activity: Arc::new(ActivityLogger::new(Arc::clone(&adapter))),
            adapter,
            store: Arc::new(TaskStore::new()),
            tags: Arc::new(TagCache::new()),
            notices,
            reorder_slots: Arc::new(Mutex::new(HashMap::new())),
            step: DEFAULT_STEP,
        }
    }

    pub fn from_config(adapter: SharedAdapter, config: &Config) -> Self {
        Self::new(adapter).with_step(config.ordering.step)
    }

    pub fn with_step(mut self, step: f64) -> Self {
        if step.is_finite() && step > 0.0 {
            self.step = step;
        }
        self
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn tags(&self) -> &TagCache {
        &self.tags
    }

    pub fn adapter(&self) -> &SharedAdapter {
        &self.adapter
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Wait for background activity writes.
    pub async fn flush_activity(&self) {
        self.activity.flush().await;
    }

    /// Activity history of one task, newest first.
    pub async fn activity_for(&self, task_id: &str) -> Result<Vec<crate::model::ActivityRecord>> {
        self.activity.history(task_id).await
    }

    fn report(&self, intent: Intent, target: Option<&str>, err: &Error) {
        warn!(?intent, target_id = target, error = %err, "rolled back optimistic change");
        let _ = self.notices.send(Notice::MutationFailed {
            intent,
            target: target.map(str::to_string),
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }

    fn next_temp_id(&self) -> String {
        let mut millis = Utc::now().timestamp_millis();
        loop {
            let id = format!("{TEMP_ID_PREFIX}{millis}");
            if !self.store.contains(&id) {
                return id;
            }
            millis += 1;
        }
    }

    fn require_saved(id: &str) -> Result<()> {
        if is_temp_id(id) {
            return Err(Error::Validation(format!("task {id} is not saved yet")));
        }
        Ok(())
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Reload all three collections and the task-tag associations.
    pub async fn refresh(&self) -> Result<()> {
        let partitions = [
            (Partition::Active, TaskFilter::active()),
            (Partition::Trashed, TaskFilter::trashed()),
            (Partition::Abandoned, TaskFilter::abandoned()),
        ];
        for (partition, filter) in partitions {
            self.store.set_loading(partition, true);
            match self.adapter.list_tasks(&filter).await {
                Ok(tasks) => self.store.set_tasks(partition, tasks),
                Err(err) => {
                    self.store.set_loading(partition, false);
                    return Err(err);
                }
            }
        }

        let ids: Vec<String> = [Partition::Active, Partition::Trashed, Partition::Abandoned]
            .into_iter()
            .flat_map(|partition| self.store.tasks(partition))
            .map(|task| task.id)
            .filter(|id| !is_temp_id(id))
            .collect();
        let task_tags = self.adapter.tags_for_tasks(&ids).await?;
        self.store.set_task_tags(task_tags);
        self.tags.clear();
        debug!(tasks = ids.len(), "refreshed task store");
        Ok(())
    }

    /// Refresh on every remote change until the feed closes.
    ///
    /// Returns `None` when the backend has no change feed (local mode).
    pub async fn watch_remote_changes(&self) -> Result<Option<JoinHandle<()>>> {
        let project_ids: Vec<String> = self
            .adapter
            .list_projects()
            .await?
            .into_iter()
            .map(|project| project.id)
            .collect();
        let mut feed = self
            .adapter
            .subscribe_to_changes(self.adapter.owner_id(), &project_ids)
            .await?;
        if !feed.is_active() {
            return Ok(None);
        }

        let this = self.clone();
        Ok(Some(tokio::spawn(async move {
            while let Some(change) = feed.next().await {
                debug!(table = change.table.as_str(), kind = ?change.kind, "remote change");
                if let Err(err) = this.refresh().await {
                    warn!(error = %err, "refresh after remote change failed");
                }
            }
        })))
    }

    pub fn select_task(&self, id: Option<&str>) -> bool {
        self.store.select(id)
    }

    // =========================================================================
    // Task intents
    // =========================================================================

    /// Insert under a temporary id, then swap in the stored record.
    pub async fn add_task(&self, mut new: NewTask) -> Result<Task> {
        new.validate()?;
        let existing = self
            .store
            .ordering_partition(new.project_id.as_deref(), false);
        new.sort_order = prepend_key(existing.iter().map(|task| task.sort_order), self.step);

        let temp_id = self.next_temp_id();
        let optimistic =
            new.clone()
                .into_task(temp_id.clone(), self.adapter.owner_id().to_string(), Utc::now());
        debug!(temp_id = %temp_id, "optimistic add");
        self.store.insert_optimistic_task(optimistic);

        match self.adapter.create_task(new).await {
            Ok(confirmed) => {
                if !self.store.replace_task_by_id(&temp_id, confirmed.clone())
                    && !self.store.contains(&confirmed.id)
                {
                    self.store.prepend_task(confirmed.clone());
                }
                debug!(temp_id = %temp_id, id = %confirmed.id, "add confirmed");
                self.activity.record(vec![ActivityDraft::created(&confirmed)]);
                Ok(confirmed)
            }
            Err(err) => {
                self.store.remove_task(&temp_id);
                self.report(Intent::Add, Some(&temp_id), &err);
                Err(err)
            }
        }
    }

    pub async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        self.apply_update(Intent::Update, id, patch, false).await
    }

    pub async fn toggle_complete(&self, id: &str) -> Result<Task> {
        let current = self.current(id)?;
        self.apply_update(
            Intent::ToggleComplete,
            id,
            TaskPatch::completed(!current.completed),
            false,
        )
        .await
    }

    pub async fn toggle_flag(&self, id: &str) -> Result<Task> {
        let current = self.current(id)?;
        let patch = TaskPatch {
            flagged: Some(!current.flagged),
            ..TaskPatch::default()
        };
        self.apply_update(Intent::ToggleFlag, id, patch, false).await
    }

    pub async fn trash_task(&self, id: &str) -> Result<Task> {
        let patch = TaskPatch {
            deleted: Some(true),
            deleted_at: Some(Some(Utc::now())),
            abandoned: Some(false),
            abandoned_at: Some(None),
            ..TaskPatch::default()
        };
        self.apply_update(Intent::Trash, id, patch, true).await
    }

    pub async fn restore_task(&self, id: &str) -> Result<Task> {
        let patch = TaskPatch {
            deleted: Some(false),
            deleted_at: Some(None),
            ..TaskPatch::default()
        };
        self.apply_update(Intent::Restore, id, patch, true).await
    }

    pub async fn abandon_task(&self, id: &str) -> Result<Task> {
        let patch = TaskPatch {
            abandoned: Some(true),
            abandoned_at: Some(Some(Utc::now())),
            deleted: Some(false),
            deleted_at: Some(None),
            ..TaskPatch::default()
        };
        self.apply_update(Intent::Abandon, id, patch, true).await
    }

    pub async fn reactivate_task(&self, id: &str) -> Result<Task> {
        let patch = TaskPatch {
            abandoned: Some(false),
            abandoned_at: Some(None),
            ..TaskPatch::default()
        };
        self.apply_update(Intent::Reactivate, id, patch, true).await
    }

    /// Permanent delete. A task already gone on the backend counts as deleted.
    pub async fn delete_task(&self, id: &str) -> Result<()> {
        Self::require_saved(id)?;
        let snapshot = self.store.snapshot_task(id);
        self.store.remove_task(id);
        self.store.clear_selection_if(id);

        match self.adapter.delete_task(id).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => {
                if let Some(snapshot) = snapshot {
                    self.revert(snapshot, None);
                }
                self.report(Intent::Delete, Some(id), &err);
                Err(err)
            }
        }
    }

    /// Permanently delete every trashed task; returns how many went.
    pub async fn empty_trash(&self) -> Result<usize> {
        let trashed = self.store.trashed();
        if trashed.is_empty() {
            return Ok(0);
        }
        let snapshots: Vec<TaskSnapshot> = trashed
            .iter()
            .filter_map(|task| self.store.snapshot_task(&task.id))
            .collect();
        for task in &trashed {
            self.store.remove_task(&task.id);
        }

        let mut deleted = Vec::new();
        for task in trashed.iter().filter(|task| !is_temp_id(&task.id)) {
            match self.adapter.delete_task(&task.id).await {
                Ok(_) => deleted.push(task.id.clone()),
                Err(err) if err.is_not_found() => deleted.push(task.id.clone()),
                Err(err) => {
                    for snapshot in snapshots {
                        if !deleted.contains(&snapshot.task().id) {
                            self.revert(snapshot, None);
                        }
                    }
                    self.report(Intent::EmptyTrash, Some(&task.id), &err);
                    return Err(err);
                }
            }
        }
        Ok(deleted.len())
    }

    /// Delete a project; its tasks stay but lose their project.
    pub async fn delete_project(&self, project_id: &str) -> Result<()> {
        let affected: Vec<TaskSnapshot> =
            [Partition::Active, Partition::Trashed, Partition::Abandoned]
                .into_iter()
                .flat_map(|partition| self.store.tasks(partition))
                .filter(|task| task.project_id.as_deref() == Some(project_id))
                .filter_map(|task| self.store.snapshot_task(&task.id))
                .collect();
        let mut unscoped = Vec::with_capacity(affected.len());
        for snapshot in affected {
            if let Some((_, after)) = self
                .store
                .update_task(&snapshot.task().id, |task| task.project_id = None)
            {
                unscoped.push((snapshot, after));
            }
        }
        let scoped_tags: HashSet<String> = self
            .store
            .task_tags()
            .into_values()
            .flatten()
            .filter(|tag| tag.project_id.as_deref() == Some(project_id))
            .map(|tag| tag.id)
            .collect();
        let mut dropped_links = Vec::new();
        for tag_id in &scoped_tags {
            dropped_links.extend(self.store.drop_tag(tag_id));
        }

        match self.adapter.delete_project(project_id).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                for (snapshot, after) in unscoped {
                    self.revert(snapshot, Some(&after));
                }
                for (task_id, idx, tag) in dropped_links.into_iter().rev() {
                    self.store.restore_tag_link(&task_id, idx, tag);
                }
                self.report(Intent::DeleteProject, Some(project_id), &err);
                return Err(err);
            }
        }
        self.tags.clear();
        Ok(())
    }

    fn current(&self, id: &str) -> Result<Task> {
        self.store
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    async fn apply_update(
        &self,
        intent: Intent,
        id: &str,
        mut patch: TaskPatch,
        moves: bool,
    ) -> Result<Task> {
        patch.validate()?;
        Self::require_saved(id)?;
        let snapshot = self
            .store
            .snapshot_task(id)
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        let current = snapshot.task().clone();

        if let Some(completed) = patch.completed {
            if completed != current.completed {
                patch.completed_at = Some(completed.then(Utc::now));
            }
        }

        let mut preview = current.clone();
        patch.apply_to(&mut preview);
        preview.validate()?;

        let Some((before, expected)) = self.store.update_task(id, |task| patch.apply_to(task))
        else {
            return Err(Error::NotFound(format!("task {id}")));
        };
        if moves {
            self.store.clear_selection_if(id);
        }
        debug!(?intent, id, "optimistic update");

        match self.adapter.update_task(id, &patch).await {
            Ok(confirmed) => {
                let merged = self
                    .store
                    .update_task(id, |local| patch.merge_confirmed(&expected, &confirmed, local));
                self.activity.record(diff_task(&before, &patch));
                Ok(merged.map(|(_, after)| after).unwrap_or(confirmed))
            }
            Err(err) => {
                self.revert(snapshot, Some(&expected));
                self.report(intent, Some(id), &err);
                Err(err)
            }
        }
    }

    /// Put one record back unless a later change already replaced it.
    fn revert(&self, snapshot: TaskSnapshot, expected: Option<&Task>) {
        let id = snapshot.task().id.clone();
        if !self.store.revert_task(snapshot, expected) {
            debug!(id = %id, "record changed since the optimistic write; revert skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LocalAdapter, StorageAdapter};

    async fn orchestrator() -> SyncOrchestrator {
        let adapter: SharedAdapter = Arc::new(LocalAdapter::in_memory().expect("db"));
        SyncOrchestrator::new(adapter)
    }

    #[tokio::test]
    async fn add_confirms_real_id_and_logs_creation() {
        let sync = orchestrator().await;
        let task = sync.add_task(NewTask::titled("Buy milk")).await.expect("add");
        assert!(!is_temp_id(&task.id));
        assert_eq!(sync.store().active(), vec![task.clone()]);

        sync.flush_activity().await;
        let history = sync.activity_for(&task.id).await.expect("history");
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn new_tasks_go_to_the_top() {
        let sync = orchestrator().await;
        let first = sync.add_task(NewTask::titled("first")).await.expect("add");
        let second = sync.add_task(NewTask::titled("second")).await.expect("add");
        assert!(second.sort_order < first.sort_order);
    }

    #[tokio::test]
    async fn completion_maintains_completed_at() {
        let sync = orchestrator().await;
        let task = sync.add_task(NewTask::titled("x")).await.expect("add");

        let done = sync.toggle_complete(&task.id).await.expect("complete");
        assert!(done.completed);
        assert!(done.completed_at.is_some());

        let renamed = sync
            .update_task(&task.id, TaskPatch::title("y"))
            .await
            .expect("rename");
        assert_eq!(renamed.completed_at, done.completed_at);

        let reopened = sync.toggle_complete(&task.id).await.expect("reopen");
        assert!(!reopened.completed);
        assert_eq!(reopened.completed_at, None);
    }

    #[tokio::test]
    async fn trash_and_restore_move_between_collections() {
        let sync = orchestrator().await;
        let task = sync.add_task(NewTask::titled("x")).await.expect("add");
        sync.select_task(Some(&task.id));

        sync.trash_task(&task.id).await.expect("trash");
        assert!(sync.store().active().is_empty());
        assert_eq!(sync.store().trashed().len(), 1);
        assert_eq!(sync.store().selected(), None);

        let restored = sync.restore_task(&task.id).await.expect("restore");
        assert!(!restored.deleted);
        assert_eq!(restored.deleted_at, None);
        assert_eq!(sync.store().active().len(), 1);
    }

    #[tokio::test]
    async fn updates_to_unsaved_tasks_are_rejected() {
        let sync = orchestrator().await;
        let err = sync
            .update_task("temp-1", TaskPatch::title("x"))
            .await
            .expect_err("temp");
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn empty_trash_deletes_every_trashed_task() {
        let sync = orchestrator().await;
        for title in ["a", "b"] {
            let task = sync.add_task(NewTask::titled(title)).await.expect("add");
            sync.trash_task(&task.id).await.expect("trash");
        }
        assert_eq!(sync.empty_trash().await.expect("empty"), 2);
        assert!(sync.store().trashed().is_empty());
        let remaining = sync
            .adapter()
            .list_tasks(&TaskFilter::all())
            .await
            .expect("list");
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn refresh_loads_every_partition() {
        let adapter: SharedAdapter = Arc::new(LocalAdapter::in_memory().expect("db"));
        let kept = adapter.create_task(NewTask::titled("kept")).await.expect("a");
        let gone = adapter.create_task(NewTask::titled("gone")).await.expect("b");
        adapter
            .update_task(
                &gone.id,
                &TaskPatch {
                    abandoned: Some(true),
                    ..TaskPatch::default()
                },
            )
            .await
            .expect("abandon");

        let sync = SyncOrchestrator::new(adapter);
        sync.refresh().await.expect("refresh");
        assert_eq!(sync.store().active()[0].id, kept.id);
        assert_eq!(sync.store().abandoned()[0].id, gone.id);
        assert!(sync.store().load_state(Partition::Trashed).loaded);
    }

    #[tokio::test]
    async fn local_mode_has_no_change_feed() {
        let sync = orchestrator().await;
        assert!(sync.watch_remote_changes().await.expect("watch").is_none());
    }
}
