//! Best-effort task activity history.
//!
//! [`diff_task`] turns a patch into discrete drafts by comparing only the
//! fields the patch carries. [`ActivityLogger`] persists each draft on its
//! own spawned task; failures are logged and dropped.

use std::sync::Mutex;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::warn;
use ulid::Ulid;

use crate::error::Result;
use crate::model::{ActivityAction, ActivityRecord, Attachment, Tag, Task, TaskPatch};
use crate::storage::SharedAdapter;

/// An activity record before it gets an id, owner and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityDraft {
    pub task_id: String,
    pub action: ActivityAction,
    pub metadata: Value,
}

impl ActivityDraft {
    fn new(task_id: &str, action: ActivityAction, metadata: Value) -> Self {
        Self {
            task_id: task_id.to_string(),
            action,
            metadata,
        }
    }

    pub fn created(task: &Task) -> Self {
        Self::new(&task.id, ActivityAction::Created, json!({ "title": task.title }))
    }

    pub fn tag_added(task_id: &str, tag: &Tag) -> Self {
        Self::new(
            task_id,
            ActivityAction::TagAdded,
            json!({ "tag_id": tag.id, "tag_name": tag.name }),
        )
    }

    pub fn tag_removed(task_id: &str, tag: &Tag) -> Self {
        Self::new(
            task_id,
            ActivityAction::TagRemoved,
            json!({ "tag_id": tag.id, "tag_name": tag.name }),
        )
    }
}

fn attachment_delta(previous: &[Attachment], next: &[Attachment]) -> Option<Value> {
    let added: Vec<&Attachment> = next
        .iter()
        .filter(|a| !previous.iter().any(|p| p.identity() == a.identity()))
        .collect();
    let removed: Vec<&Attachment> = previous
        .iter()
        .filter(|p| !next.iter().any(|a| a.identity() == p.identity()))
        .collect();
    if added.is_empty() && removed.is_empty() {
        return None;
    }
    let names = |items: &[&Attachment]| -> Vec<String> {
        items.iter().map(|a| a.original_name.clone()).collect()
    };
    Some(json!({ "added": names(&added), "removed": names(&removed) }))
}

/// Drafts for every semantically distinct change `patch` makes to `previous`.
///
/// Fields absent from the patch are never reported; ordering and flag
/// changes are not history-worthy.
pub fn diff_task(previous: &Task, patch: &TaskPatch) -> Vec<ActivityDraft> {
    let id = previous.id.as_str();
    let mut drafts = Vec::new();

    if let Some(title) = &patch.title {
        if *title != previous.title {
            drafts.push(ActivityDraft::new(
                id,
                ActivityAction::TitleChanged,
                json!({ "from": previous.title, "to": title }),
            ));
        }
    }
    if let Some(description) = &patch.description {
        if *description != previous.description {
            drafts.push(ActivityDraft::new(
                id,
                ActivityAction::DescriptionChanged,
                json!({ "from": previous.description, "to": description }),
            ));
        }
    }
    if let Some(completed) = patch.completed {
        if completed != previous.completed {
            drafts.push(ActivityDraft::new(
                id,
                ActivityAction::StatusChanged,
                json!({ "from": previous.completed, "to": completed }),
            ));
        }
    }
    if let Some(date) = patch.date {
        if date != previous.date {
            drafts.push(ActivityDraft::new(
                id,
                ActivityAction::DueDateChanged,
                json!({ "from": previous.date, "to": date }),
            ));
        }
    }
    if let Some(project_id) = &patch.project_id {
        if *project_id != previous.project_id {
            drafts.push(ActivityDraft::new(
                id,
                ActivityAction::ProjectChanged,
                json!({ "from": previous.project_id, "to": project_id }),
            ));
        }
    }
    if let Some(attachments) = &patch.attachments {
        if let Some(delta) = attachment_delta(&previous.attachments, attachments) {
            drafts.push(ActivityDraft::new(id, ActivityAction::AttachmentsUpdated, delta));
        }
    }
    match patch.deleted {
        Some(true) if !previous.deleted => {
            drafts.push(ActivityDraft::new(id, ActivityAction::MovedToTrash, json!({})))
        }
        Some(false) if previous.deleted => {
            drafts.push(ActivityDraft::new(id, ActivityAction::Restored, json!({})))
        }
        _ => {}
    }
    match patch.abandoned {
        Some(true) if !previous.abandoned => {
            drafts.push(ActivityDraft::new(id, ActivityAction::Abandoned, json!({})))
        }
        Some(false) if previous.abandoned => {
            drafts.push(ActivityDraft::new(id, ActivityAction::Reactivated, json!({})))
        }
        _ => {}
    }
    drafts
}

pub struct ActivityLogger {
    adapter: SharedAdapter,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl ActivityLogger {
    pub fn new(adapter: SharedAdapter) -> Self {
        Self {
            adapter,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Persist each draft independently in the background.
    pub fn record(&self, drafts: Vec<ActivityDraft>) {
        if drafts.is_empty() {
            return;
        }
        let mut handles = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let record = ActivityRecord {
                id: Ulid::new().to_string(),
                task_id: draft.task_id,
                user_id: self.adapter.owner_id().to_string(),
                action: draft.action,
                metadata: draft.metadata,
                created_at: Utc::now(),
            };
            let adapter = SharedAdapter::clone(&self.adapter);
            handles.push(tokio::spawn(async move {
                if let Err(err) = adapter.record_activity(&record).await {
                    warn!(
                        task_id = %record.task_id,
                        action = record.action.as_str(),
                        error = %err,
                        "dropping activity record"
                    );
                }
            }));
        }
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pending.retain(|handle| !handle.is_finished());
        pending.extend(handles);
    }

    /// Wait for every write issued so far.
    pub async fn flush(&self) {
        let handles = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *pending)
        };
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "activity writer aborted");
            }
        }
    }

    /// Newest first.
    pub async fn history(&self, task_id: &str) -> Result<Vec<ActivityRecord>> {
        self.adapter.list_activity(task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewTask;
    use crate::storage::LocalAdapter;
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn task() -> Task {
        NewTask::titled("Buy milk").into_task("t-1".into(), "u".into(), Utc::now())
    }

    #[test]
    fn only_patched_fields_are_compared() {
        let previous = task();
        let patch = TaskPatch {
            title: Some("Buy milk".to_string()),
            date: Some(NaiveDate::from_ymd_opt(2026, 10, 20)),
            flagged: Some(true),
            ..TaskPatch::default()
        };
        let drafts = diff_task(&previous, &patch);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].action, ActivityAction::DueDateChanged);
        assert_eq!(drafts[0].metadata["to"], "2026-10-20");
    }

    #[test]
    fn soft_state_transitions_map_to_actions() {
        let mut previous = task();
        let trash = TaskPatch {
            deleted: Some(true),
            ..TaskPatch::default()
        };
        assert_eq!(diff_task(&previous, &trash)[0].action, ActivityAction::MovedToTrash);

        previous.abandoned = true;
        let reactivate = TaskPatch {
            abandoned: Some(false),
            ..TaskPatch::default()
        };
        assert_eq!(
            diff_task(&previous, &reactivate)[0].action,
            ActivityAction::Reactivated
        );
    }

    #[test]
    fn unchanged_attachments_produce_nothing() {
        let mut previous = task();
        previous.attachments = vec![Attachment {
            id: "a".to_string(),
            url: "https://files/a".to_string(),
            filename: "a.pdf".to_string(),
            original_name: "receipt.pdf".to_string(),
            size: 10,
            content_type: "application/pdf".to_string(),
            uploaded_at: Utc::now(),
        }];
        let patch = TaskPatch {
            attachments: Some(previous.attachments.clone()),
            ..TaskPatch::default()
        };
        assert!(diff_task(&previous, &patch).is_empty());

        let cleared = TaskPatch {
            attachments: Some(Vec::new()),
            ..TaskPatch::default()
        };
        let drafts = diff_task(&previous, &cleared);
        assert_eq!(drafts[0].metadata["removed"][0], "receipt.pdf");
    }

    #[tokio::test]
    async fn logger_persists_and_flushes() {
        let adapter: SharedAdapter = Arc::new(LocalAdapter::in_memory().expect("db"));
        let logger = ActivityLogger::new(adapter);
        let task = task();
        logger.record(vec![ActivityDraft::created(&task)]);
        logger.flush().await;

        let history = logger.history(&task.id).await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, ActivityAction::Created);
    }
}
