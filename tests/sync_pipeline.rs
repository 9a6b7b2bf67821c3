mod support;

use snail::error::{Error, ErrorKind};
use snail::model::{is_temp_id, NewProject, NewTask, Partition, TagScope, TaskPatch};
use snail::sync::{Intent, Notice};

use support::{flaky_sync, seed, titles};

#[tokio::test]
async fn add_shows_a_temp_task_until_the_backend_confirms() {
    let (flaky, sync) = flaky_sync();
    flaky.assign_next_id("t-42");
    let gate = flaky.gate("create_task");

    let worker = sync.clone();
    let pending = tokio::spawn(async move { worker.add_task(NewTask::titled("Buy milk")).await });
    gate.entered().await;

    let visible = sync.store().active();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].title, "Buy milk");
    assert!(is_temp_id(&visible[0].id));
    let temp_id = visible[0].id.clone();

    gate.release();
    let confirmed = pending.await.expect("join").expect("add");
    assert_eq!(confirmed.id, "t-42");

    let visible = sync.store().active();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, "t-42");
    assert!(!sync.store().contains(&temp_id));
}

#[tokio::test]
async fn failed_add_removes_the_temp_task_and_notifies() {
    let (flaky, sync) = flaky_sync();
    let mut notices = sync.subscribe_notices();
    flaky.fail_next("create_task", ErrorKind::Transient);

    let err = sync
        .add_task(NewTask::titled("Buy milk"))
        .await
        .expect_err("add fails");
    assert!(err.is_retryable());
    assert!(sync.store().is_empty());

    match notices.try_recv().expect("notice") {
        Notice::MutationFailed { intent, kind, .. } => {
            assert_eq!(intent, Intent::Add);
            assert_eq!(kind, ErrorKind::Transient);
        }
        other => panic!("unexpected notice {other:?}"),
    }
}

#[tokio::test]
async fn failed_update_restores_the_snapshot() {
    let (flaky, sync) = flaky_sync();
    let tasks = seed(&sync, &["write report"]).await;
    let before = sync.store().get(&tasks[0].id).expect("loaded");
    let mut notices = sync.subscribe_notices();

    flaky.fail_next("update_task", ErrorKind::Permission);
    let err = sync
        .update_task(&tasks[0].id, TaskPatch::title("write the report"))
        .await
        .expect_err("rejected");
    assert!(matches!(err, Error::Permission(_)));
    assert!(!err.is_retryable());

    assert_eq!(sync.store().get(&tasks[0].id), Some(before));
    assert!(matches!(
        notices.try_recv().expect("notice"),
        Notice::MutationFailed {
            intent: Intent::Update,
            kind: ErrorKind::Permission,
            ..
        }
    ));
}

#[tokio::test]
async fn failed_trash_puts_the_task_back_in_place() {
    let (flaky, sync) = flaky_sync();
    let tasks = seed(&sync, &["a", "b", "c"]).await;
    sync.select_task(Some(&tasks[1].id));

    flaky.fail_next("update_task", ErrorKind::Transient);
    sync.trash_task(&tasks[1].id).await.expect_err("offline");

    assert_eq!(titles(&sync.store().active()), vec!["a", "b", "c"]);
    assert!(sync.store().trashed().is_empty());
    let selected = sync.store().selected_task().expect("selection restored");
    assert_eq!(selected.title, "b");
}

#[tokio::test]
async fn rollback_keeps_an_add_confirmed_in_the_meantime() {
    let (flaky, sync) = flaky_sync();
    let tasks = seed(&sync, &["a"]).await;
    let gate = flaky.gate("update_task");
    flaky.fail_next("update_task", ErrorKind::Transient);

    let worker = sync.clone();
    let id = tasks[0].id.clone();
    let pending =
        tokio::spawn(async move { worker.update_task(&id, TaskPatch::title("renamed")).await });
    gate.entered().await;

    let added = sync.add_task(NewTask::titled("Buy milk")).await.expect("add");
    gate.release();
    pending.await.expect("join").expect_err("update fails");

    assert!(sync.store().contains(&added.id));
    assert_eq!(titles(&sync.store().active()), vec!["Buy milk", "a"]);
}

#[tokio::test]
async fn failed_delete_does_not_undo_a_parallel_add() {
    let (flaky, sync) = flaky_sync();
    let tasks = seed(&sync, &["a", "b"]).await;
    let gate = flaky.gate("delete_task");
    flaky.fail_next("delete_task", ErrorKind::Transient);

    let worker = sync.clone();
    let id = tasks[1].id.clone();
    let pending = tokio::spawn(async move { worker.delete_task(&id).await });
    gate.entered().await;
    assert_eq!(titles(&sync.store().active()), vec!["a"]);

    sync.add_task(NewTask::titled("c")).await.expect("add");
    gate.release();
    pending.await.expect("join").expect_err("delete fails");

    assert_eq!(titles(&sync.store().active()), vec!["c", "a", "b"]);
}

#[tokio::test]
async fn add_then_delete_leaves_every_collection_as_it_was() {
    let (_flaky, sync) = flaky_sync();
    let tasks = seed(&sync, &["a", "b", "c"]).await;
    sync.trash_task(&tasks[1].id).await.expect("trash");
    sync.abandon_task(&tasks[2].id).await.expect("abandon");
    let all = [Partition::Active, Partition::Trashed, Partition::Abandoned];
    let before = sync.store().snapshot(&all, true);

    let scratch = sync.add_task(NewTask::titled("scratch")).await.expect("add");
    sync.delete_task(&scratch.id).await.expect("delete");

    assert_eq!(sync.store().snapshot(&all, true), before);
}

#[tokio::test]
async fn failed_project_delete_puts_tasks_and_links_back() {
    let (flaky, sync) = flaky_sync();
    let project = sync
        .adapter()
        .create_project(NewProject {
            name: "Groceries".to_string(),
            ..NewProject::default()
        })
        .await
        .expect("project");
    let mut new = NewTask::titled("milk");
    new.project_id = Some(project.id.clone());
    let task = sync.add_task(new).await.expect("task");
    let home = sync.create_tag("home", TagScope::Global).await.expect("home");
    let aisle = sync
        .create_tag("aisle", TagScope::Project(project.id.clone()))
        .await
        .expect("aisle");
    sync.attach_tag(&task.id, &aisle.id).await.expect("attach aisle");
    sync.attach_tag(&task.id, &home.id).await.expect("attach home");
    let before = sync.store().get(&task.id);
    let tags_before = sync.store().tags_for(&task.id);

    flaky.fail_next("delete_project", ErrorKind::Transient);
    sync.delete_project(&project.id).await.expect_err("offline");
    assert_eq!(sync.store().get(&task.id), before);
    assert_eq!(sync.store().tags_for(&task.id), tags_before);

    sync.delete_project(&project.id).await.expect("delete");
    assert_eq!(sync.store().get(&task.id).expect("kept").project_id, None);
    let names: Vec<String> = sync
        .store()
        .tags_for(&task.id)
        .into_iter()
        .map(|tag| tag.name)
        .collect();
    assert_eq!(names, vec!["home"]);
}

#[tokio::test]
async fn trash_then_abandon_keeps_partitions_exclusive() {
    let (_flaky, sync) = flaky_sync();
    let tasks = seed(&sync, &["a"]).await;
    let id = &tasks[0].id;

    let trashed = sync.trash_task(id).await.expect("trash");
    assert!(trashed.deleted && !trashed.abandoned);
    assert_eq!(sync.store().trashed().len(), 1);

    let abandoned = sync.abandon_task(id).await.expect("abandon");
    assert!(abandoned.abandoned && !abandoned.deleted);
    assert!(sync.store().trashed().is_empty());
    assert_eq!(sync.store().abandoned().len(), 1);

    sync.reactivate_task(id).await.expect("reactivate");
    assert_eq!(sync.store().active().len(), 1);
}

#[tokio::test]
async fn confirmation_keeps_fields_edited_while_in_flight() {
    let (flaky, sync) = flaky_sync();
    let tasks = seed(&sync, &["draft"]).await;
    let id = tasks[0].id.clone();
    let gate = flaky.gate("update_task");

    let worker = sync.clone();
    let task_id = id.clone();
    let pending =
        tokio::spawn(async move { worker.update_task(&task_id, TaskPatch::title("final")).await });
    gate.entered().await;

    sync.toggle_flag(&id).await.expect("flag while title save is parked");
    gate.release();
    pending.await.expect("join").expect("update");

    let task = sync.store().get(&id).expect("task");
    assert_eq!(task.title, "final");
    assert!(task.flagged);
}

#[tokio::test]
async fn delete_of_a_missing_task_counts_as_done() {
    let (flaky, sync) = flaky_sync();
    let tasks = seed(&sync, &["gone"]).await;

    flaky.fail_next("delete_task", ErrorKind::NotFound);
    sync.delete_task(&tasks[0].id).await.expect("not found is fine");
    assert!(sync.store().is_empty());
}

#[tokio::test]
async fn unsaved_tasks_reject_follow_up_intents() {
    let (flaky, sync) = flaky_sync();
    let gate = flaky.gate("create_task");
    let worker = sync.clone();
    let pending = tokio::spawn(async move { worker.add_task(NewTask::titled("x")).await });
    gate.entered().await;

    let temp_id = sync.store().active()[0].id.clone();
    let err = sync.toggle_complete(&temp_id).await.expect_err("temp id");
    assert!(matches!(err, Error::Validation(_)));

    gate.release();
    pending.await.expect("join").expect("add");
}

#[tokio::test]
async fn activity_follows_confirmed_changes_only() {
    let (flaky, sync) = flaky_sync();
    let tasks = seed(&sync, &["report"]).await;
    let id = &tasks[0].id;

    sync.toggle_complete(id).await.expect("complete");
    flaky.fail_next("update_task", ErrorKind::Transient);
    sync.update_task(id, TaskPatch::title("nope"))
        .await
        .expect_err("fails");
    sync.flush_activity().await;

    let history = sync.activity_for(id).await.expect("history");
    let mut actions: Vec<&str> = history.iter().map(|record| record.action.as_str()).collect();
    actions.sort_unstable();
    assert_eq!(actions, vec!["created", "status_changed"]);
}

#[tokio::test]
async fn activity_write_failures_do_not_fail_the_intent() {
    let (flaky, sync) = flaky_sync();
    flaky.fail_next("record_activity", ErrorKind::Transient);
    let task = sync.add_task(NewTask::titled("x")).await.expect("add");
    sync.flush_activity().await;

    assert!(sync.activity_for(&task.id).await.expect("history").is_empty());
    assert_eq!(flaky.calls("record_activity"), 1);
}
