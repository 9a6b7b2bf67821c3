use std::collections::BTreeMap;

use anyhow::Result;
use snail::backup::{export_to, import_from, read_archive, restore, write_archive, Backup, ImportMode};
use snail::error::Error;
use snail::model::{NewProject, NewTask, TagScope, TaskPatch, TaskTagLink};
use snail::storage::{LocalAdapter, StorageAdapter, TaskFilter};
use tempfile::TempDir;

/// 3 projects, 10 tasks (one trashed, one abandoned), 4 tags, 5 links.
async fn populate(adapter: &LocalAdapter) -> Result<()> {
    let mut projects = Vec::new();
    for name in ["Home", "Work", "Shopping"] {
        projects.push(
            adapter
                .create_project(NewProject {
                    name: name.to_string(),
                    ..NewProject::default()
                })
                .await?,
        );
    }

    let mut tasks = Vec::new();
    for idx in 0..10 {
        let mut new = NewTask::titled(format!("task {idx}"));
        new.sort_order = (idx as f64 + 1.0) * 1000.0;
        new.project_id = projects.get(idx % 4).map(|project| project.id.clone());
        tasks.push(adapter.create_task(new).await?);
    }
    adapter
        .update_task(
            &tasks[8].id,
            &TaskPatch {
                deleted: Some(true),
                ..TaskPatch::default()
            },
        )
        .await?;
    adapter
        .update_task(
            &tasks[9].id,
            &TaskPatch {
                abandoned: Some(true),
                ..TaskPatch::default()
            },
        )
        .await?;

    let global = adapter.create_tag("urgent", &TagScope::Global).await?;
    let later = adapter.create_tag("later", &TagScope::Global).await?;
    let aisle = adapter
        .create_tag("aisle 3", &TagScope::Project(projects[2].id.clone()))
        .await?;
    adapter
        .create_tag("desk", &TagScope::Project(projects[1].id.clone()))
        .await?;

    adapter.attach_tag(&tasks[0].id, &global.id).await?;
    adapter.attach_tag(&tasks[1].id, &global.id).await?;
    adapter.attach_tag(&tasks[1].id, &later.id).await?;
    adapter.attach_tag(&tasks[2].id, &aisle.id).await?;
    adapter.attach_tag(&tasks[8].id, &later.id).await?;
    Ok(())
}

fn summary(tasks: &[snail::model::Task]) -> BTreeMap<String, (String, f64, Option<String>, bool, bool)> {
    tasks
        .iter()
        .map(|task| {
            (
                task.id.clone(),
                (
                    task.title.clone(),
                    task.sort_order,
                    task.project_id.clone(),
                    task.deleted,
                    task.abandoned,
                ),
            )
        })
        .collect()
}

#[tokio::test]
async fn export_then_replace_import_reproduces_everything() -> Result<()> {
    let dir = TempDir::new()?;
    let source = LocalAdapter::open(&dir.path().join("source.db"))?;
    populate(&source).await?;

    let archive = dir.path().join("backup.tar.gz");
    let manifest = export_to(&source, &archive).await?;
    assert_eq!(manifest.counts.projects, 3);
    assert_eq!(manifest.counts.tasks, 10);
    assert_eq!(manifest.counts.tags, 4);
    assert_eq!(manifest.counts.task_tags, 5);

    let target = LocalAdapter::open(&dir.path().join("target.db"))?;
    target.create_task(NewTask::titled("will be replaced")).await?;
    let report = import_from(&target, &archive, ImportMode::Replace).await?;
    assert_eq!(report.tasks, 10);
    assert_eq!(report.task_tags, 5);
    assert_eq!(report.skipped_links, 0);

    let before = source.list_tasks(&TaskFilter::all()).await?;
    let after = target.list_tasks(&TaskFilter::all()).await?;
    assert_eq!(summary(&before), summary(&after));

    assert_eq!(target.list_projects().await?.len(), 3);
    assert_eq!(target.list_tags(None).await?.len(), 4);
    let mut links = target.list_task_tags().await?;
    let mut expected = source.list_task_tags().await?;
    links.sort_by(|a, b| (&a.task_id, &a.tag_id).cmp(&(&b.task_id, &b.tag_id)));
    expected.sort_by(|a, b| (&a.task_id, &a.tag_id).cmp(&(&b.task_id, &b.tag_id)));
    assert_eq!(links, expected);
    Ok(())
}

#[tokio::test]
async fn merge_import_keeps_existing_records() -> Result<()> {
    let dir = TempDir::new()?;
    let source = LocalAdapter::open(&dir.path().join("source.db"))?;
    populate(&source).await?;
    let archive = dir.path().join("backup.tar.gz");
    export_to(&source, &archive).await?;

    let target = LocalAdapter::in_memory()?;
    let kept = target.create_task(NewTask::titled("mine")).await?;
    import_from(&target, &archive, ImportMode::Merge).await?;

    let tasks = target.list_tasks(&TaskFilter::all()).await?;
    assert_eq!(tasks.len(), 11);
    assert!(tasks.iter().any(|task| task.id == kept.id));

    // Importing twice upserts by id.
    import_from(&target, &archive, ImportMode::Merge).await?;
    assert_eq!(target.list_tasks(&TaskFilter::all()).await?.len(), 11);
    Ok(())
}

#[tokio::test]
async fn dangling_links_are_skipped() -> Result<()> {
    let source = LocalAdapter::in_memory()?;
    populate(&source).await?;
    let mut backup = snail::backup::collect(&source).await?;
    backup.task_tags.push(TaskTagLink {
        task_id: "no-such-task".to_string(),
        tag_id: backup.tags[0].id.clone(),
    });
    let backup = Backup::new(backup.projects, backup.tasks, backup.tags, backup.task_tags);

    let bytes = write_archive(&backup, Vec::new())?;
    let parsed = read_archive(bytes.as_slice())?;
    let target = LocalAdapter::in_memory()?;
    let report = restore(&target, &parsed, ImportMode::Replace).await?;
    assert_eq!(report.task_tags, 5);
    assert_eq!(report.skipped_links, 1);
    Ok(())
}

#[test]
fn garbage_is_an_invalid_backup() {
    let err = read_archive(&b"definitely not gzip"[..]).expect_err("garbage");
    assert!(matches!(err, Error::InvalidBackup(_)));
}
