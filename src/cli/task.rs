//! snail task command implementations.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::cli::{parse_day, resolve_id, short_id, ListView, Session, TaskCommands};
use crate::error::Result;
use crate::model::{ActivityRecord, NewTask, Partition, Tag, Task};
use crate::output::{emit_success, HumanOutput};
use crate::sync::ReorderOutcome;

#[derive(Serialize)]
struct TaskView {
    #[serde(flatten)]
    task: Task,
    tags: Vec<String>,
}

#[derive(Serialize)]
struct ProjectGroup {
    project_id: Option<String>,
    open: Vec<TaskView>,
    completed: Vec<TaskView>,
}

#[derive(Serialize)]
struct ListOutput {
    view: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    groups: Option<Vec<ProjectGroup>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tasks: Option<Vec<TaskView>>,
}

#[derive(Serialize)]
struct DeletedOutput {
    deleted: usize,
}

#[derive(Serialize)]
struct MoveOutput {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    moved_id: Option<String>,
    writes: usize,
    renumbered: bool,
}

pub(crate) fn run(session: Session, cmd: TaskCommands) -> Result<()> {
    match cmd {
        TaskCommands::Add {
            title,
            description,
            date,
            project,
            flag,
        } => run_add(&session, title, description, date, project, flag),
        TaskCommands::List { view, project } => run_list(&session, view, project),
        TaskCommands::Done { id } => {
            let id = resolve_task(&session, &id)?;
            let task = session.block_on(session.sync.toggle_complete(&id))?;
            let header = if task.completed { "Task completed" } else { "Task reopened" };
            emit_task(&session, "task done", header, task)
        }
        TaskCommands::Flag { id } => {
            let id = resolve_task(&session, &id)?;
            let task = session.block_on(session.sync.toggle_flag(&id))?;
            let header = if task.flagged { "Task flagged" } else { "Task unflagged" };
            emit_task(&session, "task flag", header, task)
        }
        TaskCommands::Trash { id } => {
            let id = resolve_task(&session, &id)?;
            let task = session.block_on(session.sync.trash_task(&id))?;
            emit_task(&session, "task trash", "Task moved to trash", task)
        }
        TaskCommands::Restore { id } => {
            let id = resolve_task(&session, &id)?;
            let task = session.block_on(session.sync.restore_task(&id))?;
            emit_task(&session, "task restore", "Task restored", task)
        }
        TaskCommands::Abandon { id } => {
            let id = resolve_task(&session, &id)?;
            let task = session.block_on(session.sync.abandon_task(&id))?;
            emit_task(&session, "task abandon", "Task abandoned", task)
        }
        TaskCommands::Reactivate { id } => {
            let id = resolve_task(&session, &id)?;
            let task = session.block_on(session.sync.reactivate_task(&id))?;
            emit_task(&session, "task reactivate", "Task reactivated", task)
        }
        TaskCommands::Delete { id } => {
            let id = resolve_task(&session, &id)?;
            session.block_on(session.sync.delete_task(&id))?;
            let mut human = HumanOutput::new("Task deleted");
            human.push_summary("ID", id.clone());
            emit_success(
                session.output(),
                "task delete",
                &serde_json::json!({ "id": id }),
                Some(&human),
            )
        }
        TaskCommands::EmptyTrash => {
            let deleted = session.block_on(session.sync.empty_trash())?;
            let mut human = HumanOutput::new("Trash emptied");
            human.push_summary("Deleted", deleted.to_string());
            emit_success(
                session.output(),
                "task empty-trash",
                &DeletedOutput { deleted },
                Some(&human),
            )
        }
        TaskCommands::Move {
            from,
            to,
            project,
            completed,
        } => run_move(&session, from, to, project, completed),
        TaskCommands::History { id } => run_history(&session, &id),
    }
}

fn run_add(
    session: &Session,
    title: String,
    description: Option<String>,
    date: Option<String>,
    project: Option<String>,
    flagged: bool,
) -> Result<()> {
    let date = date.as_deref().map(|raw| parse_day("date", raw)).transpose()?;
    let project_id = match project {
        Some(raw) => Some(resolve_project(session, &raw)?),
        None => None,
    };
    let new = NewTask {
        title,
        description,
        date,
        project_id,
        flagged,
        ..NewTask::default()
    };
    let task = session.block_on(session.sync.add_task(new))?;

    let mut human = HumanOutput::new("Task added");
    human.push_summary("ID", task.id.clone());
    human.push_summary("Title", task.title.clone());
    if let Some(date) = task.date {
        human.push_summary("Date", date.to_string());
    }
    human.push_next_step(format!("snail task done {}", short_id(&task.id)));
    emit_success(session.output(), "task add", &task, Some(&human))
}

fn run_list(session: &Session, view: ListView, project: Option<String>) -> Result<()> {
    let project_id = match project {
        Some(raw) => Some(resolve_project(session, &raw)?),
        None => None,
    };
    let store = session.sync.store();
    let view_for = |task: Task| TaskView {
        tags: tag_names(&store.tags_for(&task.id)),
        task,
    };

    let (name, partition) = match view {
        ListView::Active => ("active", Partition::Active),
        ListView::Trash => ("trash", Partition::Trashed),
        ListView::Abandoned => ("abandoned", Partition::Abandoned),
    };

    let mut human = HumanOutput::new(format!("Tasks ({name})"));
    let output = if partition == Partition::Active {
        let keys: BTreeSet<Option<String>> = match &project_id {
            Some(id) => [Some(id.clone())].into_iter().collect(),
            None => store
                .active()
                .into_iter()
                .map(|task| task.project_id)
                .collect(),
        };
        let mut groups = Vec::new();
        for key in keys {
            let open = store.ordering_partition(key.as_deref(), false);
            let completed = store.ordering_partition(key.as_deref(), true);
            human.push_detail(format!(
                "[{}]",
                key.as_deref().map(short_id).unwrap_or("no project")
            ));
            for (idx, task) in open.iter().enumerate() {
                human.push_detail(format!("  {idx}. {}", describe(task)));
            }
            for (idx, task) in completed.iter().enumerate() {
                human.push_detail(format!("  {idx}. [x] {}", describe(task)));
            }
            groups.push(ProjectGroup {
                project_id: key,
                open: open.into_iter().map(&view_for).collect(),
                completed: completed.into_iter().map(&view_for).collect(),
            });
        }
        human.push_summary("Groups", groups.len().to_string());
        ListOutput {
            view: name,
            groups: Some(groups),
            tasks: None,
        }
    } else {
        let tasks: Vec<Task> = store
            .tasks(partition)
            .into_iter()
            .filter(|task| project_id.is_none() || task.project_id == project_id)
            .collect();
        human.push_summary("Count", tasks.len().to_string());
        for task in &tasks {
            human.push_detail(describe(task));
        }
        if partition == Partition::Trashed && !tasks.is_empty() {
            human.push_next_step("snail task empty-trash");
        }
        ListOutput {
            view: name,
            groups: None,
            tasks: Some(tasks.into_iter().map(&view_for).collect()),
        }
    };

    emit_success(session.output(), "task list", &output, Some(&human))
}

fn run_move(
    session: &Session,
    from: usize,
    to: usize,
    project: Option<String>,
    completed: bool,
) -> Result<()> {
    let project_id = match project {
        Some(raw) => Some(resolve_project(session, &raw)?),
        None => None,
    };
    let outcome = session.block_on(session.sync.reorder(
        project_id.as_deref(),
        from,
        to,
        completed,
    ))?;

    let (output, header) = match outcome {
        ReorderOutcome::Unchanged => (
            MoveOutput {
                status: "unchanged",
                moved_id: None,
                writes: 0,
                renumbered: false,
            },
            "Order unchanged",
        ),
        ReorderOutcome::Saved(plan) => (
            MoveOutput {
                status: "saved",
                writes: plan.updates.len(),
                renumbered: plan.is_renumber(),
                moved_id: Some(plan.moved_id),
            },
            "Task moved",
        ),
        ReorderOutcome::Queued => (
            MoveOutput {
                status: "queued",
                moved_id: None,
                writes: 0,
                renumbered: false,
            },
            "Move queued",
        ),
    };

    let mut human = HumanOutput::new(header);
    human.push_summary("From", from.to_string());
    human.push_summary("To", to.to_string());
    if output.renumbered {
        human.push_warning(format!("list renumbered ({} writes)", output.writes));
    }
    emit_success(session.output(), "task move", &output, Some(&human))
}

fn run_history(session: &Session, raw: &str) -> Result<()> {
    let id = resolve_task(session, raw)?;
    let records: Vec<ActivityRecord> = session.block_on(session.sync.activity_for(&id))?;

    let mut human = HumanOutput::new("Task history");
    human.push_summary("ID", id);
    human.push_summary("Entries", records.len().to_string());
    for record in &records {
        human.push_detail(format!(
            "{} {} {}",
            record.created_at.format("%Y-%m-%d %H:%M"),
            record.action.as_str(),
            record.metadata
        ));
    }
    emit_success(session.output(), "task history", &records, Some(&human))
}

fn emit_task(session: &Session, command: &str, header: &str, task: Task) -> Result<()> {
    let mut human = HumanOutput::new(header);
    human.push_summary("ID", task.id.clone());
    human.push_summary("Title", task.title.clone());
    emit_success(session.output(), command, &task, Some(&human))
}

fn describe(task: &Task) -> String {
    let mut line = format!("{} {}", short_id(&task.id), task.title);
    if task.flagged {
        line.push_str(" (flagged)");
    }
    if let Some(date) = task.date {
        line.push_str(&format!(" due {date}"));
    }
    line
}

fn tag_names(tags: &[Tag]) -> Vec<String> {
    tags.iter().map(|tag| tag.name.clone()).collect()
}

/// Any task the session has loaded, by id or unique prefix.
pub(crate) fn resolve_task(session: &Session, raw: &str) -> Result<String> {
    let store = session.sync.store();
    let tasks: Vec<Task> = [Partition::Active, Partition::Trashed, Partition::Abandoned]
        .into_iter()
        .flat_map(|partition| store.tasks(partition))
        .collect();
    resolve_id("task", raw, tasks.iter().map(|task| task.id.as_str()))
}

pub(crate) fn resolve_project(session: &Session, raw: &str) -> Result<String> {
    let projects = session.block_on(session.sync.adapter().list_projects())?;
    resolve_id("project", raw, projects.iter().map(|project| project.id.as_str()))
}
