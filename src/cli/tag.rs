//! snail tag command implementations.

use serde::Serialize;

use crate::cli::task::{resolve_project, resolve_task};
use crate::cli::{resolve_id, short_id, Session, TagCommands};
use crate::error::Result;
use crate::model::{Tag, TagScope};
use crate::output::{emit_success, HumanOutput};

#[derive(Serialize)]
struct TagView {
    #[serde(flatten)]
    tag: Tag,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<usize>,
}

#[derive(Serialize)]
struct LinkOutput<'a> {
    task_id: &'a str,
    tag_id: &'a str,
}

pub(crate) fn run(session: Session, cmd: TagCommands) -> Result<()> {
    match cmd {
        TagCommands::Add { name, project } => {
            let scope = match project {
                Some(raw) => TagScope::Project(resolve_project(&session, &raw)?),
                None => TagScope::Global,
            };
            let tag = session.block_on(session.sync.create_tag(&name, scope))?;
            emit_tag(&session, "tag add", "Tag created", &tag)
        }
        TagCommands::List { project, usage } => run_list(&session, project, usage),
        TagCommands::Rename { id, name } => {
            let id = resolve_tag(&session, &id)?;
            let tag = session.block_on(session.sync.rename_tag(&id, &name))?;
            emit_tag(&session, "tag rename", "Tag renamed", &tag)
        }
        TagCommands::Rm { id } => {
            let id = resolve_tag(&session, &id)?;
            session.block_on(session.sync.delete_tag(&id))?;
            let mut human = HumanOutput::new("Tag deleted");
            human.push_summary("ID", id.clone());
            emit_success(
                session.output(),
                "tag rm",
                &serde_json::json!({ "id": id }),
                Some(&human),
            )
        }
        TagCommands::Attach { task, tag } => {
            let task_id = resolve_task(&session, &task)?;
            let tag_id = resolve_tag(&session, &tag)?;
            session.block_on(session.sync.attach_tag(&task_id, &tag_id))?;
            emit_link(&session, "tag attach", "Tag attached", &task_id, &tag_id)
        }
        TagCommands::Detach { task, tag } => {
            let task_id = resolve_task(&session, &task)?;
            let tag_id = resolve_tag(&session, &tag)?;
            session.block_on(session.sync.detach_tag(&task_id, &tag_id))?;
            emit_link(&session, "tag detach", "Tag detached", &task_id, &tag_id)
        }
    }
}

fn run_list(session: &Session, project: Option<String>, with_usage: bool) -> Result<()> {
    let project_id = match project {
        Some(raw) => Some(resolve_project(session, &raw)?),
        None => None,
    };
    let tags = session.block_on(session.sync.list_tags(project_id.as_deref()))?;
    let usage = with_usage.then(|| session.sync.tag_usage());

    let mut human = HumanOutput::new("Tags");
    human.push_summary("Count", tags.len().to_string());
    let views: Vec<TagView> = tags
        .into_iter()
        .map(|tag| {
            let count = usage
                .as_ref()
                .map(|usage| usage.get(&tag.id).copied().unwrap_or(0));
            let scope = match tag.project_id.as_deref() {
                Some(id) => short_id(id).to_string(),
                None => "global".to_string(),
            };
            let mut line = format!("{} {} ({scope})", short_id(&tag.id), tag.name);
            if let Some(count) = count {
                line.push_str(&format!(" x{count}"));
            }
            human.push_detail(line);
            TagView { tag, usage: count }
        })
        .collect();
    emit_success(session.output(), "tag list", &views, Some(&human))
}

fn emit_tag(session: &Session, command: &str, header: &str, tag: &Tag) -> Result<()> {
    let mut human = HumanOutput::new(header);
    human.push_summary("ID", tag.id.clone());
    human.push_summary("Name", tag.name.clone());
    human.push_summary("Scope", tag.scope().cache_key().to_string());
    emit_success(session.output(), command, tag, Some(&human))
}

fn emit_link(
    session: &Session,
    command: &str,
    header: &str,
    task_id: &str,
    tag_id: &str,
) -> Result<()> {
    let mut human = HumanOutput::new(header);
    human.push_summary("Task", task_id.to_string());
    human.push_summary("Tag", tag_id.to_string());
    emit_success(
        session.output(),
        command,
        &LinkOutput { task_id, tag_id },
        Some(&human),
    )
}

fn resolve_tag(session: &Session, raw: &str) -> Result<String> {
    let tags = session.block_on(session.sync.tags().list_every_tag(session.sync.adapter().as_ref()))?;
    resolve_id("tag", raw, tags.iter().map(|tag| tag.id.as_str()))
}
